//! Wire protocol shared by the datagram-transport bridge, the callback
//! fabric, and the HTTP surface.
//!
//! Three independent vocabularies live here, none of which perform I/O:
//!
//! - [`callback`] — the transport-independent callback envelope (§3).
//! - [`line`] — parsing for the newline-delimited datagram-transport
//!   commands guests send (§4.6).
//! - [`http`] — JSON request/response bodies for the HTTP surface (§6).

mod callback;
mod http;
mod line;

pub use callback::{CallbackError, CallbackRequest, CallbackResponse};
pub use http::{
    CmdRequest, ErrorBody, ErrorMessage, FileDownload, FileUpload, FileUploadStatus,
    FilesUploadRequest, HealthResponse, InternalCallbackRequest, PatchVmRequest,
    PortForwardView, SnapshotRequest, SnapshotResponse, StartVmRequest, StartVmResponse,
    VmListResponse, VmResponse,
};
pub use line::{Command, DecodeError, decode_command, encode_response};
