//! JSON request/response bodies for the HTTP surface (§6).
//!
//! These are pure data types with no I/O; `vmfleet-server` deserializes
//! requests into them and serializes responses out of them.

use serde::{Deserialize, Serialize};

/// Body of `POST /v1/vms`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartVmRequest {
    /// Required, non-empty, unique VM name.
    pub vm_name: String,
    /// Overrides the configured kernel image path.
    #[serde(default)]
    pub kernel: Option<String>,
    /// Overrides the configured initramfs path.
    #[serde(default)]
    pub initramfs: Option<String>,
    /// Command passed to the in-guest agent at boot.
    #[serde(default)]
    pub entry_point: Option<String>,
    /// Restore from this snapshot instead of a fresh boot.
    #[serde(default)]
    pub snapshot_id: Option<String>,
    /// Overrides the configured NFS root-filesystem server.
    #[serde(default)]
    pub nfs_server: Option<String>,
    /// Overrides the configured NFS root-filesystem port.
    #[serde(default)]
    pub nfs_port: Option<u16>,
    /// Overrides the configured NFS export path.
    #[serde(default)]
    pub nfs_path: Option<String>,
    /// Direct-HTTP callback destination, baked into the kernel command line.
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// Body of `PATCH /v1/vms/{name}`.
#[derive(Debug, Clone, Deserialize)]
pub struct PatchVmRequest {
    /// One of `stopped`, `paused`, `resume`.
    pub status: String,
}

/// A single `(host_port, guest_port, description)` forward, as seen externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardView {
    /// Host-side listening port.
    pub host_port: u16,
    /// Guest-side destination port.
    pub guest_port: u16,
    /// Human-readable label from configuration.
    pub description: String,
}

/// Returned by `POST /v1/vms`, `GET /v1/vms/{name}`, and PATCH transitions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmResponse {
    /// The VM's unique name.
    pub vm_name: String,
    /// Current lifecycle state (`booting`, `running`, `paused`, `stopping`, `stopped`).
    pub status: String,
    /// Allocated guest IP address, if any.
    pub guest_ip: Option<String>,
    /// Deterministically-named tap device backing this VM.
    pub tap_device: Option<String>,
    /// Host ports forwarded to this VM.
    pub port_forwards: Vec<PortForwardView>,
}

/// Alias used for the 200 response to `POST /v1/vms`.
pub type StartVmResponse = VmResponse;

/// Returned by `GET /v1/vms`.
#[derive(Debug, Clone, Serialize)]
pub struct VmListResponse {
    /// One entry per live VM.
    pub vms: Vec<VmResponse>,
}

/// Body of `POST /v1/vms/{name}/snapshots`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SnapshotRequest {
    /// Caller-chosen snapshot identifier; a fresh one is minted if absent.
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

/// Returned by `POST /v1/vms/{name}/snapshots`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    /// The snapshot identifier used (caller-chosen or freshly minted).
    pub snapshot_id: String,
}

/// Body of `POST /v1/vms/{name}/cmd`.
#[derive(Debug, Clone, Deserialize)]
pub struct CmdRequest {
    /// Opaque command string, forwarded to the guest agent as a callback method `"cmd"`.
    pub cmd: String,
    /// Accepted for compatibility; the core always waits for a response (open question, §9).
    #[serde(default)]
    pub blocking: Option<bool>,
}

/// One file to write, part of `POST /v1/vms/{name}/files`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileUpload {
    /// Absolute path inside the guest.
    pub path: String,
    /// File content (already text/base64 per the caller's agent convention; opaque to the core).
    pub content: String,
}

/// Body of `POST /v1/vms/{name}/files`.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesUploadRequest {
    /// Files to write.
    pub files: Vec<FileUpload>,
}

/// Per-file outcome returned by `POST /v1/vms/{name}/files`.
#[derive(Debug, Clone, Serialize)]
pub struct FileUploadStatus {
    /// The path that was written.
    pub path: String,
    /// Whether the guest reported success.
    pub ok: bool,
    /// Error detail, when `ok` is `false`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-file content returned by `GET /v1/vms/{name}/files`.
#[derive(Debug, Clone, Serialize)]
pub struct FileDownload {
    /// The requested path.
    pub path: String,
    /// File content, when read succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Error detail, when read failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `POST /internal/callback`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalCallbackRequest {
    /// The originating VM's name.
    pub vm_name: String,
    /// Opaque method name.
    pub method: String,
    /// Opaque parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process is serving requests.
    pub status: &'static str,
    /// Wall-clock seconds at the time of the check.
    pub timestamp: u64,
}

/// The stable JSON error shape returned on every non-2xx response (§7).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Wraps a single human-readable message.
    pub error: ErrorMessage,
}

/// Inner payload of [`ErrorBody`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    /// Human-readable description of the failure.
    pub message: String,
}

impl ErrorBody {
    /// Wraps a message in the stable error shape.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: ErrorMessage {
                message: message.into(),
            },
        }
    }
}
