//! Error taxonomy for the control plane (§7). One enum, one set of kinds;
//! the HTTP status mapping lives entirely at the server's `IntoResponse` boundary.

use thiserror::Error;

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every way a control-plane operation can fail.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-range request body.
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested VM already exists, or is in a state that forbids the operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No VM (or session) with the given name exists.
    #[error("not found: {0}")]
    NotFound(String),

    /// The subnet or a configured port range has no capacity left.
    #[error("resources exhausted: {0}")]
    ResourcesExhausted(String),

    /// The hypervisor's control socket could not be reached at all.
    #[error("hypervisor unreachable: {0}")]
    HypervisorUnreachable(String),

    /// The hypervisor answered, but rejected the call.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// A callback session exists for the VM but the `session_id` is stale.
    #[error("no session: {0}")]
    NoSession(String),

    /// The session exists but its socket has already been closed.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// A bounded work queue (e.g. the callback dispatch channel) is full.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// An operation did not complete within its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Anything else: I/O, serialization, or a broken invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<vmfleet_net::Error> for Error {
    fn from(err: vmfleet_net::Error) -> Self {
        match err {
            vmfleet_net::Error::AddressExhausted => {
                Self::ResourcesExhausted("no guest IPs left in the bridge subnet".into())
            }
            vmfleet_net::Error::PortReserved(p) => {
                Self::Conflict(format!("host port {p} is already reserved"))
            }
            vmfleet_net::Error::SpanExhausted(start, end) => {
                Self::ResourcesExhausted(format!("no free port in span {start}-{end}"))
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
