//! Error type shared by the IP allocator, port-forward manager, and network fabric.

use std::io;

/// Failures surfaced by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The bridge subnet has no more free host addresses.
    #[error("address space exhausted")]
    AddressExhausted,
    /// A single-port range is already reserved.
    #[error("port {0} is already reserved")]
    PortReserved(u16),
    /// A span range has no free ports left.
    #[error("no free port in span {0}-{1}")]
    SpanExhausted(u16, u16),
    /// An external helper (`ip`, `iptables`) exited non-zero.
    #[error("`{cmd}` failed ({status}): {stderr}")]
    CommandFailed {
        /// The command line that was run, for diagnostics.
        cmd: String,
        /// The process exit status.
        status: std::process::ExitStatus,
        /// Captured stderr.
        stderr: String,
    },
    /// Spawning an external helper failed outright.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, Error>;
