//! Control-plane core for a fleet of lightweight VMs backed by an external
//! hypervisor process.
//!
//! This crate owns everything above the network layer ([`vmfleet_net`]) and
//! below the HTTP surface: the hypervisor adapter that speaks REST over a
//! unix socket, the VM lifecycle state machine, the datagram-transport
//! bridge guests dial into, and the callback fabric that routes guest RPCs
//! to long-lived client sessions.
//!
//! # Quick start
//!
//! ```no_run
//! use vmfleet_core::{Config, VmManager};
//!
//! # async fn run() -> vmfleet_core::Result<()> {
//! let config = Config::load("/etc/vmfleet/config.yaml".as_ref())?;
//! let manager = VmManager::new(config)?;
//! manager.restore_from_disk().await?;
//! # Ok(())
//! # }
//! ```

mod adapter;
mod config;
mod error;
mod manager;
mod session;
mod state;
mod transport;

pub use adapter::HypervisorAdapter;
pub use config::{Config, PortForwardConfig};
pub use error::{Error, Result};
pub use manager::{CreateVmRequest, VmManager};
pub use session::SessionRegistry;
pub use state::{EntryPoint, PortForwardRecord, RootSource, VmRecord, VmState, validate_vm_name};
pub use transport::TransportBridge;
