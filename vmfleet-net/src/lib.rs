//! Network plumbing for the vmfleet control plane: guest IP allocation,
//! NAT port-forwarding, and host bridge/tap lifecycle (§4.1-§4.3).
//!
//! Nothing in this crate knows about VM lifecycle or the hypervisor; it
//! operates purely on addresses, ports, and device names, and is driven
//! entirely by the `ip` and `iptables` command-line tools.

mod bridge;
mod error;
mod ip;
mod portforward;

pub use bridge::NetworkFabric;
pub use error::{Error, Result};
pub use ip::IpAllocator;
pub use portforward::{Forward, PortForwardManager, PortRange};
