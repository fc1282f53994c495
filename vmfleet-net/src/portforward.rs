//! Allocates host ports from configured ranges and installs the NAT rules
//! that forward them to guest endpoints (§4.2).

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::process::Command;

use crate::error::{Error, Result};

/// One configured port range: a single port, or an inclusive span, each
/// carrying a human-readable label.
#[derive(Debug, Clone)]
pub enum PortRange {
    /// A single, specific host port.
    Single {
        /// The port number.
        port: u16,
        /// Label surfaced in the VM record's `port_forwards`.
        description: String,
    },
    /// An inclusive span; the lowest free port in the span is picked.
    Span {
        /// Inclusive start of the span.
        start: u16,
        /// Inclusive end of the span.
        end: u16,
        /// Label surfaced in the VM record's `port_forwards`.
        description: String,
    },
}

impl PortRange {
    fn description(&self) -> &str {
        match self {
            Self::Single { description, .. } | Self::Span { description, .. } => description,
        }
    }
}

/// A leased `(host_port, guest_port, description)` triple. The core forwards
/// a host port to the identically-numbered guest port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    /// Host-side listening port.
    pub host_port: u16,
    /// Guest-side destination port (always equal to `host_port`).
    pub guest_port: u16,
    /// Label from the originating [`PortRange`].
    pub description: String,
}

/// Sole writer of the managed NAT chain; reserves host ports from configured
/// ranges and drives `iptables` to expose them.
#[derive(Debug)]
pub struct PortForwardManager {
    chain: String,
    reserved: HashSet<u16>,
}

impl PortForwardManager {
    /// Builds a manager whose NAT rules live in a chain named after the bridge.
    #[must_use]
    pub fn new(bridge_name: &str) -> Self {
        Self {
            chain: format!("VMFLEET-{bridge_name}"),
            reserved: HashSet::new(),
        }
    }

    /// Marks `ports` as already leased, e.g. reconstructed from on-disk VM records.
    pub fn seed<I: IntoIterator<Item = u16>>(&mut self, ports: I) {
        self.reserved.extend(ports);
    }

    /// Reserves one host port per range. Atomic across the whole list: if
    /// any range fails, everything reserved earlier in this call is released
    /// before the error surfaces.
    pub fn reserve(&mut self, ranges: &[PortRange]) -> Result<Vec<Forward>> {
        let mut claimed = Vec::with_capacity(ranges.len());
        for range in ranges {
            match self.reserve_one(range) {
                Ok(fwd) => claimed.push(fwd),
                Err(e) => {
                    for fwd in &claimed {
                        self.reserved.remove(&fwd.host_port);
                    }
                    return Err(e);
                }
            }
        }
        Ok(claimed)
    }

    fn reserve_one(&mut self, range: &PortRange) -> Result<Forward> {
        match range {
            PortRange::Single { port, description } => {
                if !self.reserved.insert(*port) {
                    return Err(Error::PortReserved(*port));
                }
                Ok(Forward {
                    host_port: *port,
                    guest_port: *port,
                    description: description.clone(),
                })
            }
            PortRange::Span { start, end, .. } => {
                for port in *start..=*end {
                    if self.reserved.insert(port) {
                        return Ok(Forward {
                            host_port: port,
                            guest_port: port,
                            description: range.description().to_owned(),
                        });
                    }
                }
                Err(Error::SpanExhausted(*start, *end))
            }
        }
    }

    /// Returns `host_port` to its range's free pool. Idempotent.
    pub fn release(&mut self, host_port: u16) {
        self.reserved.remove(&host_port);
    }

    /// Installs a DNAT rule redirecting `host_port` traffic to `guest_ip:guest_port`.
    pub fn install(&self, host_port: u16, guest_ip: Ipv4Addr, guest_port: u16) -> Result<()> {
        run_iptables(&[
            "-t",
            "nat",
            "-A",
            &self.chain,
            "-p",
            "tcp",
            "--dport",
            &host_port.to_string(),
            "-j",
            "DNAT",
            "--to-destination",
            &format!("{guest_ip}:{guest_port}"),
        ])
    }

    /// Removes the rule installed by [`PortForwardManager::install`].
    /// Idempotent when the rule is already gone.
    pub fn uninstall(&self, host_port: u16, guest_ip: Ipv4Addr, guest_port: u16) -> Result<()> {
        match run_iptables(&[
            "-t",
            "nat",
            "-D",
            &self.chain,
            "-p",
            "tcp",
            "--dport",
            &host_port.to_string(),
            "-j",
            "DNAT",
            "--to-destination",
            &format!("{guest_ip}:{guest_port}"),
        ]) {
            Ok(()) | Err(Error::CommandFailed { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Creates the managed chain and hooks it into `PREROUTING`, if absent.
    /// Idempotent against a chain left over from a prior crashed process.
    pub fn ensure_chain(&self) -> Result<()> {
        let _ = run_iptables(&["-t", "nat", "-N", &self.chain]);
        let check = run_iptables(&["-t", "nat", "-C", "PREROUTING", "-j", &self.chain]);
        if check.is_err() {
            run_iptables(&["-t", "nat", "-A", "PREROUTING", "-j", &self.chain])?;
        }
        Ok(())
    }
}

fn run_iptables(args: &[&str]) -> Result<()> {
    let output = Command::new("iptables").args(args).output()?;
    if output.status.success() {
        return Ok(());
    }
    Err(Error::CommandFailed {
        cmd: format!("iptables {}", args.join(" ")),
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_range_fails_when_already_reserved() {
        let mut mgr = PortForwardManager::new("br0");
        let ranges = vec![PortRange::Single {
            port: 2222,
            description: "ssh".into(),
        }];
        assert!(mgr.reserve(&ranges).is_ok());
        assert!(matches!(
            mgr.reserve(&ranges),
            Err(Error::PortReserved(2222))
        ));
    }

    #[test]
    fn span_picks_lowest_free_port() {
        let mut mgr = PortForwardManager::new("br0");
        let ranges = vec![PortRange::Span {
            start: 9000,
            end: 9002,
            description: "app".into(),
        }];
        let first = mgr.reserve(&ranges).unwrap();
        assert_eq!(first[0].host_port, 9000);
        let second = mgr.reserve(&ranges).unwrap();
        assert_eq!(second[0].host_port, 9001);
    }

    #[test]
    fn reserve_rolls_back_partial_claims_on_failure() {
        let mut mgr = PortForwardManager::new("br0");
        mgr.seed([2222]);
        let ranges = vec![
            PortRange::Single {
                port: 3000,
                description: "a".into(),
            },
            PortRange::Single {
                port: 2222,
                description: "b".into(),
            },
        ];
        assert!(mgr.reserve(&ranges).is_err());
        // 3000 must have been rolled back, so it's reservable again.
        let retry = vec![PortRange::Single {
            port: 3000,
            description: "a".into(),
        }];
        assert!(mgr.reserve(&retry).is_ok());
    }

    #[test]
    fn release_then_reserve_reuses_the_port() {
        let mut mgr = PortForwardManager::new("br0");
        let ranges = vec![PortRange::Single {
            port: 4000,
            description: "x".into(),
        }];
        mgr.reserve(&ranges).unwrap();
        mgr.release(4000);
        assert!(mgr.reserve(&ranges).is_ok());
    }
}
