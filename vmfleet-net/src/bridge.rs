//! Host bridge and per-VM tap device lifecycle (§4.3).
//!
//! Every operation shells out to the `ip` command-line tool, the same
//! "drive a well-known external binary and check its exit status" idiom
//! the hypervisor adapter uses for the hypervisor binary and the
//! port-forward manager uses for `iptables`.

use std::net::Ipv4Addr;
use std::process::Command;

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Creates the shared bridge once, then creates/destroys per-VM taps on it.
#[derive(Debug, Clone)]
pub struct NetworkFabric {
    bridge_name: String,
    bridge_ip: Ipv4Addr,
    prefix_len: u8,
    subnet_cidr: String,
}

impl NetworkFabric {
    /// Builds a fabric bound to `bridge_name`, configured with `bridge_ip/prefix_len`
    /// and a masquerade rule for `subnet_cidr` (e.g. `10.20.1.0/24`).
    #[must_use]
    pub fn new(bridge_name: impl Into<String>, bridge_ip: Ipv4Addr, prefix_len: u8, subnet_cidr: impl Into<String>) -> Self {
        Self {
            bridge_name: bridge_name.into(),
            bridge_ip,
            prefix_len,
            subnet_cidr: subnet_cidr.into(),
        }
    }

    /// Deterministic tap name for `vm_name`, shared by creation and teardown.
    #[must_use]
    pub fn tap_name(vm_name: &str) -> String {
        format!("tap-{vm_name}")
    }

    /// Brings the bridge up, assigns its address, enables forwarding, and
    /// installs the subnet's masquerade rule. Idempotent against state left
    /// over from a prior crashed process.
    pub fn ensure_bridge(&self) -> Result<()> {
        if !link_exists(&self.bridge_name)? {
            run_ip(&["link", "add", &self.bridge_name, "type", "bridge"])?;
            info!(bridge = %self.bridge_name, "created bridge");
        } else {
            debug!(bridge = %self.bridge_name, "bridge already exists");
        }

        let addr = format!("{}/{}", self.bridge_ip, self.prefix_len);
        // `ip addr add` fails with "File exists" if already assigned; idempotent by design.
        let _ = run_ip(&["addr", "add", &addr, "dev", &self.bridge_name]);
        run_ip(&["link", "set", &self.bridge_name, "up"])?;

        std::fs::write("/proc/sys/net/ipv4/ip_forward", b"1\n")?;

        ensure_masquerade(&self.subnet_cidr)?;
        Ok(())
    }

    /// Creates (idempotently) a tap device for `vm_name`, enslaves it to the
    /// bridge, and brings it up.
    pub fn create_tap(&self, vm_name: &str) -> Result<String> {
        let tap = Self::tap_name(vm_name);
        if !link_exists(&tap)? {
            run_ip(&["tuntap", "add", &tap, "mode", "tap"])?;
        }
        run_ip(&["link", "set", &tap, "master", &self.bridge_name])?;
        run_ip(&["link", "set", &tap, "up"])?;
        Ok(tap)
    }

    /// Brings a tap down and deletes it. Idempotent: a missing device is not an error.
    pub fn destroy_tap(&self, tap: &str) -> Result<()> {
        if !link_exists(tap)? {
            return Ok(());
        }
        let _ = run_ip(&["link", "set", tap, "down"]);
        run_ip(&["link", "delete", tap])
    }
}

fn link_exists(name: &str) -> Result<bool> {
    let output = Command::new("ip").args(["link", "show", name]).output()?;
    Ok(output.status.success())
}

fn ensure_masquerade(subnet_cidr: &str) -> Result<()> {
    let check = Command::new("iptables")
        .args([
            "-t",
            "nat",
            "-C",
            "POSTROUTING",
            "-s",
            subnet_cidr,
            "!",
            "-d",
            subnet_cidr,
            "-j",
            "MASQUERADE",
        ])
        .output()?;
    if check.status.success() {
        return Ok(());
    }
    let output = Command::new("iptables")
        .args([
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            subnet_cidr,
            "!",
            "-d",
            subnet_cidr,
            "-j",
            "MASQUERADE",
        ])
        .output()?;
    if output.status.success() {
        return Ok(());
    }
    Err(Error::CommandFailed {
        cmd: format!("iptables -t nat -A POSTROUTING -s {subnet_cidr} ... -j MASQUERADE"),
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip").args(args).output()?;
    if output.status.success() {
        return Ok(());
    }
    Err(Error::CommandFailed {
        cmd: format!("ip {}", args.join(" ")),
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_name_is_deterministic() {
        assert_eq!(NetworkFabric::tap_name("alpha"), "tap-alpha");
        assert_eq!(NetworkFabric::tap_name("alpha"), NetworkFabric::tap_name("alpha"));
    }
}
