//! YAML configuration schema (§6).

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, Result};

/// One configured port-forward range, as written in YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortForwardConfig {
    /// `{port: 2222, description: "ssh"}`.
    Single {
        /// The single host port.
        port: u16,
        /// Human-readable label.
        description: String,
    },
    /// `{span: [9000, 9100], description: "apps"}`.
    Span {
        /// `[start, end]`, inclusive.
        span: (u16, u16),
        /// Human-readable label.
        description: String,
    },
}

impl From<&PortForwardConfig> for vmfleet_net::PortRange {
    fn from(cfg: &PortForwardConfig) -> Self {
        match cfg {
            PortForwardConfig::Single { port, description } => Self::Single {
                port: *port,
                description: description.clone(),
            },
            PortForwardConfig::Span { span, description } => Self::Span {
                start: span.0,
                end: span.1,
                description: description.clone(),
            },
        }
    }
}

/// Process-wide configuration, loaded once at startup from a YAML file (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP listen address.
    pub host: String,
    /// HTTP listen port.
    pub port: u16,
    /// Directory under which per-VM runtime state lives.
    pub state_dir: PathBuf,
    /// Name of the shared host bridge.
    pub bridge_name: String,
    /// Bridge's own address, e.g. `10.20.1.1`.
    pub bridge_ip: Ipv4Addr,
    /// Bridge address prefix length, e.g. `24`.
    pub bridge_cidr: u8,
    /// Subnet in CIDR notation for the masquerade rule, e.g. `10.20.1.0/24`.
    pub bridge_subnet_cidr: String,
    /// Path to the hypervisor binary.
    pub chv_bin: PathBuf,
    /// Default kernel image path.
    pub kernel: PathBuf,
    /// Default initramfs path.
    pub initramfs: PathBuf,
    /// Configured host port ranges.
    #[serde(default)]
    pub port_forwards: Vec<PortForwardConfig>,
    /// Stateful scratch disk size, in MiB.
    pub stateful_size_in_mb: u64,
    /// Memory budget for each VM, as a percentage of host RAM.
    pub guest_mem_percentage: u8,
    /// Default NFS root-filesystem server.
    #[serde(default)]
    pub nfs_server: Option<String>,
    /// Default NFS root-filesystem port.
    #[serde(default)]
    pub nfs_port: Option<u16>,
    /// Default NFS export path.
    #[serde(default)]
    pub nfs_path: Option<String>,
}

impl Config {
    /// Parses configuration from a YAML file, failing fast with a descriptive
    /// error rather than panicking on a missing or malformed field.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("reading config {}: {e}", path.display())))?;
        serde_yaml::from_str(&text)
            .map_err(|e| Error::Internal(format!("parsing config {}: {e}", path.display())))
    }

    /// The bridge subnet's network address and prefix length.
    #[must_use]
    pub fn bridge_subnet(&self) -> (Ipv4Addr, u8) {
        let base = self
            .bridge_subnet_cidr
            .split('/')
            .next()
            .unwrap_or("0.0.0.0")
            .parse()
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        (base, self.bridge_cidr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r"
host: 0.0.0.0
port: 8080
state_dir: /var/lib/vmfleet
bridge_name: vmbr0
bridge_ip: 10.20.1.1
bridge_cidr: 24
bridge_subnet_cidr: 10.20.1.0/24
chv_bin: /usr/local/bin/cloud-hypervisor
kernel: /var/lib/vmfleet/vmlinux
initramfs: /var/lib/vmfleet/initramfs
stateful_size_in_mb: 256
guest_mem_percentage: 10
nfs_server: 127.0.0.1
nfs_port: 11111
nfs_path: /export/root
";
        let cfg: Config = serde_yaml::from_str(yaml).expect("valid config");
        assert_eq!(cfg.bridge_name, "vmbr0");
        assert_eq!(cfg.nfs_port, Some(11111));
    }
}
