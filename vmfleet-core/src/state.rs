//! The VM record (§3) and its on-disk sidecar (§3.1).

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where a VM's root filesystem comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootSource {
    /// NFS server address.
    pub server: String,
    /// NFS server port.
    pub port: u16,
    /// Exported path on the server.
    pub path: String,
}

/// The guest-side command run at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPoint {
    /// Executable path inside the guest.
    pub exec_path: String,
    /// Arguments passed to `exec_path`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables set for the guest process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A leased host port forwarded into the guest, as surfaced on the VM record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortForwardRecord {
    /// Host-side listening port.
    pub host_port: u16,
    /// Guest-side destination port.
    pub guest_port: u16,
    /// Label carried over from configuration.
    pub description: String,
}

/// Lifecycle states of the state machine in §4.5. `Destroyed` is terminal
/// and is never written back to disk: a destroyed VM's sidecar is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// Record created, hypervisor child spawned, not yet confirmed booted.
    Booting,
    /// Hypervisor has confirmed the guest is up and servicing callbacks.
    Running,
    /// Guest execution is suspended; the hypervisor still holds the VM open.
    Paused,
    /// A stop request is in flight.
    Stopping,
    /// The hypervisor child has exited; resources may still be reserved.
    Stopped,
}

/// The durable record for one VM: everything needed to resume managing it
/// after a process restart, minus the in-memory hypervisor handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    /// Unique, user-chosen name; also the sidecar directory name.
    pub vm_name: String,
    /// Leased guest address.
    pub guest_ip: Ipv4Addr,
    /// Tap device name backing this VM's network interface.
    pub tap_device: String,
    /// Unix-socket path the hypervisor adapter speaks to.
    pub control_socket_path: PathBuf,
    /// Current lifecycle state.
    pub state: VmState,
    /// Path to this VM's stateful scratch disk image.
    pub stateful_disk_path: PathBuf,
    /// Ports forwarded from the host into this VM.
    pub port_forwards: Vec<PortForwardRecord>,
    /// Root filesystem source.
    pub root_source: RootSource,
    /// Guest boot command.
    pub entry_point: EntryPoint,
    /// Hypervisor child's OS process id, once spawned.
    pub hypervisor_pid: Option<u32>,
}

impl VmRecord {
    /// Path to this record's sidecar file under `state_dir`.
    #[must_use]
    pub fn sidecar_path(state_dir: &Path, vm_name: &str) -> PathBuf {
        state_dir.join(vm_name).join("record.json")
    }

    /// Atomically persists the record: write to a temp file in the same
    /// directory, then rename over the sidecar, so a crash mid-write never
    /// leaves a truncated record behind.
    pub fn save(&self, state_dir: &Path) -> Result<()> {
        let dir = state_dir.join(&self.vm_name);
        std::fs::create_dir_all(&dir)?;
        let final_path = dir.join("record.json");
        let tmp_path = dir.join("record.json.tmp");
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Loads a single record from its sidecar file. A record found with
    /// `state: running` (or `booting`/`paused`) is downgraded to `stopped`:
    /// its hypervisor child did not survive the restart that is reading it.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let mut record: Self = serde_json::from_slice(&bytes)?;
        if matches!(record.state, VmState::Running | VmState::Paused | VmState::Booting) {
            record.state = VmState::Stopped;
            record.hypervisor_pid = None;
        }
        Ok(record)
    }

    /// Scans `state_dir` for `<vm_name>/record.json` sidecars, loading each.
    pub fn load_all(state_dir: &Path) -> Result<Vec<Self>> {
        if !state_dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(state_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let sidecar = entry.path().join("record.json");
            if sidecar.is_file() {
                records.push(Self::load(&sidecar)?);
            }
        }
        Ok(records)
    }

    /// Removes this record's sidecar directory entirely. Idempotent.
    pub fn delete(state_dir: &Path, vm_name: &str) -> Result<()> {
        let dir = state_dir.join(vm_name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Validates a user-supplied VM name: must be non-empty, ASCII alphanumeric
/// plus `-`/`_`, and reasonably short so it is safe to use as a directory
/// and tap-device-name component.
pub fn validate_vm_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(Error::Validation(format!(
            "vm_name must be 1-63 characters, got {}",
            name.len()
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(Error::Validation(
            "vm_name may only contain ASCII letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> VmRecord {
        VmRecord {
            vm_name: name.to_owned(),
            guest_ip: Ipv4Addr::new(10, 20, 1, 2),
            tap_device: "tap-alpha".into(),
            control_socket_path: PathBuf::from("/tmp/alpha.sock"),
            state: VmState::Running,
            stateful_disk_path: PathBuf::from("/tmp/alpha.img"),
            port_forwards: vec![PortForwardRecord {
                host_port: 2222,
                guest_port: 2222,
                description: "ssh".into(),
            }],
            root_source: RootSource {
                server: "127.0.0.1".into(),
                port: 11111,
                path: "/export/root".into(),
            },
            entry_point: EntryPoint {
                exec_path: "/bin/sh".into(),
                args: vec![],
                env: BTreeMap::new(),
            },
            hypervisor_pid: Some(4242),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let record = sample("alpha");
        record.save(dir.path()).unwrap();
        let loaded = VmRecord::load(&VmRecord::sidecar_path(dir.path(), "alpha")).unwrap();
        assert_eq!(loaded.vm_name, "alpha");
        assert_eq!(loaded.guest_ip, record.guest_ip);
    }

    #[test]
    fn loading_a_running_record_downgrades_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let record = sample("beta");
        record.save(dir.path()).unwrap();
        let loaded = VmRecord::load(&VmRecord::sidecar_path(dir.path(), "beta")).unwrap();
        assert_eq!(loaded.state, VmState::Stopped);
        assert!(loaded.hypervisor_pid.is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        VmRecord::delete(dir.path(), "missing").unwrap();
        VmRecord::delete(dir.path(), "missing").unwrap();
    }

    #[test]
    fn validate_vm_name_rejects_bad_characters() {
        assert!(validate_vm_name("my-vm_1").is_ok());
        assert!(validate_vm_name("").is_err());
        assert!(validate_vm_name("has space").is_err());
        assert!(validate_vm_name(&"a".repeat(64)).is_err());
    }
}
