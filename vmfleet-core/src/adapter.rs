//! The hypervisor adapter (§4.4): spawns the external hypervisor binary and
//! drives its control socket with blocking, synchronous REST calls.
//!
//! The hypervisor is treated as an opaque subprocess exposing an HTTP API
//! over a unix-domain socket, the same shape cloud-hypervisor's own
//! `--api-socket` exposes: `PUT /api/v1/vm.create`, `vm.boot`, `vm.pause`,
//! `vm.resume`, `vm.shutdown`, `vm.snapshot`, `vm.restore`, `vm.delete`, and
//! `GET /api/v1/vm.info`. Every call blocks the calling thread on socket I/O,
//! so callers run it inside [`tokio::task::spawn_blocking`].

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Parameters needed to ask the hypervisor to create a VM.
#[derive(Debug, Clone, Serialize)]
pub struct CreateVmSpec {
    /// Virtual CPU count.
    pub vcpus: u8,
    /// Memory budget, in MiB.
    pub memory_mib: u64,
    /// Kernel image path.
    pub kernel: PathBuf,
    /// Initramfs path.
    pub initramfs: PathBuf,
    /// Kernel command line, including the NFS root and entry-point payload.
    pub cmdline: String,
    /// Host tap device backing the guest's network interface.
    pub tap_device: String,
    /// Guest-facing MAC address.
    pub guest_mac: String,
    /// Path to the stateful scratch disk image.
    pub stateful_disk_path: PathBuf,
    /// Base path for the vsock unix-domain socket the hypervisor multiplexes
    /// guest-initiated connections through (`<base>_<port>` per listener).
    pub vsock_socket_path: PathBuf,
    /// Guest CID assigned to this VM's vsock device.
    pub vsock_cid: u32,
}

/// Holds the spawned hypervisor subprocess and the unix socket used to
/// control it. Dropping this without calling [`HypervisorAdapter::shutdown`]
/// leaves the child running; callers are expected to shut down explicitly.
pub struct HypervisorAdapter {
    vm_name: String,
    api_socket_path: PathBuf,
    child: Child,
}

impl HypervisorAdapter {
    /// Spawns the hypervisor binary with its control socket at
    /// `api_socket_path`. The socket does not exist yet when this returns;
    /// callers must poll with [`HypervisorAdapter::wait_ready`].
    pub async fn spawn(chv_bin: &Path, vm_name: &str, api_socket_path: &Path) -> Result<Self> {
        if let Some(parent) = api_socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_file(api_socket_path).await;

        let child = Command::new(chv_bin)
            .arg("--api-socket")
            .arg(api_socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::HypervisorUnreachable(format!("spawning {}: {e}", chv_bin.display())))?;

        info!(vm_name, pid = child.id(), "spawned hypervisor child");
        Ok(Self {
            vm_name: vm_name.to_owned(),
            api_socket_path: api_socket_path.to_owned(),
            child,
        })
    }

    /// The hypervisor child's OS process id, if it is still known to be running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Polls the control socket until it accepts connections or `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let socket_path = self.api_socket_path.clone();
        loop {
            let path = socket_path.clone();
            let reachable =
                tokio::task::spawn_blocking(move || UnixStream::connect(&path).is_ok())
                    .await
                    .unwrap_or(false);
            if reachable {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "hypervisor control socket for {} never became ready",
                    self.vm_name
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// `PUT /api/v1/vm.create`.
    pub async fn create_vm(&self, spec: &CreateVmSpec) -> Result<()> {
        self.call("PUT", "/api/v1/vm.create", Some(serde_json::to_value(spec)?))
            .await
            .map(|_| ())
    }

    /// `PUT /api/v1/vm.boot`.
    pub async fn boot_vm(&self) -> Result<()> {
        self.call("PUT", "/api/v1/vm.boot", None).await.map(|_| ())
    }

    /// `PUT /api/v1/vm.pause`.
    pub async fn pause_vm(&self) -> Result<()> {
        self.call("PUT", "/api/v1/vm.pause", None).await.map(|_| ())
    }

    /// `PUT /api/v1/vm.resume`.
    pub async fn resume_vm(&self) -> Result<()> {
        self.call("PUT", "/api/v1/vm.resume", None).await.map(|_| ())
    }

    /// `PUT /api/v1/vm.shutdown`.
    pub async fn shutdown_vm(&self) -> Result<()> {
        self.call("PUT", "/api/v1/vm.shutdown", None).await.map(|_| ())
    }

    /// `PUT /api/v1/vm.snapshot`, writing snapshot artifacts under `destination`.
    pub async fn snapshot_vm(&self, destination: &Path) -> Result<()> {
        let body = serde_json::json!({ "destination_url": format!("file://{}", destination.display()) });
        self.call("PUT", "/api/v1/vm.snapshot", Some(body)).await.map(|_| ())
    }

    /// `PUT /api/v1/vm.restore`, restoring from a snapshot previously written at `source`.
    pub async fn restore_vm(&self, source: &Path) -> Result<()> {
        let body = serde_json::json!({ "source_url": format!("file://{}", source.display()) });
        self.call("PUT", "/api/v1/vm.restore", Some(body)).await.map(|_| ())
    }

    /// `GET /api/v1/vm.info`.
    pub async fn info(&self) -> Result<Value> {
        self.call("GET", "/api/v1/vm.info", None)
            .await?
            .ok_or_else(|| Error::Hypervisor("vm.info returned an empty body".into()))
    }

    /// `PUT /api/v1/vm.delete`, then terminates the hypervisor child.
    pub async fn destroy(mut self) -> Result<()> {
        let _ = self.call("PUT", "/api/v1/vm.delete", None).await;
        if let Err(e) = self.child.start_kill() {
            warn!(vm_name = %self.vm_name, error = %e, "killing hypervisor child failed");
        }
        let _ = self.child.wait().await;
        let _ = tokio::fs::remove_file(&self.api_socket_path).await;
        Ok(())
    }

    async fn call(&self, method: &str, path: &str, body: Option<Value>) -> Result<Option<Value>> {
        let socket_path = self.api_socket_path.clone();
        let method = method.to_owned();
        let path = path.to_owned();
        let vm_name = self.vm_name.clone();
        tokio::task::spawn_blocking(move || blocking_call(&socket_path, &method, &path, body, &vm_name))
            .await
            .map_err(|e| Error::Internal(format!("hypervisor call task panicked: {e}")))?
    }
}

fn blocking_call(
    socket_path: &Path,
    method: &str,
    path: &str,
    body: Option<Value>,
    vm_name: &str,
) -> Result<Option<Value>> {
    let mut stream = UnixStream::connect(socket_path).map_err(|e| {
        Error::HypervisorUnreachable(format!("connecting to {} for {vm_name}: {e}", socket_path.display()))
    })?;

    let payload = body.map(|v| v.to_string()).unwrap_or_default();
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    if !payload.is_empty() {
        request.push_str("Content-Type: application/json\r\n");
        request.push_str(&format!("Content-Length: {}\r\n", payload.len()));
    }
    request.push_str("\r\n");
    request.push_str(&payload);

    stream
        .write_all(request.as_bytes())
        .map_err(|e| Error::HypervisorUnreachable(format!("writing to {vm_name}'s control socket: {e}")))?;

    let mut reader = BufReader::new(&stream);
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .map_err(|e| Error::HypervisorUnreachable(format!("reading response from {vm_name}: {e}")))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::Hypervisor(format!("malformed status line from {vm_name}: {status_line:?}")))?;

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        reader
            .read_line(&mut header)
            .map_err(|e| Error::HypervisorUnreachable(format!("reading headers from {vm_name}: {e}")))?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some(value) = header.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let mut body_bytes = vec![0u8; content_length];
    if content_length > 0 {
        reader
            .read_exact(&mut body_bytes)
            .map_err(|e| Error::HypervisorUnreachable(format!("reading body from {vm_name}: {e}")))?;
    }

    if !(200..300).contains(&status) {
        let text = String::from_utf8_lossy(&body_bytes).into_owned();
        return Err(Error::Hypervisor(format!("{vm_name}: {method} {path} -> HTTP {status}: {text}")));
    }
    if body_bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&body_bytes)?))
}

