//! The datagram-transport bridge (§4.6): one unix-domain listener per VM,
//! bound at the path the hypervisor multiplexes a guest vsock port onto.
//!
//! This mirrors how Firecracker and cloud-hypervisor expose vsock: the
//! VMM proxies guest-initiated connections on vsock port `P` to a host
//! listener pre-bound at `<vsock_socket_path>_<P>`. The host never dials
//! out; it only accepts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};
use vmfleet_proto::{CallbackError, CallbackRequest, CallbackResponse, Command, decode_command, encode_response};

use crate::error::Result;
use crate::session::SessionRegistry;

/// Listens for guest-initiated connections on one VM's vsock-mapped socket
/// and routes each decoded line through the callback fabric.
pub struct TransportBridge {
    vm_name: String,
    listener: UnixListener,
    socket_path: PathBuf,
}

impl TransportBridge {
    /// Binds the listener for `vm_name`'s callback port at
    /// `<vsock_socket_path>_<port>`, removing any stale socket file left
    /// behind by a crashed prior process.
    pub async fn bind(vsock_socket_path: &Path, port: u16, vm_name: &str) -> Result<Self> {
        let socket_path = PathBuf::from(format!("{}_{port}", vsock_socket_path.display()));
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_file(&socket_path).await;
        let listener = UnixListener::bind(&socket_path)?;
        Ok(Self {
            vm_name: vm_name.to_owned(),
            listener,
            socket_path,
        })
    }

    /// Accepts connections until the task is aborted, spawning one handler
    /// per connection. Guests dial in once per callback in this protocol,
    /// so connections are short-lived.
    pub async fn run(self, registry: Arc<SessionRegistry>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let vm_name = self.vm_name.clone();
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(&vm_name, stream, &registry).await {
                            debug!(vm_name, error = %e, "callback connection ended with an error");
                        }
                    });
                }
                Err(e) => {
                    warn!(vm_name = %self.vm_name, error = %e, "accept failed on callback socket");
                }
            }
        }
    }
}

impl Drop for TransportBridge {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn handle_connection(vm_name: &str, stream: UnixStream, registry: &Arc<SessionRegistry>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match decode_command(&line) {
            Ok(Command::Callback { method, params }) => {
                let id = uuid::Uuid::new_v4().to_string();
                let request = CallbackRequest::new(id.clone(), method, params);
                registry
                    .dispatch(vm_name, request)
                    .await
                    .unwrap_or_else(|e| CallbackResponse::err(id, CallbackError::new("dispatch_failed", e.to_string())))
            }
            Ok(Command::Verb { verb, body }) => {
                let id = uuid::Uuid::new_v4().to_string();
                let params = serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));
                let request = CallbackRequest::new(id.clone(), verb, params);
                registry
                    .dispatch(vm_name, request)
                    .await
                    .unwrap_or_else(|e| CallbackResponse::err(id, CallbackError::new("dispatch_failed", e.to_string())))
            }
            Err(e) => CallbackResponse::err(
                uuid::Uuid::new_v4().to_string(),
                CallbackError::new("decode_failed", e.to_string()),
            ),
        };

        let encoded = encode_response(&response);
        write_half.write_all(encoded.as_bytes()).await?;
    }
    Ok(())
}
