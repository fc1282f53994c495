//! The HTTP surface (§4.8): thin handlers that validate input, call into
//! [`vmfleet_core::VmManager`], and translate records into wire DTOs.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, http::StatusCode};
use futures_util::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;
use vmfleet_core::{CreateVmRequest, EntryPoint, VmManager, VmState};
use vmfleet_proto::{
    CmdRequest, FileDownload, FileUpload, FileUploadStatus, FilesUploadRequest, HealthResponse,
    InternalCallbackRequest, PatchVmRequest, PortForwardView, SnapshotRequest, SnapshotResponse,
    StartVmRequest, VmListResponse, VmResponse,
};

use crate::error::ApiError;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The VM lifecycle manager backing every route below.
    pub manager: Arc<VmManager>,
}

/// Builds the full router: VM lifecycle routes, the internal callback
/// ingress, and a liveness probe, wrapped in request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/vms", post(create_vm).get(list_vms).delete(destroy_all_vms))
        .route("/v1/vms/{name}", get(get_vm).patch(patch_vm).delete(destroy_vm))
        .route("/v1/vms/{name}/snapshots", post(snapshot_vm))
        .route("/v1/vms/{name}/cmd", post(cmd_vm))
        .route("/v1/vms/{name}/files", post(upload_files).get(download_file))
        .route("/v1/vms/{name}/ws", get(open_session))
        .route("/internal/callback", post(internal_callback))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn state_label(state: VmState) -> &'static str {
    match state {
        VmState::Booting => "booting",
        VmState::Running => "running",
        VmState::Paused => "paused",
        VmState::Stopping => "stopping",
        VmState::Stopped => "stopped",
    }
}

fn to_vm_response(record: vmfleet_core::VmRecord) -> VmResponse {
    VmResponse {
        vm_name: record.vm_name,
        status: state_label(record.state).to_owned(),
        guest_ip: Some(record.guest_ip.to_string()),
        tap_device: Some(record.tap_device),
        port_forwards: record
            .port_forwards
            .into_iter()
            .map(|f| PortForwardView {
                host_port: f.host_port,
                guest_port: f.guest_port,
                description: f.description,
            })
            .collect(),
    }
}

async fn create_vm(State(state): State<AppState>, Json(req): Json<StartVmRequest>) -> Result<Json<VmResponse>, ApiError> {
    let (exec_path, args) = match &req.entry_point {
        Some(raw) => {
            let mut parts = raw.split_whitespace();
            let exec_path = parts.next().unwrap_or("/bin/sh").to_owned();
            (exec_path, parts.map(str::to_owned).collect())
        }
        None => ("/bin/sh".to_owned(), Vec::new()),
    };

    let root_source = if req.nfs_server.is_some() || req.nfs_port.is_some() || req.nfs_path.is_some() {
        Some(vmfleet_core::RootSource {
            server: req.nfs_server.unwrap_or_default(),
            port: req.nfs_port.unwrap_or(2049),
            path: req.nfs_path.unwrap_or_default(),
        })
    } else {
        None
    };

    let record = state
        .manager
        .create(CreateVmRequest {
            vm_name: req.vm_name,
            vcpus: None,
            memory_mib: None,
            entry_point: EntryPoint {
                exec_path,
                args,
                env: std::collections::BTreeMap::new(),
            },
            root_source,
            port_forwards: Vec::new(),
            callback_url: req.callback_url,
        })
        .await?;
    Ok(Json(to_vm_response(record)))
}

async fn list_vms(State(state): State<AppState>) -> Json<VmListResponse> {
    let vms = state.manager.list().await.into_iter().map(to_vm_response).collect();
    Json(VmListResponse { vms })
}

async fn get_vm(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<VmResponse>, ApiError> {
    let record = state.manager.get(&name).await?;
    Ok(Json(to_vm_response(record)))
}

async fn patch_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<PatchVmRequest>,
) -> Result<Json<VmResponse>, ApiError> {
    let record = match req.status.as_str() {
        "paused" => state.manager.pause(&name).await?,
        "resume" | "running" => state.manager.resume(&name).await?,
        "stopped" => state.manager.stop(&name).await?,
        other => {
            return Err(vmfleet_core::Error::Validation(format!("Invalid status value: {other}")).into());
        }
    };
    Ok(Json(to_vm_response(record)))
}

async fn destroy_vm(State(state): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    state.manager.destroy(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn destroy_all_vms(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.manager.destroy_all().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn snapshot_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SnapshotRequest>,
) -> Result<Json<SnapshotResponse>, ApiError> {
    let snapshot_id = req.snapshot_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    state.manager.snapshot(&name, &snapshot_id).await?;
    Ok(Json(SnapshotResponse { snapshot_id }))
}

async fn cmd_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<CmdRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = vmfleet_proto::CallbackRequest::new(uuid::Uuid::new_v4().to_string(), "cmd", serde_json::json!({ "cmd": req.cmd }));
    let response = state.manager.route_callback(&name, request).await?;
    match response.into_result() {
        Ok(value) => Ok(Json(value)),
        Err(e) => Err(vmfleet_core::Error::Hypervisor(e.to_string()).into()),
    }
}

async fn upload_files(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<FilesUploadRequest>,
) -> Result<Json<Vec<FileUploadStatus>>, ApiError> {
    let mut statuses = Vec::with_capacity(req.files.len());
    for file in req.files {
        let status = upload_one(&state, &name, &file).await;
        statuses.push(status);
    }
    Ok(Json(statuses))
}

async fn upload_one(state: &AppState, name: &str, file: &FileUpload) -> FileUploadStatus {
    let request = vmfleet_proto::CallbackRequest::new(
        uuid::Uuid::new_v4().to_string(),
        "upload_file",
        serde_json::json!({ "path": file.path, "content": file.content }),
    );
    match state.manager.route_callback(name, request).await.and_then(|r| r.into_result().map_err(|e| vmfleet_core::Error::Hypervisor(e.to_string()))) {
        Ok(_) => FileUploadStatus { path: file.path.clone(), ok: true, error: None },
        Err(e) => FileUploadStatus { path: file.path.clone(), ok: false, error: Some(e.to_string()) },
    }
}

#[derive(serde::Deserialize)]
struct DownloadQuery {
    paths: String,
}

async fn download_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<Vec<FileDownload>>, ApiError> {
    let mut downloads = Vec::new();
    for path in query.paths.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        downloads.push(download_one(&state, &name, path).await);
    }
    Ok(Json(downloads))
}

async fn download_one(state: &AppState, name: &str, path: &str) -> FileDownload {
    let request = vmfleet_proto::CallbackRequest::new(
        uuid::Uuid::new_v4().to_string(),
        "download_file",
        serde_json::json!({ "path": path }),
    );
    match state.manager.route_callback(name, request).await.and_then(|r| r.into_result().map_err(|e| vmfleet_core::Error::Hypervisor(e.to_string()))) {
        Ok(value) => FileDownload {
            path: path.to_owned(),
            content: value.get("content").and_then(|v| v.as_str()).map(str::to_owned),
            error: None,
        },
        Err(e) => FileDownload { path: path.to_owned(), content: None, error: Some(e.to_string()) },
    }
}

async fn internal_callback(
    State(state): State<AppState>,
    Json(req): Json<InternalCallbackRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = vmfleet_proto::CallbackRequest::new(uuid::Uuid::new_v4().to_string(), req.method, req.params);
    let response = state.manager.route_callback(&req.vm_name, request).await?;
    match response.into_result() {
        Ok(value) => Ok(Json(value)),
        Err(e) => Err(vmfleet_core::Error::Hypervisor(e.to_string()).into()),
    }
}

async fn health() -> Json<HealthResponse> {
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    Json(HealthResponse { status: "ok", timestamp })
}

async fn open_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(state, name, socket))
}

/// Maximum size of a single inbound callback-response frame (§4.7).
const MAX_INBOUND_FRAME_BYTES: usize = 512 * 1024;
/// How long the reader waits for any frame before giving up on the session.
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Ping cadence: 90% of [`READ_DEADLINE`], per §4.7.
const PING_INTERVAL: Duration = Duration::from_secs(54);

async fn run_session(state: AppState, vm_name: String, socket: WebSocket) {
    let sessions = state.manager.sessions();
    let (session_id, mut outbound) = match sessions.open(&vm_name) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(vm_name, error = %e, "rejecting session");
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();
    let forward_task = tokio::spawn(async move {
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => {
                            if sender.send(Message::Text(frame.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_timer.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        let message = match tokio::time::timeout(READ_DEADLINE, receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_)) | None) => break,
            Err(_) => {
                tracing::warn!(vm_name, "closing session after read deadline expired");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                if text.len() > MAX_INBOUND_FRAME_BYTES {
                    tracing::warn!(vm_name, size = text.len(), "rejecting oversized inbound frame");
                    break;
                }
                sessions.handle_client_message(&vm_name, &text);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    forward_task.abort();
    sessions.close(&vm_name, &session_id);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    use vmfleet_core::{EntryPoint, PortForwardRecord, RootSource, VmRecord};

    use super::*;

    fn sample_record() -> VmRecord {
        VmRecord {
            vm_name: "alpha".into(),
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
    fn state_label_covers_every_variant() {
        assert_eq!(state_label(VmState::Booting), "booting");
        assert_eq!(state_label(VmState::Running), "running");
        assert_eq!(state_label(VmState::Paused), "paused");
        assert_eq!(state_label(VmState::Stopping), "stopping");
        assert_eq!(state_label(VmState::Stopped), "stopped");
    }

    #[test]
    fn to_vm_response_carries_port_forwards_through() {
        let resp = to_vm_response(sample_record());
        assert_eq!(resp.vm_name, "alpha");
        assert_eq!(resp.status, "running");
        assert_eq!(resp.guest_ip.as_deref(), Some("10.20.1.2"));
        assert_eq!(resp.port_forwards.len(), 1);
        assert_eq!(resp.port_forwards[0].host_port, 2222);
    }
}
