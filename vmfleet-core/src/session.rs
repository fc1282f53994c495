//! The callback fabric (§4.7): routes guest callback requests to whichever
//! client currently holds a session open for that VM, and routes replies
//! back.
//!
//! This module knows nothing about HTTP or WebSockets; the server crate
//! owns the socket and hands this registry plain text frames. That keeps
//! the cyclic dependency the design notes call out — the session registry
//! needs to tell the VM lifecycle manager when a client disconnects, and
//! the manager needs to route callbacks through the registry — resolved by
//! a plain `on_close` closure instead of a crate-level dependency cycle.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use vmfleet_proto::{CallbackRequest, CallbackResponse};

use crate::error::{Error, Result};

/// Default time to wait for a client to answer a routed callback before
/// giving up and returning a timeout to the guest.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on each session's outbound frame queue; a full queue fails fast
/// with [`Error::Backpressure`] rather than stalling the caller.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

struct Session {
    session_id: String,
    outbound: mpsc::Sender<String>,
    pending: Mutex<HashMap<String, oneshot::Sender<CallbackResponse>>>,
}

/// Tracks at most one active client session per VM and multiplexes guest
/// callbacks through it.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    on_close: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            on_close: Mutex::new(None),
        }
    }

    /// Installs a hook invoked with `vm_name` whenever a session for it
    /// closes, whether by explicit close or by the client socket dropping.
    pub fn set_on_close(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_close.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Box::new(hook));
    }

    /// Opens a session for `vm_name`, returning its id and the receiving end
    /// of a channel the caller must drain and forward to the client socket.
    /// Fails with [`Error::Conflict`] if a session is already open for this VM.
    pub fn open(&self, vm_name: &str) -> Result<(String, mpsc::Receiver<String>)> {
        let mut sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if sessions.contains_key(vm_name) {
            return Err(Error::Conflict(format!("a session is already open for {vm_name}")));
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        sessions.insert(
            vm_name.to_owned(),
            Session {
                session_id: session_id.clone(),
                outbound: tx,
                pending: Mutex::new(HashMap::new()),
            },
        );
        Ok((session_id, rx))
    }

    /// Closes `vm_name`'s session if its id matches, failing any requests
    /// still waiting for a reply. No-op if the session was already gone or
    /// belongs to a different, newer session id.
    pub fn close(&self, vm_name: &str, session_id: &str) {
        let removed = {
            let mut sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match sessions.get(vm_name) {
                Some(session) if session.session_id == session_id => sessions.remove(vm_name),
                _ => None,
            }
        };
        if removed.is_some() {
            if let Some(hook) = self.on_close.lock().unwrap_or_else(std::sync::PoisonError::into_inner).as_ref() {
                hook(vm_name);
            }
        }
    }

    /// Feeds a line received from `vm_name`'s client socket. It is expected
    /// to be a JSON-encoded [`CallbackResponse`]; unmatched or malformed
    /// frames are logged and dropped rather than closing the session.
    pub fn handle_client_message(&self, vm_name: &str, text: &str) {
        let response: CallbackResponse = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                warn!(vm_name, error = %e, "dropping malformed client frame");
                return;
            }
        };
        let sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(session) = sessions.get(vm_name) else {
            return;
        };
        let mut pending = session.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = pending.remove(&response.id) {
            let _ = tx.send(response);
        }
    }

    /// Routes a guest-originated callback to the client session currently
    /// open for `vm_name`, waiting up to [`CALLBACK_TIMEOUT`] for a reply.
    pub async fn dispatch(&self, vm_name: &str, request: CallbackRequest) -> Result<CallbackResponse> {
        let (outbound, rx) = {
            let sessions = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let session = sessions
                .get(vm_name)
                .ok_or_else(|| Error::NoSession(format!("no client session open for {vm_name}")))?;
            let (tx, rx) = oneshot::channel();
            session
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(request.id.clone(), tx);
            (session.outbound.clone(), rx)
        };

        let frame = serde_json::to_string(&request).map_err(|e| Error::Internal(e.to_string()))?;
        outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::Backpressure(format!("outbound queue for {vm_name} is full"))
            }
            mpsc::error::TrySendError::Closed(_) => {
                Error::SessionClosed(format!("client socket for {vm_name} is gone"))
            }
        })?;

        match tokio::time::timeout(CALLBACK_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::SessionClosed(format!("client socket for {vm_name} closed mid-call"))),
            Err(_) => Err(Error::Timeout(format!("no reply from {vm_name}'s client within {CALLBACK_TIMEOUT:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_proto::CallbackRequest;

    #[test]
    fn opening_twice_for_the_same_vm_conflicts() {
        let registry = SessionRegistry::new();
        let (_, _rx) = registry.open("alpha").unwrap();
        assert!(matches!(registry.open("alpha"), Err(Error::Conflict(_))));
    }

    #[test]
    fn close_with_stale_id_is_a_no_op() {
        let registry = SessionRegistry::new();
        let (_id, _rx) = registry.open("alpha").unwrap();
        registry.close("alpha", "not-the-real-id");
        assert!(matches!(registry.open("alpha"), Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn dispatch_without_a_session_is_no_session() {
        let registry = SessionRegistry::new();
        let result = registry
            .dispatch("alpha", CallbackRequest::new("req-1", "ping", serde_json::Value::Null))
            .await;
        assert!(matches!(result, Err(Error::NoSession(_))));
    }

    #[tokio::test]
    async fn dispatch_round_trips_through_handle_client_message() {
        let registry = SessionRegistry::new();
        let (_id, mut rx) = registry.open("alpha").unwrap();

        let request = CallbackRequest::new("req-2", "ping", serde_json::Value::Null);
        let request_id = request.id.clone();

        let registry = std::sync::Arc::new(registry);
        let dispatch_registry = registry.clone();
        let handle = tokio::spawn(async move { dispatch_registry.dispatch("alpha", request).await });

        let frame = rx.recv().await.expect("outbound frame");
        assert!(frame.contains(&request_id));

        let response = CallbackResponse::ok(request_id, serde_json::json!({"pong": true}));
        registry.handle_client_message("alpha", &serde_json::to_string(&response).unwrap());

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.result, response.result);
    }
}
