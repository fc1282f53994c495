//! The callback message envelope, independent of transport.
//!
//! A callback originates inside a guest and is addressed to whichever
//! external client holds the WebSocket session for that guest. The same
//! [`CallbackRequest`]/[`CallbackResponse`] pair crosses the datagram
//! transport (as JSON embedded in a `CALLBACK` line), the WebSocket session
//! (as a JSON text frame), and the direct-HTTP callback path (as a JSON
//! body) without change.

use serde::{Deserialize, Serialize};

/// A guest→client request awaiting a matching response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRequest {
    /// Unique within the session; correlates the response back to this request.
    pub id: String,
    /// Opaque verb chosen by the guest agent (`"echo"`, `"exec"`, ...).
    pub method: String,
    /// Opaque payload, passed through unmodified.
    pub params: serde_json::Value,
    /// Wall-clock seconds at origin.
    pub timestamp: u64,
}

impl CallbackRequest {
    /// Builds a request, stamping the current wall-clock time.
    #[must_use]
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self {
            id: id.into(),
            method: method.into(),
            params,
            timestamp,
        }
    }
}

/// Client→guest reply to a [`CallbackRequest`].
///
/// Exactly one of `result`/`error` is populated on the wire; [`CallbackResponse::into_result`]
/// enforces that `error` is decoded preferentially when both happen to be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackResponse {
    /// Echoes the request's `id`.
    pub id: String,
    /// Success payload.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<serde_json::Value>,
    /// Failure payload.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<CallbackError>,
}

impl CallbackResponse {
    /// Builds a success response.
    #[must_use]
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    /// Builds a failure response.
    #[must_use]
    pub fn err(id: impl Into<String>, error: CallbackError) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    /// Decodes the payload, preferring `error` over `result` per the route-callback contract.
    pub fn into_result(self) -> Result<serde_json::Value, CallbackError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// Structured failure carried by a [`CallbackResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackError {
    /// Machine-readable classification.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl CallbackError {
    /// Builds a new error value.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CallbackError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_prefers_error_over_result() {
        let resp = CallbackResponse {
            id: "x".into(),
            result: Some(serde_json::json!({"x": 1})),
            error: Some(CallbackError::new("Internal", "boom")),
        };
        assert!(resp.into_result().is_err());
    }

    #[test]
    fn round_trips_through_json() {
        let req = CallbackRequest::new("alpha:1", "echo", serde_json::json!({"x": 1}));
        let encoded = serde_json::to_string(&req).expect("serializable");
        let decoded: CallbackRequest = serde_json::from_str(&encoded).expect("valid json");
        assert_eq!(decoded.id, req.id);
        assert_eq!(decoded.method, req.method);
    }
}
