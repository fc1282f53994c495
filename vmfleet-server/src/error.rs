//! The single boundary where [`vmfleet_core::Error`] kinds map to HTTP
//! status codes (§7).

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use vmfleet_proto::ErrorBody;

/// Wraps a core error so it can be returned directly from an axum handler.
pub struct ApiError(pub vmfleet_core::Error);

impl From<vmfleet_core::Error> for ApiError {
    fn from(err: vmfleet_core::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use vmfleet_core::Error as E;
        let status = match &self.0 {
            E::Validation(_) => StatusCode::BAD_REQUEST,
            E::Conflict(_) => StatusCode::CONFLICT,
            E::NotFound(_) | E::NoSession(_) => StatusCode::NOT_FOUND,
            E::ResourcesExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
            E::HypervisorUnreachable(_) => StatusCode::BAD_GATEWAY,
            E::Hypervisor(_) => StatusCode::BAD_GATEWAY,
            E::SessionClosed(_) => StatusCode::GONE,
            E::Backpressure(_) => StatusCode::TOO_MANY_REQUESTS,
            E::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            E::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody::new(self.0.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let resp = ApiError(vmfleet_core::Error::NotFound("no such vm".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn conflict_maps_to_409() {
        let resp = ApiError(vmfleet_core::Error::Conflict("already exists".into())).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn timeout_maps_to_504() {
        let resp = ApiError(vmfleet_core::Error::Timeout("no reply".into())).into_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
