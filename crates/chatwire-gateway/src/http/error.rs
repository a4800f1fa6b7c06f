//! Admin API error type mapping hub errors to HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use chatwire_core::hub::HubError;

use crate::http::response::ApiResponse;

/// Error returned by admin handlers. Wraps a relay-level refusal and
/// renders it with the hub's wire code.
#[derive(Debug)]
pub struct AdminError(HubError);

impl From<HubError> for AdminError {
    fn from(err: HubError) -> Self {
        AdminError(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let request_id = Uuid::now_v7().to_string();
        let envelope = ApiResponse::error(code, &self.0.to_string(), request_id);
        (status_for(code), Json(envelope)).into_response()
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "unknown_session" | "room_not_found" | "unknown_receipt" => StatusCode::NOT_FOUND,
        "tenant_mismatch" => StatusCode::FORBIDDEN,
        "capacity_exceeded" | "throttled" | "rejected" => StatusCode::TOO_MANY_REQUESTS,
        "payload_too_large" => StatusCode::PAYLOAD_TOO_LARGE,
        "already_terminal" => StatusCode::CONFLICT,
        "protocol" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
