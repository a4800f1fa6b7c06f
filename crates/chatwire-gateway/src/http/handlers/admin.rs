//! Read-only admin endpoints backing the operations dashboard.
//!
//! All routes are tenant-scoped; nothing here mutates relay state.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use chatwire_core::hub::HubError;
use chatwire_types::error::RoomError;
use chatwire_types::message::RoomMessage;
use chatwire_types::room::{RoomInfo, RoomKey};
use chatwire_types::session::{PresenceEntry, SessionInfo};

use crate::http::error::AdminError;
use crate::http::response::ApiResponse;
use crate::state::GatewayState;

/// GET /admin/v1/tenants/{tenant_id}/sessions
pub async fn list_sessions(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<SessionInfo>>>, AdminError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let sessions = state.hub.list_sessions(tenant_id);

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(sessions, request_id, elapsed)))
}

/// GET /admin/v1/tenants/{tenant_id}/rooms
pub async fn list_rooms(
    State(state): State<GatewayState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<RoomInfo>>>, AdminError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let rooms = state.hub.list_rooms(tenant_id);

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(rooms, request_id, elapsed)))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_from_seq")]
    from_seq: u64,
    limit: Option<usize>,
}

fn default_from_seq() -> u64 {
    1
}

/// GET /admin/v1/tenants/{tenant_id}/rooms/{room_id}/history
///
/// One page of the room's message log; the limit is clamped to the
/// configured replay page size.
pub async fn room_history(
    State(state): State<GatewayState>,
    Path((tenant_id, room_id)): Path<(Uuid, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<RoomMessage>>>, AdminError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let room = RoomKey::new(tenant_id, room_id);
    if state.hub.room_info(&room).is_none() {
        return Err(HubError::from(RoomError::RoomNotFound(room)).into());
    }
    let limit = query
        .limit
        .unwrap_or(state.hub.config().replay_page_size);
    let messages = state.hub.room_history(&room, query.from_seq, limit);

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(messages, request_id, elapsed)))
}

/// GET /admin/v1/tenants/{tenant_id}/rooms/{room_id}/presence
pub async fn room_presence(
    State(state): State<GatewayState>,
    Path((tenant_id, room_id)): Path<(Uuid, String)>,
) -> Result<Json<ApiResponse<Vec<PresenceEntry>>>, AdminError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let room = RoomKey::new(tenant_id, room_id);
    let presence = state
        .hub
        .presence(&room)
        .ok_or_else(|| AdminError::from(HubError::from(RoomError::RoomNotFound(room))))?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(ApiResponse::success(presence, request_id, elapsed)))
}
