//! WebSocket transport: adapts the JSON wire protocol to the relay hub.
//!
//! `GET /ws?tenant_id=...&role=...` upgrades the connection. The handshake
//! registers a session and answers with a `connected` frame; after that the
//! handler multiplexes two directions in a single `tokio::select!` loop:
//!
//! - **Outbound:** events queued in the session mailbox (fan-out messages,
//!   delivery receipts, degraded notices) are serialized to text frames.
//! - **Inbound:** text frames are decoded as [`ClientEvent`] and dispatched
//!   to the hub; refusals come back to this client as `error` frames and
//!   never touch other members.
//!
//! Closing the socket, an explicit `disconnect` frame, and a liveness-sweep
//! destruction all converge on the same session teardown.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use chatwire_core::hub::RelayHub;
use chatwire_core::transport::session_mailbox;
use chatwire_types::event::{ClientEvent, CloseReason, ServerEvent};
use chatwire_types::session::ParticipantRole;

use crate::state::GatewayState;

/// Connection parameters carried in the upgrade request's query string.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    tenant_id: Uuid,
    #[serde(default)]
    role: Option<ParticipantRole>,
}

/// Upgrade an HTTP request to a WebSocket session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

/// Core WebSocket connection handler.
async fn handle_socket(socket: WebSocket, query: ConnectQuery, state: GatewayState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let role = query.role.unwrap_or(ParticipantRole::Visitor);

    let (handle, mut mailbox) = session_mailbox(state.hub.config().mailbox_capacity);
    let session_id = match state.hub.connect(query.tenant_id, role, handle) {
        Ok(id) => id,
        Err(err) => {
            // Tenant at capacity: report and close without a session.
            send_event(&mut ws_sender, &err.to_server_event()).await;
            let _ = ws_sender.close().await;
            return;
        }
    };
    tracing::debug!(%session_id, tenant_id = %query.tenant_id, %role, "websocket session established");

    if !send_event(&mut ws_sender, &ServerEvent::Connected { session_id }).await {
        let _ = state.hub.disconnect(session_id, CloseReason::TransportClosed);
        return;
    }

    loop {
        tokio::select! {
            // --- Branch 1: relay pushes queued for this session ---
            queued = mailbox.recv() => {
                match queued {
                    Some(event) => {
                        if !send_event(&mut ws_sender, &event).await {
                            break;
                        }
                    }
                    // The hub destroyed the session (liveness sweep).
                    None => break,
                }
            }

            // --- Branch 2: frames from the client ---
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !process_frame(&state.hub, session_id, &text, &mut ws_sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(%session_id, error = %err, "websocket receive error");
                        break;
                    }
                    // Ignore binary, ping, pong protocol frames
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Idempotent: the session may already be gone (explicit disconnect or
    // sweep), in which case there is nothing left to tear down.
    let _ = state.hub.disconnect(session_id, CloseReason::TransportClosed);
    tracing::debug!(%session_id, "websocket connection closed");
}

/// Decode and dispatch one inbound frame. Returns `false` when the socket
/// should close.
async fn process_frame(
    hub: &RelayHub,
    session_id: Uuid,
    text: &str,
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
) -> bool {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(%session_id, error = %err, "malformed client frame");
            let frame = ServerEvent::Error {
                code: "malformed".to_string(),
                message: format!("unparseable frame: {err}"),
                retry_after_ms: None,
            };
            return send_event(ws_sender, &frame).await;
        }
    };

    let explicit_disconnect = matches!(event, ClientEvent::Disconnect);
    if let Err(err) = hub.handle_event(session_id, event) {
        if !send_event(ws_sender, &err.to_server_event()).await {
            return false;
        }
    }
    !explicit_disconnect
}

/// Serialize and send one server event. Returns `false` when the client is
/// gone.
async fn send_event(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    event: &ServerEvent,
) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => ws_sender.send(Message::Text(json.into())).await.is_ok(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize server event");
            true
        }
    }
}
