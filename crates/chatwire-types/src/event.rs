//! Wire and lifecycle events for Chatwire.
//!
//! `ClientEvent` and `ServerEvent` are the JSON wire protocol spoken over a
//! session transport (tagged with `"type"`, snake_case). `RelayEvent` is the
//! in-process lifecycle stream broadcast to hub subscribers; it never leaves
//! the process.

use crate::message::{payload_b64, DeliveryState};
use crate::room::RoomKey;
use crate::session::ParticipantRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events decoded from a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Session handshake. Carried by the transport's connect step; a connect
    /// arriving mid-session is a protocol error.
    Connect {
        tenant_id: Uuid,
        role: ParticipantRole,
    },
    /// Publish a payload into a room the session has joined.
    Publish {
        room_id: String,
        #[serde(with = "payload_b64")]
        payload: Vec<u8>,
    },
    /// Join a room, creating it on first join.
    Join { room_id: String },
    /// Leave a room.
    Leave { room_id: String },
    /// Keep-alive; revives a stale session.
    Heartbeat,
    /// Acknowledge receipt of a message, completing its delivery receipt.
    Ack { room_id: String, seq: u64 },
    /// Request redelivery of logged messages with seq >= `from_seq`.
    Replay { room_id: String, from_seq: u64 },
    /// Orderly close of the session.
    Disconnect,
}

/// Events pushed to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake result carrying the freshly minted session id.
    Connected { session_id: Uuid },
    /// A message routed to this session.
    Message {
        room_id: String,
        seq: u64,
        sender: Uuid,
        #[serde(with = "payload_b64")]
        payload: Vec<u8>,
        timestamp: DateTime<Utc>,
    },
    /// Delivery state change for a message this session published.
    DeliveryReceipt {
        room_id: String,
        seq: u64,
        recipient: Uuid,
        state: DeliveryState,
    },
    /// The tenant entered or left degraded mode.
    Degraded { active: bool },
    /// An admission or validation failure for something this session sent.
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client sent an orderly disconnect.
    Explicit,
    /// The liveness sweep timed the session out.
    LivenessTimeout,
    /// The transport dropped without a disconnect event.
    TransportClosed,
}

/// Lifecycle events broadcast on the in-process hub bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    SessionOpened {
        session_id: Uuid,
        tenant_id: Uuid,
        role: ParticipantRole,
    },
    SessionClosed {
        session_id: Uuid,
        tenant_id: Uuid,
        reason: CloseReason,
    },
    RoomCreated { room: RoomKey },
    RoomReaped { room: RoomKey },
    /// A message exhausted its delivery retries for one recipient.
    DeliveryUndeliverable {
        room: RoomKey,
        seq: u64,
        recipient: Uuid,
        attempts: u32,
    },
    DegradedChanged { tenant_id: Uuid, active: bool },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
