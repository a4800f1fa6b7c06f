//! Message and delivery-receipt domain types for Chatwire.
//!
//! `RoomMessage` is the envelope committed to a room's ordered log. Payloads
//! are opaque bytes to the relay; on the JSON wire they travel as base64
//! text via the [`payload_b64`] serde adapter.

use crate::room::RoomKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Serde adapter encoding opaque payload bytes as base64 text on the wire.
pub mod payload_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// A message committed to a room's log.
///
/// `seq` is assigned by the room's sequencer: strictly increasing per room,
/// starting at 1, gap-free under concurrent publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMessage {
    pub room: RoomKey,
    /// Per-room sequence number (1-based).
    pub seq: u64,
    /// Session that published the message.
    pub sender: Uuid,
    /// Opaque payload bytes (base64 on the wire).
    #[serde(with = "payload_b64")]
    pub payload: Vec<u8>,
    /// When the relay committed the message.
    pub timestamp: DateTime<Utc>,
}

/// Per-recipient delivery state of one committed message.
///
/// `delivered` and `failed_final` are terminal; `failed` may still be
/// retried by the delivery pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
    FailedFinal,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::FailedFinal)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryState::Pending => write!(f, "pending"),
            DeliveryState::Delivered => write!(f, "delivered"),
            DeliveryState::Failed => write!(f, "failed"),
            DeliveryState::FailedFinal => write!(f, "failed_final"),
        }
    }
}

/// Read-only snapshot of one delivery receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptInfo {
    pub room: RoomKey,
    pub seq: u64,
    pub recipient: Uuid,
    pub state: DeliveryState,
    /// Retry attempts performed so far (0 until the first retry).
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
