//! Session domain types for Chatwire.
//!
//! A session is one live connection from a chat participant (a site visitor
//! or a support agent), scoped to a single tenant. Sessions are identified
//! by UUIDv7 ids minted at registration and never reused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which side of a conversation a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// A site visitor chatting through the embedded widget.
    Visitor,
    /// A support agent answering from the dashboard.
    Agent,
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantRole::Visitor => write!(f, "visitor"),
            ParticipantRole::Agent => write!(f, "agent"),
        }
    }
}

/// Liveness of a session, advanced by heartbeats and liveness sweeps.
///
/// `connecting` -> `active` on the first heartbeat; `active` -> `stale` when
/// heartbeats stop; a heartbeat from a stale session revives it to `active`.
/// `closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Connecting,
    Active,
    Stale,
    Closed,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Connecting => write!(f, "connecting"),
            Liveness::Active => write!(f, "active"),
            Liveness::Stale => write!(f, "stale"),
            Liveness::Closed => write!(f, "closed"),
        }
    }
}

/// Read-only snapshot of one session, served on the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// UUIDv7 session id.
    pub id: Uuid,
    /// Tenant this session belongs to.
    pub tenant_id: Uuid,
    pub role: ParticipantRole,
    pub liveness: Liveness,
    /// When the session registered.
    pub connected_at: DateTime<Utc>,
    /// Wall-clock time of the last heartbeat (registration time if none yet).
    pub last_seen_at: DateTime<Utc>,
}

/// One room member as seen by a presence query.
///
/// Members whose session has already been destroyed (but which still appear
/// in the room's member set for an instant) are reported as `closed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub session_id: Uuid,
    pub role: Option<ParticipantRole>,
    pub liveness: Liveness,
    pub last_seen_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
