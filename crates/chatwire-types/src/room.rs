//! Room identity and admin snapshots.
//!
//! A room is one conversation (widget embed instance or support thread).
//! Room ids are caller-supplied strings, unique only within a tenant, so the
//! canonical key is the `(tenant_id, room_id)` pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Canonical room key: a conversation id scoped to its tenant.
///
/// Two tenants may both have a room `"support"`; these are distinct rooms
/// and messages never cross between them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomKey {
    pub tenant_id: Uuid,
    pub room_id: String,
}

impl RoomKey {
    pub fn new(tenant_id: Uuid, room_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            room_id: room_id.into(),
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.room_id)
    }
}

/// Read-only snapshot of one room, served on the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room: RoomKey,
    /// When the room was first created by a join.
    pub created_at: DateTime<Utc>,
    pub member_count: usize,
    /// Highest committed sequence number in this room (0 when no messages).
    pub last_seq: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_key_display_is_tenant_scoped() {
        let tenant = Uuid::now_v7();
        let key = RoomKey::new(tenant, "support");
        assert_eq!(key.to_string(), format!("{tenant}/support"));
    }

    #[test]
    fn room_keys_differ_across_tenants() {
        let a = RoomKey::new(Uuid::now_v7(), "support");
        let b = RoomKey::new(Uuid::now_v7(), "support");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn room_info_serde_roundtrip() {
        let info = RoomInfo {
            room: RoomKey::new(Uuid::now_v7(), "widget-17"),
            created_at: Utc::now(),
            member_count: 3,
            last_seq: 42,
        };
        let json = serde_json::to_string(&info).unwrap();
        let parsed: RoomInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.room, info.room);
        assert_eq!(parsed.member_count, 3);
        assert_eq!(parsed.last_seq, 42);
    }
}
