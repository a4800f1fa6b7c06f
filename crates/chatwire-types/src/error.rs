use crate::message::DeliveryState;
use crate::room::RoomKey;
use thiserror::Error;
use uuid::Uuid;

/// Errors from session registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The tenant's concurrent-session limit is already reached.
    #[error("tenant {tenant_id} at capacity ({limit} concurrent sessions)")]
    CapacityExceeded { tenant_id: Uuid, limit: usize },

    #[error("unknown session {0}")]
    UnknownSession(Uuid),
}

/// Errors from room membership operations.
#[derive(Debug, Error)]
pub enum RoomError {
    /// The session belongs to a different tenant than the room.
    #[error("session {session_id} belongs to tenant {session_tenant}, not {room_tenant}")]
    TenantMismatch {
        session_id: Uuid,
        session_tenant: Uuid,
        room_tenant: Uuid,
    },

    #[error("room {0} not found")]
    RoomNotFound(RoomKey),

    #[error("unknown session {0}")]
    UnknownSession(Uuid),
}

/// Errors from publishing into a room.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("room {0} not found")]
    RoomNotFound(RoomKey),

    /// Payload rejected before a sequence number was assigned.
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// The room's sequencer produced a colliding number; its log was
    /// quarantined and the room must be recreated.
    #[error("sequencer corrupted in room {0}")]
    SequencerCorrupted(RoomKey),
}

/// Errors from delivery receipt transitions and replay.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The receipt already reached a terminal state that conflicts with the
    /// requested transition.
    #[error("receipt for {room} seq {seq} recipient {recipient} is already {state}")]
    AlreadyTerminal {
        room: RoomKey,
        seq: u64,
        recipient: Uuid,
        state: DeliveryState,
    },

    #[error("no receipt for {room} seq {seq} recipient {recipient}")]
    UnknownReceipt {
        room: RoomKey,
        seq: u64,
        recipient: Uuid,
    },

    #[error("unknown session {0}")]
    UnknownSession(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_error_display() {
        let tenant = Uuid::now_v7();
        let err = RegistryError::CapacityExceeded {
            tenant_id: tenant,
            limit: 2,
        };
        assert!(err.to_string().contains("2 concurrent sessions"));
        assert!(err.to_string().contains(&tenant.to_string()));
    }

    #[test]
    fn payload_too_large_display() {
        let err = PublishError::PayloadTooLarge {
            size: 20_000,
            max: 16_384,
        };
        assert_eq!(
            err.to_string(),
            "payload of 20000 bytes exceeds the 16384 byte limit"
        );
    }

    #[test]
    fn already_terminal_display_names_state() {
        let err = DeliveryError::AlreadyTerminal {
            room: RoomKey::new(Uuid::now_v7(), "support"),
            seq: 3,
            recipient: Uuid::now_v7(),
            state: DeliveryState::Delivered,
        };
        assert!(err.to_string().contains("already delivered"));
        assert!(err.to_string().contains("seq 3"));
    }

    #[test]
    fn tenant_mismatch_display() {
        let err = RoomError::TenantMismatch {
            session_id: Uuid::now_v7(),
            session_tenant: Uuid::now_v7(),
            room_tenant: Uuid::now_v7(),
        };
        assert!(err.to_string().contains("belongs to tenant"));
    }
}
