//! Message relay: per-room sequencing, fan-out, and the replay log.
//!
//! Every room owns an append-only in-memory log guarded by its `DashMap`
//! entry lock. Sequencing, the membership snapshot, and the fan-out all run
//! under that lock, which is what makes sequence numbers gap-free under
//! concurrent publishes and keeps every recipient's mailbox in commit
//! order. A push failure to one recipient is recorded in the outcome and
//! never fails the publish.

use std::collections::VecDeque;
use std::sync::Arc;

use chatwire_types::config::RelayConfig;
use chatwire_types::error::PublishError;
use chatwire_types::event::ServerEvent;
use chatwire_types::message::RoomMessage;
use chatwire_types::room::RoomKey;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::admission::DegradedMode;
use crate::registry::SessionRegistry;
use crate::router::RoomRouter;
use crate::transport::PushError;

/// Outcome of one push to one recipient during fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The recipient's mailbox was full (slow consumer).
    MailboxFull,
    /// The recipient's mailbox or session is gone.
    Gone,
}

/// One recipient's fan-out result.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub recipient: Uuid,
    pub outcome: SendOutcome,
}

/// What a successful publish produced: the committed message plus the
/// fan-out results the delivery tracker turns into receipts.
#[derive(Debug)]
pub struct PublishOutcome {
    pub message: RoomMessage,
    pub deliveries: Vec<DeliveryAttempt>,
}

struct RoomLog {
    /// Next sequence number to assign (1-based).
    next_seq: u64,
    /// Committed messages in seq order, trimmed to the history limit.
    messages: VecDeque<RoomMessage>,
}

impl RoomLog {
    fn new() -> Self {
        Self {
            next_seq: 1,
            messages: VecDeque::new(),
        }
    }
}

/// Sequencing and fan-out engine, one log per live room.
pub struct MessageRelay {
    config: Arc<RelayConfig>,
    registry: Arc<SessionRegistry>,
    router: Arc<RoomRouter>,
    degraded: Arc<DegradedMode>,
    logs: DashMap<RoomKey, RoomLog>,
}

impl MessageRelay {
    pub fn new(
        config: Arc<RelayConfig>,
        registry: Arc<SessionRegistry>,
        router: Arc<RoomRouter>,
        degraded: Arc<DegradedMode>,
    ) -> Self {
        Self {
            config,
            registry,
            router,
            degraded,
            logs: DashMap::new(),
        }
    }

    /// Commit a payload to a room's log and fan it out to the members
    /// present at the instant of commit.
    ///
    /// Oversized payloads are rejected before a sequence number is
    /// assigned, so they leave no gap. Sessions joining after the snapshot
    /// was taken do not receive the message and recover it via replay.
    pub fn publish(
        &self,
        room: &RoomKey,
        sender: Uuid,
        payload: Vec<u8>,
    ) -> Result<PublishOutcome, PublishError> {
        let max = self.config.max_payload_bytes;
        if payload.len() > max {
            return Err(PublishError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        if !self.router.contains(room) {
            return Err(PublishError::RoomNotFound(room.clone()));
        }

        let mut log = self.logs.entry(room.clone()).or_insert_with(RoomLog::new);

        // Membership is re-read under the log lock; a reap that won the
        // race since the contains() check leaves no member set, and the
        // just-created log must not linger for a dead room.
        let Some(members) = self.router.members_of(room) else {
            drop(log);
            self.logs.remove(room);
            return Err(PublishError::RoomNotFound(room.clone()));
        };

        let seq = log.next_seq;
        if log.messages.back().is_some_and(|tail| tail.seq >= seq) {
            drop(log);
            self.logs.remove(room);
            warn!(%room, seq, "sequencer collision, room log quarantined");
            return Err(PublishError::SequencerCorrupted(room.clone()));
        }
        log.next_seq = seq + 1;

        let message = RoomMessage {
            room: room.clone(),
            seq,
            sender,
            payload,
            timestamp: Utc::now(),
        };

        if self.degraded.is_degraded(room.tenant_id) {
            // Degraded tenants shed replay buffering; live fan-out continues.
            debug!(%room, seq, "degraded mode, message not buffered for replay");
        } else {
            log.messages.push_back(message.clone());
            while log.messages.len() > self.config.room_history_limit {
                log.messages.pop_front();
            }
        }

        let mut deliveries = Vec::with_capacity(members.len());
        for recipient in members {
            let outcome = match self.registry.resolve(recipient) {
                Some(handle) => match handle.push(ServerEvent::Message {
                    room_id: room.room_id.clone(),
                    seq,
                    sender,
                    payload: message.payload.clone(),
                    timestamp: message.timestamp,
                }) {
                    Ok(()) => SendOutcome::Sent,
                    Err(PushError::Full) => SendOutcome::MailboxFull,
                    Err(PushError::Closed) => SendOutcome::Gone,
                },
                None => SendOutcome::Gone,
            };
            deliveries.push(DeliveryAttempt { recipient, outcome });
        }
        drop(log);

        debug!(%room, seq, recipients = deliveries.len(), "message committed");
        Ok(PublishOutcome {
            message,
            deliveries,
        })
    }

    /// Messages with `seq >= from_seq`, oldest first, at most `limit`.
    pub fn history_page(&self, room: &RoomKey, from_seq: u64, limit: usize) -> Vec<RoomMessage> {
        let Some(log) = self.logs.get(room) else {
            return Vec::new();
        };
        let start = log.messages.partition_point(|m| m.seq < from_seq);
        log.messages.iter().skip(start).take(limit).cloned().collect()
    }

    /// Look up one committed message by sequence number.
    pub fn message_at(&self, room: &RoomKey, seq: u64) -> Option<RoomMessage> {
        let log = self.logs.get(room)?;
        let idx = log.messages.binary_search_by_key(&seq, |m| m.seq).ok()?;
        log.messages.get(idx).cloned()
    }

    /// Highest committed sequence number (0 when the room has none).
    pub fn tail_seq(&self, room: &RoomKey) -> u64 {
        self.logs.get(room).map(|log| log.next_seq - 1).unwrap_or(0)
    }

    /// Membership snapshot passthrough for collaborators that hold the
    /// relay but not the router.
    pub fn members_of(&self, room: &RoomKey) -> Option<Vec<Uuid>> {
        self.router.members_of(room)
    }

    /// Drop a reaped room's log.
    pub fn drop_room(&self, room: &RoomKey) {
        if self.logs.remove(room).is_some() {
            debug!(%room, "room log dropped");
        }
    }
}

impl std::fmt::Debug for MessageRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRelay")
            .field("rooms_with_logs", &self.logs.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
