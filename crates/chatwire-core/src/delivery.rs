//! Presence and per-recipient delivery tracking: receipts, retries, replay.
//!
//! The tracker opens one receipt per (message, recipient) pair when the
//! relay fans a message out. Acks complete receipts; failed pushes are
//! retried with exponential backoff until the configured bound, then
//! abandoned as `failed_final` and surfaced on the event bus. Replay is a
//! read-only, paged walk of the room log for reconnecting sessions; it
//! never consumes anything.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chatwire_types::config::RelayConfig;
use chatwire_types::error::DeliveryError;
use chatwire_types::event::{RelayEvent, ServerEvent};
use chatwire_types::message::{DeliveryState, ReceiptInfo, RoomMessage};
use chatwire_types::room::RoomKey;
use chatwire_types::session::{Liveness, PresenceEntry};
use dashmap::DashMap;
use futures_util::Stream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::EventBus;
use crate::registry::SessionRegistry;
use crate::relay::MessageRelay;

struct Receipt {
    state: DeliveryState,
    /// Retries performed so far (the original fan-out push is not counted).
    attempts: u32,
    next_retry: Option<Instant>,
}

/// What one retry attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// The message was pushed again; the receipt returned to pending.
    Resent,
    /// The push failed again; another retry is scheduled.
    Rescheduled,
    /// Retries are exhausted or the message is no longer buffered; the
    /// receipt is `failed_final`.
    FailedFinal {
        /// Publisher of the abandoned message, when still known.
        sender: Option<Uuid>,
        attempts: u32,
    },
}

/// Receipt table plus the presence and replay query surface.
pub struct DeliveryTracker {
    config: Arc<RelayConfig>,
    registry: Arc<SessionRegistry>,
    relay: Arc<MessageRelay>,
    events: EventBus,
    receipts: DashMap<(RoomKey, u64, Uuid), Receipt>,
}

impl DeliveryTracker {
    pub fn new(
        config: Arc<RelayConfig>,
        registry: Arc<SessionRegistry>,
        relay: Arc<MessageRelay>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            relay,
            events,
            receipts: DashMap::new(),
        }
    }

    /// Open a receipt for one routed message: pending when the push
    /// succeeded, failed with a first retry scheduled otherwise.
    pub fn open(&self, room: &RoomKey, seq: u64, recipient: Uuid, sent: bool, now: Instant) {
        let receipt = if sent {
            Receipt {
                state: DeliveryState::Pending,
                attempts: 0,
                next_retry: None,
            }
        } else {
            Receipt {
                state: DeliveryState::Failed,
                attempts: 0,
                next_retry: Some(now + self.backoff(0)),
            }
        };
        self.receipts.insert((room.clone(), seq, recipient), receipt);
    }

    /// Record an externally observed delivery outcome.
    ///
    /// `delivered` completes the receipt; `failed` schedules a retry if
    /// none is pending. Re-asserting the terminal state a receipt already
    /// holds is a no-op; asserting a conflicting one is `AlreadyTerminal`.
    /// `pending` and `failed_final` belong to the tracker itself and are
    /// ignored here.
    pub fn record_delivery(
        &self,
        room: &RoomKey,
        seq: u64,
        recipient: Uuid,
        state: DeliveryState,
    ) -> Result<(), DeliveryError> {
        let key = (room.clone(), seq, recipient);
        let mut receipt = self
            .receipts
            .get_mut(&key)
            .ok_or_else(|| DeliveryError::UnknownReceipt {
                room: room.clone(),
                seq,
                recipient,
            })?;

        if receipt.state.is_terminal() {
            if receipt.state == state {
                return Ok(());
            }
            return Err(DeliveryError::AlreadyTerminal {
                room: room.clone(),
                seq,
                recipient,
                state: receipt.state,
            });
        }

        match state {
            DeliveryState::Delivered => {
                receipt.state = DeliveryState::Delivered;
                receipt.next_retry = None;
                debug!(%room, seq, %recipient, "delivery acknowledged");
            }
            DeliveryState::Failed => {
                receipt.state = DeliveryState::Failed;
                if receipt.next_retry.is_none() {
                    let attempts = receipt.attempts;
                    receipt.next_retry = Some(Instant::now() + self.backoff(attempts));
                }
            }
            DeliveryState::Pending | DeliveryState::FailedFinal => {
                debug!(%room, seq, %recipient, %state, "ignoring tracker-owned state assertion");
            }
        }
        Ok(())
    }

    /// Mark every pending receipt addressed to a session as failed, with a
    /// retry scheduled. Used when a transport drops with deliveries still
    /// unacknowledged. Returns how many receipts were failed.
    pub fn fail_pending_for(&self, session_id: Uuid, now: Instant) -> usize {
        let mut failed = 0;
        for mut entry in self.receipts.iter_mut() {
            if entry.key().2 == session_id && entry.state == DeliveryState::Pending {
                let attempts = entry.attempts;
                entry.state = DeliveryState::Failed;
                entry.next_retry = Some(now + self.backoff(attempts));
                failed += 1;
            }
        }
        failed
    }

    /// Receipts whose retry deadline has passed at `now`.
    pub fn due_retries(&self, now: Instant) -> Vec<(RoomKey, u64, Uuid)> {
        self.receipts
            .iter()
            .filter(|entry| {
                entry.state == DeliveryState::Failed
                    && entry.next_retry.is_some_and(|at| at <= now)
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Attempt one redelivery.
    ///
    /// Returns `None` when the receipt is gone or no longer failed (an ack
    /// can land between the due scan and the retry).
    pub fn retry_one(
        &self,
        room: &RoomKey,
        seq: u64,
        recipient: Uuid,
        now: Instant,
    ) -> Option<RetryVerdict> {
        let key = (room.clone(), seq, recipient);
        let mut receipt = self.receipts.get_mut(&key)?;
        if receipt.state != DeliveryState::Failed {
            return None;
        }

        let Some(message) = self.relay.message_at(room, seq) else {
            // Trimmed from the log, or shed while degraded: nothing left
            // to resend.
            let attempts = receipt.attempts;
            self.finalize(&mut receipt, room, seq, recipient, attempts);
            return Some(RetryVerdict::FailedFinal {
                sender: None,
                attempts,
            });
        };

        receipt.attempts += 1;
        let attempts = receipt.attempts;
        let pushed = self.registry.resolve(recipient).map(|handle| {
            handle.push(ServerEvent::Message {
                room_id: room.room_id.clone(),
                seq,
                sender: message.sender,
                payload: message.payload.clone(),
                timestamp: message.timestamp,
            })
        });

        match pushed {
            Some(Ok(())) => {
                receipt.state = DeliveryState::Pending;
                receipt.next_retry = None;
                debug!(%room, seq, %recipient, attempts, "delivery retried");
                Some(RetryVerdict::Resent)
            }
            Some(Err(_)) | None => {
                if attempts >= self.config.max_retries {
                    self.finalize(&mut receipt, room, seq, recipient, attempts);
                    Some(RetryVerdict::FailedFinal {
                        sender: Some(message.sender),
                        attempts,
                    })
                } else {
                    receipt.next_retry = Some(now + self.backoff(attempts));
                    Some(RetryVerdict::Rescheduled)
                }
            }
        }
    }

    /// Lazily stream logged messages with `seq >= from_seq`, in order.
    ///
    /// Read-only: receipts and the log are untouched, so the same replay
    /// can be restarted after a dropped connection. The log tail observed
    /// at call time bounds the stream; later publishes are not included.
    pub fn replay(
        &self,
        room: &RoomKey,
        session_id: Uuid,
        from_seq: u64,
    ) -> Result<impl Stream<Item = RoomMessage> + Send + 'static + use<>, DeliveryError> {
        if !self.registry.contains(session_id) {
            return Err(DeliveryError::UnknownSession(session_id));
        }
        let relay = Arc::clone(&self.relay);
        let room = room.clone();
        let page = self.config.replay_page_size;
        let tail = relay.tail_seq(&room);
        debug!(%room, %session_id, from_seq, tail, "replay started");

        Ok(async_stream::stream! {
            let mut cursor = from_seq;
            while cursor <= tail {
                let batch = relay.history_page(&room, cursor, page);
                if batch.is_empty() {
                    break;
                }
                for message in batch {
                    if message.seq > tail {
                        return;
                    }
                    cursor = message.seq + 1;
                    yield message;
                }
            }
        })
    }

    /// One page of room history for the admin surface, with the limit
    /// clamped to the configured replay page size.
    pub fn replay_page(&self, room: &RoomKey, from_seq: u64, limit: usize) -> Vec<RoomMessage> {
        self.relay
            .history_page(room, from_seq, limit.min(self.config.replay_page_size))
    }

    /// Presence snapshot of a room's members. Members whose session is
    /// already gone are reported as closed.
    pub fn presence(&self, room: &RoomKey) -> Option<Vec<PresenceEntry>> {
        let members = self.relay.members_of(room)?;
        let mut entries: Vec<PresenceEntry> = members
            .into_iter()
            .map(|session_id| match self.registry.session_info(session_id) {
                Some(info) => PresenceEntry {
                    session_id,
                    role: Some(info.role),
                    liveness: info.liveness,
                    last_seen_at: Some(info.last_seen_at),
                },
                None => PresenceEntry {
                    session_id,
                    role: None,
                    liveness: Liveness::Closed,
                    last_seen_at: None,
                },
            })
            .collect();
        entries.sort_by_key(|e| e.session_id);
        Some(entries)
    }

    pub fn receipt(&self, room: &RoomKey, seq: u64, recipient: Uuid) -> Option<ReceiptInfo> {
        self.receipts
            .get(&(room.clone(), seq, recipient))
            .map(|r| ReceiptInfo {
                room: room.clone(),
                seq,
                recipient,
                state: r.state,
                attempts: r.attempts,
            })
    }

    /// Drop all receipts of a reaped room.
    pub fn forget_room(&self, room: &RoomKey) {
        self.receipts.retain(|key, _| key.0 != *room);
    }

    fn finalize(
        &self,
        receipt: &mut Receipt,
        room: &RoomKey,
        seq: u64,
        recipient: Uuid,
        attempts: u32,
    ) {
        receipt.state = DeliveryState::FailedFinal;
        receipt.next_retry = None;
        warn!(%room, seq, %recipient, attempts, "delivery abandoned as undeliverable");
        self.events.publish(RelayEvent::DeliveryUndeliverable {
            room: room.clone(),
            seq,
            recipient,
            attempts,
        });
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.min(16);
        self.config.retry_backoff().saturating_mul(factor)
    }
}

impl std::fmt::Debug for DeliveryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTracker")
            .field("receipts", &self.receipts.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::DegradedMode;
    use crate::relay::SendOutcome;
    use crate::router::RoomRouter;
    use crate::transport::session_mailbox;
    use chatwire_types::session::ParticipantRole;
    use futures_util::StreamExt;
    use tokio::sync::mpsc;

    struct Harness {
        registry: Arc<SessionRegistry>,
        router: Arc<RoomRouter>,
        relay: Arc<MessageRelay>,
        tracker: DeliveryTracker,
        events: EventBus,
    }

    fn make_harness(config: RelayConfig) -> Harness {
        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&config)));
        let router = Arc::new(RoomRouter::new(Arc::clone(&registry)));
        let degraded = Arc::new(DegradedMode::default());
        let relay = Arc::new(MessageRelay::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&router),
            degraded,
        ));
        let events = EventBus::new(16);
        let tracker = DeliveryTracker::new(
            config,
            Arc::clone(&registry),
            Arc::clone(&relay),
            events.clone(),
        );
        Harness {
            registry,
            router,
            relay,
            tracker,
            events,
        }
    }

    fn join_member(
        h: &Harness,
        tenant: Uuid,
        room: &RoomKey,
        capacity: usize,
    ) -> (Uuid, mpsc::Receiver<ServerEvent>) {
        let (handle, rx) = session_mailbox(capacity);
        let id = h
            .registry
            .register(tenant, ParticipantRole::Visitor, handle)
            .unwrap();
        h.router.join(room.clone(), id).unwrap();
        (id, rx)
    }

    /// Publish and open receipts the way the hub does.
    fn publish_tracked(h: &Harness, room: &RoomKey, sender: Uuid, payload: &[u8]) -> u64 {
        let outcome = h.relay.publish(room, sender, payload.to_vec()).unwrap();
        let now = Instant::now();
        for attempt in &outcome.deliveries {
            h.tracker.open(
                room,
                outcome.message.seq,
                attempt.recipient,
                attempt.outcome == SendOutcome::Sent,
                now,
            );
        }
        outcome.message.seq
    }

    #[test]
    fn ack_completes_receipt_and_conflicts_after() {
        let h = make_harness(RelayConfig::default());
        let tenant = Uuid::now_v7();
        let room = RoomKey::new(tenant, "support");
        let (a, _rx_a) = join_member(&h, tenant, &room, 16);
        let (b, _rx_b) = join_member(&h, tenant, &room, 16);

        let seq = publish_tracked(&h, &room, a, b"hello");

        h.tracker
            .record_delivery(&room, seq, b, DeliveryState::Delivered)
            .unwrap();
        assert_eq!(
            h.tracker.receipt(&room, seq, b).unwrap().state,
            DeliveryState::Delivered
        );

        // Duplicate ack is idempotent; a conflicting assertion is not.
        h.tracker
            .record_delivery(&room, seq, b, DeliveryState::Delivered)
            .unwrap();
        let conflict = h
            .tracker
            .record_delivery(&room, seq, b, DeliveryState::Failed);
        assert!(matches!(
            conflict,
            Err(DeliveryError::AlreadyTerminal {
                state: DeliveryState::Delivered,
                ..
            })
        ));
    }

    #[test]
    fn unknown_receipt_errors() {
        let h = make_harness(RelayConfig::default());
        let room = RoomKey::new(Uuid::now_v7(), "r");
        let result = h
            .tracker
            .record_delivery(&room, 1, Uuid::now_v7(), DeliveryState::Delivered);
        assert!(matches!(result, Err(DeliveryError::UnknownReceipt { .. })));
    }

    #[test]
    fn failed_push_retries_with_backoff_then_goes_final() {
        let h = make_harness(RelayConfig {
            max_retries: 2,
            retry_backoff_ms: 500,
            ..RelayConfig::default()
        });
        let tenant = Uuid::now_v7();
        let room = RoomKey::new(tenant, "support");
        let (a, _rx_a) = join_member(&h, tenant, &room, 16);
        let (b, rx_b) = join_member(&h, tenant, &room, 16);
        drop(rx_b);
        let mut events = h.events.subscribe();

        let base = Instant::now();
        let seq = publish_tracked(&h, &room, a, b"lost");
        assert_eq!(
            h.tracker.receipt(&room, seq, b).unwrap().state,
            DeliveryState::Failed
        );

        // Not due until the base backoff has elapsed.
        assert!(h.tracker.due_retries(base).is_empty());
        let due = h.tracker.due_retries(base + Duration::from_millis(600));
        assert_eq!(due.len(), 1);

        // First retry fails against the dead mailbox and is rescheduled.
        let verdict = h
            .tracker
            .retry_one(&room, seq, b, base + Duration::from_millis(600))
            .unwrap();
        assert_eq!(verdict, RetryVerdict::Rescheduled);

        // Second retry exhausts the bound.
        let verdict = h
            .tracker
            .retry_one(&room, seq, b, base + Duration::from_millis(1700))
            .unwrap();
        assert!(matches!(
            verdict,
            RetryVerdict::FailedFinal {
                sender: Some(s),
                attempts: 2,
            } if s == a
        ));
        assert_eq!(
            h.tracker.receipt(&room, seq, b).unwrap().state,
            DeliveryState::FailedFinal
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            RelayEvent::DeliveryUndeliverable { seq: 1, attempts: 2, .. }
        ));

        // A late ack for an undeliverable message conflicts.
        let late = h
            .tracker
            .record_delivery(&room, seq, b, DeliveryState::Delivered);
        assert!(matches!(late, Err(DeliveryError::AlreadyTerminal { .. })));
    }

    #[tokio::test]
    async fn retry_resends_once_the_mailbox_drains() {
        let h = make_harness(RelayConfig::default());
        let tenant = Uuid::now_v7();
        let room = RoomKey::new(tenant, "support");
        let (a, _rx_a) = join_member(&h, tenant, &room, 16);
        let (b, mut rx_b) = join_member(&h, tenant, &room, 1);

        publish_tracked(&h, &room, a, b"first");
        let seq2 = publish_tracked(&h, &room, a, b"second");
        assert_eq!(
            h.tracker.receipt(&room, seq2, b).unwrap().state,
            DeliveryState::Failed
        );

        // Draining the mailbox makes room for the redelivery.
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ServerEvent::Message { seq: 1, .. }
        ));
        let verdict = h
            .tracker
            .retry_one(&room, seq2, b, Instant::now() + Duration::from_secs(1))
            .unwrap();
        assert_eq!(verdict, RetryVerdict::Resent);
        assert_eq!(
            h.tracker.receipt(&room, seq2, b).unwrap().state,
            DeliveryState::Pending
        );
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ServerEvent::Message { seq: 2, .. }
        ));

        h.tracker
            .record_delivery(&room, seq2, b, DeliveryState::Delivered)
            .unwrap();
    }

    #[tokio::test]
    async fn replay_is_ordered_complete_and_restartable() {
        let h = make_harness(RelayConfig {
            replay_page_size: 2,
            ..RelayConfig::default()
        });
        let tenant = Uuid::now_v7();
        let room = RoomKey::new(tenant, "support");
        let (a, _rx_a) = join_member(&h, tenant, &room, 64);
        let (b, _rx_b) = join_member(&h, tenant, &room, 64);

        for i in 0..5u8 {
            publish_tracked(&h, &room, a, &[i]);
        }

        let seqs: Vec<u64> = h
            .tracker
            .replay(&room, b, 2)
            .unwrap()
            .map(|m| m.seq)
            .collect()
            .await;
        assert_eq!(seqs, vec![2, 3, 4, 5]);

        // Replay consumed nothing; the same call yields the same stream.
        let again: Vec<u64> = h
            .tracker
            .replay(&room, b, 2)
            .unwrap()
            .map(|m| m.seq)
            .collect()
            .await;
        assert_eq!(again, seqs);
    }

    #[tokio::test]
    async fn replay_is_bounded_at_call_time() {
        let h = make_harness(RelayConfig::default());
        let tenant = Uuid::now_v7();
        let room = RoomKey::new(tenant, "support");
        let (a, _rx_a) = join_member(&h, tenant, &room, 64);

        for i in 0..3u8 {
            publish_tracked(&h, &room, a, &[i]);
        }
        let stream = h.tracker.replay(&room, a, 1).unwrap();

        // Published after the replay call: not part of this stream.
        publish_tracked(&h, &room, a, b"late");

        let seqs: Vec<u64> = stream.map(|m| m.seq).collect().await;
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn replay_requires_a_live_session() {
        let h = make_harness(RelayConfig::default());
        let tenant = Uuid::now_v7();
        let room = RoomKey::new(tenant, "support");
        let (a, _rx_a) = join_member(&h, tenant, &room, 16);

        h.registry.close(a).unwrap();
        let result = h.tracker.replay(&room, a, 1);
        assert!(matches!(result, Err(DeliveryError::UnknownSession(_))));
    }

    #[test]
    fn replay_page_clamps_the_limit() {
        let h = make_harness(RelayConfig {
            replay_page_size: 2,
            ..RelayConfig::default()
        });
        let tenant = Uuid::now_v7();
        let room = RoomKey::new(tenant, "support");
        let (a, _rx_a) = join_member(&h, tenant, &room, 64);

        for i in 0..4u8 {
            publish_tracked(&h, &room, a, &[i]);
        }

        let page = h.tracker.replay_page(&room, 1, 100);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].seq, 1);
    }

    #[test]
    fn presence_reports_live_and_vanished_members() {
        let h = make_harness(RelayConfig::default());
        let tenant = Uuid::now_v7();
        let room = RoomKey::new(tenant, "support");
        let (a, _rx_a) = join_member(&h, tenant, &room, 16);
        let (b, _rx_b) = join_member(&h, tenant, &room, 16);

        h.registry.heartbeat(a).unwrap();
        // b's session dies but the room membership has not been cleaned yet.
        h.registry.close(b).unwrap();

        let presence = h.tracker.presence(&room).unwrap();
        assert_eq!(presence.len(), 2);
        let of = |id: Uuid| presence.iter().find(|p| p.session_id == id).unwrap().clone();
        assert_eq!(of(a).liveness, Liveness::Active);
        assert_eq!(of(a).role, Some(ParticipantRole::Visitor));
        assert_eq!(of(b).liveness, Liveness::Closed);
        assert_eq!(of(b).role, None);
    }

    #[test]
    fn forget_room_drops_receipts() {
        let h = make_harness(RelayConfig::default());
        let tenant = Uuid::now_v7();
        let room = RoomKey::new(tenant, "support");
        let (a, _rx_a) = join_member(&h, tenant, &room, 16);
        let (b, _rx_b) = join_member(&h, tenant, &room, 16);

        let seq = publish_tracked(&h, &room, a, b"m");
        assert!(h.tracker.receipt(&room, seq, b).is_some());

        h.tracker.forget_room(&room);
        assert!(h.tracker.receipt(&room, seq, b).is_none());
    }

    #[test]
    fn fail_pending_marks_unacked_deliveries() {
        let h = make_harness(RelayConfig::default());
        let tenant = Uuid::now_v7();
        let room = RoomKey::new(tenant, "support");
        let (a, _rx_a) = join_member(&h, tenant, &room, 16);
        let (b, _rx_b) = join_member(&h, tenant, &room, 16);

        let seq = publish_tracked(&h, &room, a, b"m");
        assert_eq!(
            h.tracker.receipt(&room, seq, b).unwrap().state,
            DeliveryState::Pending
        );

        let now = Instant::now();
        let failed = h.tracker.fail_pending_for(b, now);
        assert_eq!(failed, 1);
        assert_eq!(
            h.tracker.receipt(&room, seq, b).unwrap().state,
            DeliveryState::Failed
        );
        assert!(!h
            .tracker
            .due_retries(now + Duration::from_millis(600))
            .is_empty());
    }
}
