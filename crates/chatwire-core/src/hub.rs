//! Relay hub: the composition root of the core.
//!
//! Wires the session registry, room router, message relay, delivery
//! tracker, and admission controller together behind one handler surface,
//! and drives the background maintenance loops (liveness sweep, idle-room
//! reaper, redelivery pump, degraded-mode notifier). Transports hand every
//! inbound frame to [`RelayHub::handle_event`] and forward whatever lands
//! in the session mailbox back to the wire.

use std::sync::Arc;
use std::time::Instant;

use chatwire_types::config::RelayConfig;
use chatwire_types::error::{DeliveryError, PublishError, RegistryError, RoomError};
use chatwire_types::event::{ClientEvent, CloseReason, RelayEvent, ServerEvent};
use chatwire_types::message::{DeliveryState, ReceiptInfo, RoomMessage};
use chatwire_types::room::{RoomInfo, RoomKey};
use chatwire_types::session::{ParticipantRole, PresenceEntry, SessionInfo};
use futures_util::Stream;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmitDecision, DegradedMode};
use crate::delivery::{DeliveryTracker, RetryVerdict};
use crate::event::EventBus;
use crate::registry::{ClosedSession, SessionRegistry};
use crate::relay::{MessageRelay, SendOutcome};
use crate::router::RoomRouter;
use crate::transport::SessionHandle;

const EVENT_BUS_CAPACITY: usize = 256;

/// Everything that can go wrong while handling a client or admin request.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Rate limited; the client should retry after the hinted delay.
    #[error("publish throttled, retry in {retry_after_ms}ms")]
    Throttled { retry_after_ms: u64 },

    /// In-flight quota exhausted; the publish is dropped, not queued.
    #[error("publish rejected: in-flight quota exhausted")]
    Rejected,

    /// A `connect` frame arrived on an already-established session.
    #[error("session is already connected")]
    UnexpectedConnect,
}

impl HubError {
    /// Stable machine-readable code for the wire error frame.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::Registry(RegistryError::CapacityExceeded { .. }) => "capacity_exceeded",
            HubError::Registry(RegistryError::UnknownSession(_)) => "unknown_session",
            HubError::Room(RoomError::TenantMismatch { .. }) => "tenant_mismatch",
            HubError::Room(RoomError::RoomNotFound(_)) => "room_not_found",
            HubError::Room(RoomError::UnknownSession(_)) => "unknown_session",
            HubError::Publish(PublishError::RoomNotFound(_)) => "room_not_found",
            HubError::Publish(PublishError::PayloadTooLarge { .. }) => "payload_too_large",
            HubError::Publish(PublishError::SequencerCorrupted(_)) => "internal",
            HubError::Delivery(DeliveryError::AlreadyTerminal { .. }) => "already_terminal",
            HubError::Delivery(DeliveryError::UnknownReceipt { .. }) => "unknown_receipt",
            HubError::Delivery(DeliveryError::UnknownSession(_)) => "unknown_session",
            HubError::Throttled { .. } => "throttled",
            HubError::Rejected => "rejected",
            HubError::UnexpectedConnect => "protocol",
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            HubError::Throttled { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Render this error as the frame a transport sends back.
    pub fn to_server_event(&self) -> ServerEvent {
        ServerEvent::Error {
            code: self.code().to_string(),
            message: self.to_string(),
            retry_after_ms: self.retry_after_ms(),
        }
    }
}

/// The assembled relay. One per process; transports and the admin surface
/// share it behind an `Arc`.
pub struct RelayHub {
    config: Arc<RelayConfig>,
    registry: Arc<SessionRegistry>,
    router: Arc<RoomRouter>,
    relay: Arc<MessageRelay>,
    delivery: Arc<DeliveryTracker>,
    admission: AdmissionController,
    events: EventBus,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayHub {
    pub fn new(config: RelayConfig) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&config)));
        let router = Arc::new(RoomRouter::new(Arc::clone(&registry)));
        let degraded = Arc::new(DegradedMode::default());
        let relay = Arc::new(MessageRelay::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&router),
            Arc::clone(&degraded),
        ));
        let events = EventBus::new(EVENT_BUS_CAPACITY);
        let delivery = Arc::new(DeliveryTracker::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&relay),
            events.clone(),
        ));
        let admission = AdmissionController::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            degraded,
            events.clone(),
        );

        Self {
            config,
            registry,
            router,
            relay,
            delivery,
            admission,
            events,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Establish a session for a freshly attached transport.
    pub fn connect(
        &self,
        tenant_id: Uuid,
        role: ParticipantRole,
        handle: SessionHandle,
    ) -> Result<Uuid, HubError> {
        let session_id = self.registry.register(tenant_id, role, handle)?;
        self.events.publish(RelayEvent::SessionOpened {
            session_id,
            tenant_id,
            role,
        });
        Ok(session_id)
    }

    /// Tear a session down and clean up everything it touched.
    pub fn disconnect(&self, session_id: Uuid, reason: CloseReason) -> Result<(), HubError> {
        let closed = self
            .registry
            .close(session_id)
            .ok_or(RegistryError::UnknownSession(session_id))?;
        self.finish_close(closed, reason);
        Ok(())
    }

    pub fn heartbeat(&self, session_id: Uuid) -> Result<(), HubError> {
        self.registry.heartbeat(session_id)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Frame dispatch
    // -----------------------------------------------------------------------

    /// Handle one decoded inbound frame for an established session.
    ///
    /// `connect` is a transport concern and must not appear here again.
    pub fn handle_event(&self, session_id: Uuid, event: ClientEvent) -> Result<(), HubError> {
        match event {
            ClientEvent::Connect { .. } => Err(HubError::UnexpectedConnect),
            ClientEvent::Publish { room_id, payload } => {
                self.publish(session_id, &room_id, payload).map(|_| ())
            }
            ClientEvent::Join { room_id } => self.join(session_id, room_id).map(|_| ()),
            ClientEvent::Leave { room_id } => self.leave(session_id, &room_id),
            ClientEvent::Heartbeat => self.heartbeat(session_id),
            ClientEvent::Ack { room_id, seq } => self.ack(session_id, &room_id, seq),
            ClientEvent::Replay { room_id, from_seq } => self
                .replay_to_mailbox(session_id, &room_id, from_seq)
                .map(|_| ()),
            ClientEvent::Disconnect => self.disconnect(session_id, CloseReason::Explicit),
        }
    }

    /// Join a room in the session's own tenant, creating it on first use.
    pub fn join(&self, session_id: Uuid, room_id: impl Into<String>) -> Result<RoomKey, HubError> {
        let tenant_id = self
            .registry
            .tenant_of(session_id)
            .ok_or(RoomError::UnknownSession(session_id))?;
        let room = RoomKey::new(tenant_id, room_id);
        let created = self.router.join(room.clone(), session_id)?;
        if created {
            self.events
                .publish(RelayEvent::RoomCreated { room: room.clone() });
        }
        Ok(room)
    }

    pub fn leave(&self, session_id: Uuid, room_id: &str) -> Result<(), HubError> {
        let tenant_id = self
            .registry
            .tenant_of(session_id)
            .ok_or(RoomError::UnknownSession(session_id))?;
        let room = RoomKey::new(tenant_id, room_id);
        self.router.leave(&room, session_id)?;
        Ok(())
    }

    /// Admit, sequence, and fan a message out. Returns the assigned seq.
    pub fn publish(
        &self,
        session_id: Uuid,
        room_id: &str,
        payload: Vec<u8>,
    ) -> Result<u64, HubError> {
        let tenant_id = self
            .registry
            .tenant_of(session_id)
            .ok_or(RegistryError::UnknownSession(session_id))?;
        let room = RoomKey::new(tenant_id, room_id);

        match self.admission.admit(tenant_id, session_id, Instant::now()) {
            AdmitDecision::Allowed => {}
            AdmitDecision::Throttled { retry_after } => {
                return Err(HubError::Throttled {
                    retry_after_ms: retry_after.as_millis() as u64,
                });
            }
            AdmitDecision::Rejected => return Err(HubError::Rejected),
        }

        let result = self.relay.publish(&room, session_id, payload);
        self.admission.release(tenant_id);

        let outcome = result?;
        let seq = outcome.message.seq;
        let now = Instant::now();
        for attempt in &outcome.deliveries {
            self.delivery.open(
                &room,
                seq,
                attempt.recipient,
                attempt.outcome == SendOutcome::Sent,
                now,
            );
        }
        Ok(seq)
    }

    /// Record a recipient's ack and surface the receipt to the publisher.
    pub fn ack(&self, session_id: Uuid, room_id: &str, seq: u64) -> Result<(), HubError> {
        let tenant_id = self
            .registry
            .tenant_of(session_id)
            .ok_or(RegistryError::UnknownSession(session_id))?;
        let room = RoomKey::new(tenant_id, room_id);
        self.delivery
            .record_delivery(&room, seq, session_id, DeliveryState::Delivered)?;

        if let Some(message) = self.relay.message_at(&room, seq) {
            if let Some(handle) = self.registry.resolve(message.sender) {
                let _ = handle.push(ServerEvent::DeliveryReceipt {
                    room_id: room.room_id.clone(),
                    seq,
                    recipient: session_id,
                    state: DeliveryState::Delivered,
                });
            }
        }
        Ok(())
    }

    /// Replay logged messages into the session's own mailbox.
    ///
    /// Pages through the log and stops early when the mailbox fills; the
    /// client sees where it got to and can replay again from there. Returns
    /// how many messages were pushed.
    pub fn replay_to_mailbox(
        &self,
        session_id: Uuid,
        room_id: &str,
        from_seq: u64,
    ) -> Result<usize, HubError> {
        let tenant_id = self
            .registry
            .tenant_of(session_id)
            .ok_or(DeliveryError::UnknownSession(session_id))?;
        let room = RoomKey::new(tenant_id, room_id);
        let handle = self
            .registry
            .resolve(session_id)
            .ok_or(DeliveryError::UnknownSession(session_id))?;

        let tail = self.relay.tail_seq(&room);
        let mut cursor = from_seq;
        let mut pushed = 0;
        'pages: while cursor <= tail {
            let batch = self
                .delivery
                .replay_page(&room, cursor, self.config.replay_page_size);
            if batch.is_empty() {
                break;
            }
            for message in batch {
                if message.seq > tail {
                    break 'pages;
                }
                cursor = message.seq + 1;
                let frame = ServerEvent::Message {
                    room_id: room.room_id.clone(),
                    seq: message.seq,
                    sender: message.sender,
                    payload: message.payload,
                    timestamp: message.timestamp,
                };
                if handle.push(frame).is_err() {
                    break 'pages;
                }
                pushed += 1;
            }
        }
        debug!(%room, %session_id, from_seq, pushed, "replayed into session mailbox");
        Ok(pushed)
    }

    /// Lazily stream logged messages for programmatic consumers.
    pub fn replay(
        &self,
        session_id: Uuid,
        room_id: &str,
        from_seq: u64,
    ) -> Result<impl Stream<Item = RoomMessage> + Send + 'static, HubError> {
        let tenant_id = self
            .registry
            .tenant_of(session_id)
            .ok_or(DeliveryError::UnknownSession(session_id))?;
        let room = RoomKey::new(tenant_id, room_id);
        Ok(self.delivery.replay(&room, session_id, from_seq)?)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn session_info(&self, session_id: Uuid) -> Option<SessionInfo> {
        self.registry.session_info(session_id)
    }

    pub fn list_sessions(&self, tenant_id: Uuid) -> Vec<SessionInfo> {
        self.registry.list_sessions(tenant_id)
    }

    pub fn room_info(&self, room: &RoomKey) -> Option<RoomInfo> {
        let mut info = self.router.room_info(room)?;
        info.last_seq = self.relay.tail_seq(room);
        Some(info)
    }

    pub fn list_rooms(&self, tenant_id: Uuid) -> Vec<RoomInfo> {
        let mut rooms = self.router.list_rooms(tenant_id);
        for info in &mut rooms {
            info.last_seq = self.relay.tail_seq(&info.room);
        }
        rooms
    }

    pub fn room_history(&self, room: &RoomKey, from_seq: u64, limit: usize) -> Vec<RoomMessage> {
        self.delivery.replay_page(room, from_seq, limit)
    }

    pub fn presence(&self, room: &RoomKey) -> Option<Vec<PresenceEntry>> {
        self.delivery.presence(room)
    }

    pub fn receipt(&self, room: &RoomKey, seq: u64, recipient: Uuid) -> Option<ReceiptInfo> {
        self.delivery.receipt(room, seq, recipient)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// Spawn the maintenance loops. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(Arc::clone(self).liveness_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).reaper_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).retry_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).degraded_loop()));
        info!("relay hub maintenance loops started");
    }

    /// Stop the loops and wait for them to wind down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("relay hub stopped");
    }

    /// Marks silent sessions stale, then destroys the ones past grace.
    async fn liveness_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = self.registry.sweep(Instant::now());
                    for closed in outcome.closed {
                        self.finish_close(closed, CloseReason::LivenessTimeout);
                    }
                }
            }
        }
    }

    /// Reaps rooms that have sat empty past the idle window.
    async fn reaper_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = self
                        .router
                        .reap(Instant::now(), self.config.idle_room_after());
                    for room in reaped {
                        self.relay.drop_room(&room);
                        self.delivery.forget_room(&room);
                        debug!(%room, "idle room reaped");
                        self.events.publish(RelayEvent::RoomReaped { room });
                    }
                }
            }
        }
    }

    /// Redelivers failed messages until acked or abandoned.
    async fn retry_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.retry_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Instant::now();
                    for (room, seq, recipient) in self.delivery.due_retries(now) {
                        let verdict = self.delivery.retry_one(&room, seq, recipient, now);
                        if let Some(RetryVerdict::FailedFinal { sender, .. }) = verdict {
                            // Tell the publisher the delivery was abandoned.
                            if let Some(handle) =
                                sender.and_then(|s| self.registry.resolve(s))
                            {
                                let _ = handle.push(ServerEvent::DeliveryReceipt {
                                    room_id: room.room_id.clone(),
                                    seq,
                                    recipient,
                                    state: DeliveryState::FailedFinal,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    /// Forwards degraded-mode flips to every session of the tenant.
    async fn degraded_loop(self: Arc<Self>) {
        let mut events = self.events.subscribe();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(RelayEvent::DegradedChanged { tenant_id, active }) => {
                        for info in self.registry.list_sessions(tenant_id) {
                            if let Some(handle) = self.registry.resolve(info.id) {
                                let _ = handle.push(ServerEvent::Degraded { active });
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    fn finish_close(&self, closed: ClosedSession, reason: CloseReason) {
        let rooms = self.router.remove_session(closed.session_id);
        self.admission
            .forget_session(closed.tenant_id, closed.session_id);
        self.delivery
            .fail_pending_for(closed.session_id, Instant::now());
        info!(
            session_id = %closed.session_id,
            tenant_id = %closed.tenant_id,
            role = %closed.role,
            ?reason,
            rooms = rooms.len(),
            "session closed"
        );
        self.events.publish(RelayEvent::SessionClosed {
            session_id: closed.session_id,
            tenant_id: closed.tenant_id,
            reason,
        });
    }
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHub")
            .field("registry", &self.registry)
            .field("router", &self.router)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
