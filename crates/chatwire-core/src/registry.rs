//! Session registry: connection handles, liveness, and tenant capacity.
//!
//! The registry owns the canonical session table. Registration mints a
//! UUIDv7 id, binds it to a tenant and a mailbox handle, and reserves one of
//! the tenant's capacity slots; closing a session is the single place the
//! slot is released. Liveness advances through heartbeats and the periodic
//! sweep: `connecting` -> `active` -> `stale` -> destroyed, with a heartbeat
//! reviving a stale session at any point before destruction.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chatwire_types::config::RelayConfig;
use chatwire_types::error::RegistryError;
use chatwire_types::session::{Liveness, ParticipantRole, SessionInfo};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::transport::SessionHandle;

struct SessionEntry {
    tenant_id: Uuid,
    role: ParticipantRole,
    handle: SessionHandle,
    connected_at: DateTime<Utc>,
    /// Monotonic heartbeat clock, used by the sweep.
    last_seen: Instant,
    /// Wall-clock heartbeat time, served in snapshots.
    last_seen_at: DateTime<Utc>,
    liveness: Liveness,
}

/// Final facts about a session that was just destroyed.
#[derive(Debug, Clone)]
pub struct ClosedSession {
    pub session_id: Uuid,
    pub tenant_id: Uuid,
    pub role: ParticipantRole,
}

/// What one liveness sweep did.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Sessions that went from active to stale.
    pub went_stale: Vec<Uuid>,
    /// Sessions destroyed for staying silent past the close grace.
    pub closed: Vec<ClosedSession>,
}

/// In-memory session table with per-tenant capacity accounting.
pub struct SessionRegistry {
    config: Arc<RelayConfig>,
    sessions: DashMap<Uuid, SessionEntry>,
    /// Live session count per tenant. Registration reserves a slot here
    /// before inserting the entry, so concurrent registrations cannot
    /// overshoot the limit. Tenants are never removed from this map.
    tenant_slots: DashMap<Uuid, AtomicUsize>,
}

impl SessionRegistry {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            tenant_slots: DashMap::new(),
        }
    }

    /// Register a new session and mint its id.
    ///
    /// Capacity is checked and reserved in one atomic step: of N concurrent
    /// registrations racing for a tenant's last slot, exactly one wins.
    pub fn register(
        &self,
        tenant_id: Uuid,
        role: ParticipantRole,
        handle: SessionHandle,
    ) -> Result<Uuid, RegistryError> {
        let limit = self.config.policy_for(tenant_id).max_sessions;
        {
            let slots = self
                .tenant_slots
                .entry(tenant_id)
                .or_insert_with(|| AtomicUsize::new(0));
            slots
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < limit).then_some(n + 1)
                })
                .map_err(|_| RegistryError::CapacityExceeded { tenant_id, limit })?;
        }

        let session_id = Uuid::now_v7();
        let now = Utc::now();
        self.sessions.insert(
            session_id,
            SessionEntry {
                tenant_id,
                role,
                handle,
                connected_at: now,
                last_seen: Instant::now(),
                last_seen_at: now,
                liveness: Liveness::Connecting,
            },
        );
        debug!(%session_id, %tenant_id, %role, "session registered");
        Ok(session_id)
    }

    /// Record a heartbeat, promoting a connecting session to active and
    /// reviving a stale one.
    pub fn heartbeat(&self, session_id: Uuid) -> Result<(), RegistryError> {
        let mut entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or(RegistryError::UnknownSession(session_id))?;
        if entry.liveness == Liveness::Stale {
            debug!(%session_id, "stale session revived by heartbeat");
        }
        entry.liveness = Liveness::Active;
        entry.last_seen = Instant::now();
        entry.last_seen_at = Utc::now();
        Ok(())
    }

    /// Destroy a session and free its tenant slot.
    ///
    /// Idempotent: of two concurrent closes, exactly one receives the
    /// closed-session facts; the other gets `None`.
    pub fn close(&self, session_id: Uuid) -> Option<ClosedSession> {
        let (_, entry) = self.sessions.remove(&session_id)?;
        self.release_slot(entry.tenant_id);
        debug!(%session_id, tenant_id = %entry.tenant_id, "session closed");
        Some(ClosedSession {
            session_id,
            tenant_id: entry.tenant_id,
            role: entry.role,
        })
    }

    /// Resolve a session's mailbox handle. `None` once the session is gone.
    pub fn resolve(&self, session_id: Uuid) -> Option<SessionHandle> {
        self.sessions.get(&session_id).map(|e| e.handle.clone())
    }

    pub fn contains(&self, session_id: Uuid) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Tenant the session belongs to.
    pub fn tenant_of(&self, session_id: Uuid) -> Option<Uuid> {
        self.sessions.get(&session_id).map(|e| e.tenant_id)
    }

    /// Advance liveness at `now`: active sessions silent past the stale
    /// window go stale, and sessions silent past the close grace on top of
    /// that are destroyed.
    ///
    /// `now` is a parameter so tests can drive the clock.
    pub fn sweep(&self, now: Instant) -> SweepOutcome {
        let stale_after = self.config.stale_after();
        let destroy_after = stale_after + self.config.close_grace();
        let mut outcome = SweepOutcome::default();

        let mut expired = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let silent_for = now.duration_since(entry.last_seen);
            if silent_for >= destroy_after {
                expired.push(*entry.key());
            } else if entry.liveness == Liveness::Active && silent_for >= stale_after {
                entry.liveness = Liveness::Stale;
                outcome.went_stale.push(*entry.key());
            }
        }

        // Destruction happens outside the iteration so removal never runs
        // under a shard lock the iterator still holds.
        for session_id in expired {
            if let Some(closed) = self.close(session_id) {
                outcome.closed.push(closed);
            }
        }
        outcome
    }

    pub fn session_info(&self, session_id: Uuid) -> Option<SessionInfo> {
        self.sessions.get(&session_id).map(|entry| SessionInfo {
            id: session_id,
            tenant_id: entry.tenant_id,
            role: entry.role,
            liveness: entry.liveness,
            connected_at: entry.connected_at,
            last_seen_at: entry.last_seen_at,
        })
    }

    /// Snapshot all of a tenant's sessions, oldest first.
    pub fn list_sessions(&self, tenant_id: Uuid) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .map(|entry| SessionInfo {
                id: *entry.key(),
                tenant_id: entry.tenant_id,
                role: entry.role,
                liveness: entry.liveness,
                connected_at: entry.connected_at,
                last_seen_at: entry.last_seen_at,
            })
            .collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }

    /// Sessions currently counted against a tenant's capacity.
    pub fn live_count(&self, tenant_id: Uuid) -> usize {
        self.tenant_slots
            .get(&tenant_id)
            .map(|slots| slots.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn release_slot(&self, tenant_id: Uuid) {
        if let Some(slots) = self.tenant_slots.get(&tenant_id) {
            let _ = slots.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("tenants", &self.tenant_slots.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
