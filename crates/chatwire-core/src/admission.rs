//! Admission control: token buckets, in-flight quotas, and degraded mode.
//!
//! Every publish passes through `admit` before it reaches the relay. Two
//! token buckets apply, per session and per tenant, refilled continuously
//! at the configured rates; a hard in-flight quota caps concurrent
//! publishes per tenant. When a strict majority of a tenant's live
//! sessions have dry buckets the tenant enters degraded mode, a shared
//! flag the relay consults to shed replay buffering until pressure clears.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chatwire_types::config::RelayConfig;
use chatwire_types::event::RelayEvent;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::event::EventBus;
use crate::registry::SessionRegistry;

/// Decision for one inbound publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Allowed,
    /// A bucket is dry; the sender may retry after the delay.
    Throttled { retry_after: Duration },
    /// The tenant's in-flight quota is exhausted; the message is dropped.
    Rejected,
}

/// Shared degraded-mode flags, written by the admission controller and
/// consulted by the relay on every publish.
#[derive(Debug, Default)]
pub struct DegradedMode {
    tenants: DashMap<Uuid, bool>,
}

impl DegradedMode {
    pub fn is_degraded(&self, tenant_id: Uuid) -> bool {
        self.tenants.get(&tenant_id).map(|v| *v).unwrap_or(false)
    }

    /// Returns `true` when the flag actually changed.
    pub fn set(&self, tenant_id: Uuid, active: bool) -> bool {
        let previous = self.tenants.insert(tenant_id, active).unwrap_or(false);
        previous != active
    }
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst,
            last_refill: now,
        }
    }

    /// Refill for the elapsed time, then take one token. On refusal,
    /// returns how long until a token would be available.
    fn try_take(&mut self, rate: f64, burst: f64, now: Instant) -> Result<(), Duration> {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else if rate > 0.0 {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / rate))
        } else {
            Err(Duration::MAX)
        }
    }

    fn put_back(&mut self, burst: f64) {
        self.tokens = (self.tokens + 1.0).min(burst);
    }
}

/// Per-tenant and per-session publish admission.
pub struct AdmissionController {
    config: Arc<RelayConfig>,
    registry: Arc<SessionRegistry>,
    degraded: Arc<DegradedMode>,
    events: EventBus,
    tenant_buckets: DashMap<Uuid, TokenBucket>,
    session_buckets: DashMap<Uuid, TokenBucket>,
    inflight: DashMap<Uuid, AtomicU32>,
    /// Sessions whose bucket is currently dry, grouped by tenant; drives
    /// the degraded-mode majority check.
    dry_sessions: DashMap<Uuid, HashSet<Uuid>>,
}

impl AdmissionController {
    pub fn new(
        config: Arc<RelayConfig>,
        registry: Arc<SessionRegistry>,
        degraded: Arc<DegradedMode>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            degraded,
            events,
            tenant_buckets: DashMap::new(),
            session_buckets: DashMap::new(),
            inflight: DashMap::new(),
            dry_sessions: DashMap::new(),
        }
    }

    /// Admit one publish observed at `now`.
    ///
    /// The in-flight quota is reserved first as a hard limit; then the
    /// session bucket, then the tenant bucket. Reservations made before a
    /// later check refuses are rolled back, including the session token.
    pub fn admit(&self, tenant_id: Uuid, session_id: Uuid, now: Instant) -> AdmitDecision {
        let policy = self.config.policy_for(tenant_id);

        let quota_open = {
            let inflight = self.inflight.entry(tenant_id).or_default();
            inflight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < policy.max_inflight).then_some(n + 1)
                })
                .is_ok()
        };
        if !quota_open {
            debug!(%tenant_id, %session_id, "publish rejected, in-flight quota exhausted");
            return AdmitDecision::Rejected;
        }

        let session_take = {
            let mut bucket = self
                .session_buckets
                .entry(session_id)
                .or_insert_with(|| TokenBucket::new(policy.session_burst, now));
            bucket
                .try_take(policy.session_rate, policy.session_burst, now)
                .map(|()| bucket.tokens < 1.0)
        };
        match session_take {
            Ok(now_dry) => self.mark_dry(tenant_id, session_id, now_dry),
            Err(retry_after) => {
                self.release(tenant_id);
                self.mark_dry(tenant_id, session_id, true);
                debug!(%tenant_id, %session_id, "session bucket dry, publish throttled");
                return AdmitDecision::Throttled { retry_after };
            }
        }

        let tenant_take = {
            let mut bucket = self
                .tenant_buckets
                .entry(tenant_id)
                .or_insert_with(|| TokenBucket::new(policy.publish_burst, now));
            bucket.try_take(policy.publish_rate, policy.publish_burst, now)
        };
        if let Err(retry_after) = tenant_take {
            self.release(tenant_id);
            // The session token was consumed for nothing; put it back.
            if let Some(mut bucket) = self.session_buckets.get_mut(&session_id) {
                bucket.put_back(policy.session_burst);
            }
            debug!(%tenant_id, "tenant bucket dry, publish throttled");
            return AdmitDecision::Throttled { retry_after };
        }

        AdmitDecision::Allowed
    }

    /// Release one in-flight slot once the admitted publish completes.
    pub fn release(&self, tenant_id: Uuid) {
        if let Some(inflight) = self.inflight.get(&tenant_id) {
            let _ = inflight.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }

    /// Forget a closed session's bucket and dry mark.
    pub fn forget_session(&self, tenant_id: Uuid, session_id: Uuid) {
        self.session_buckets.remove(&session_id);
        self.mark_dry(tenant_id, session_id, false);
    }

    pub fn inflight_count(&self, tenant_id: Uuid) -> u32 {
        self.inflight
            .get(&tenant_id)
            .map(|n| n.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn mark_dry(&self, tenant_id: Uuid, session_id: Uuid, dry: bool) {
        let changed = {
            let mut set = self.dry_sessions.entry(tenant_id).or_default();
            if dry {
                set.insert(session_id)
            } else {
                set.remove(&session_id)
            }
        };
        if changed {
            self.reevaluate_degraded(tenant_id);
        }
    }

    /// Degraded mode turns on when a strict majority of the tenant's live
    /// sessions have dry buckets, and off as soon as that stops holding.
    fn reevaluate_degraded(&self, tenant_id: Uuid) {
        let live = self.registry.live_count(tenant_id);
        let dry = self
            .dry_sessions
            .get(&tenant_id)
            .map(|set| set.len())
            .unwrap_or(0);
        let active = live > 0 && dry * 2 > live;
        if self.degraded.set(tenant_id, active) {
            info!(%tenant_id, active, dry, live, "degraded mode changed");
            self.events
                .publish(RelayEvent::DegradedChanged { tenant_id, active });
        }
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("tenant_buckets", &self.tenant_buckets.len())
            .field("session_buckets", &self.session_buckets.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
