//! Relay configuration types for Chatwire.
//!
//! `RelayConfig` represents the top-level `chatwire.toml` that controls
//! payload limits, liveness windows, delivery retries, and per-tenant
//! admission policies. All fields have sensible defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Top-level configuration for the Chatwire relay.
///
/// Loaded once at startup; tenant policies change only through config
/// reload, so lookups never need locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Maximum accepted payload size in bytes.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Capacity of each session's outbound mailbox.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Messages retained per room for replay; oldest are trimmed past this.
    #[serde(default = "default_room_history_limit")]
    pub room_history_limit: usize,

    /// An active session with no heartbeat for this long goes stale.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    /// A stale session is closed this long after the stale window elapses.
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,

    /// An empty room is reaped after staying idle this long.
    #[serde(default = "default_idle_room_after_ms")]
    pub idle_room_after_ms: u64,

    /// How often the liveness and room sweeps run.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// How often the delivery retry pump runs.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Retries per failed delivery before it is marked failed_final.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry backoff; doubled on each successive attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Messages served per replay poll.
    #[serde(default = "default_replay_page_size")]
    pub replay_page_size: usize,

    /// Policy applied to tenants without an explicit override.
    #[serde(default)]
    pub default_tenant: TenantPolicy,

    /// Per-tenant policy overrides.
    #[serde(default)]
    pub tenants: Vec<TenantOverride>,
}

fn default_max_payload_bytes() -> usize {
    16 * 1024
}

fn default_mailbox_capacity() -> usize {
    256
}

fn default_room_history_limit() -> usize {
    1024
}

fn default_stale_after_ms() -> u64 {
    30_000
}

fn default_close_grace_ms() -> u64 {
    60_000
}

fn default_idle_room_after_ms() -> u64 {
    300_000
}

fn default_sweep_interval_ms() -> u64 {
    5_000
}

fn default_retry_interval_ms() -> u64 {
    1_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_replay_page_size() -> usize {
    100
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            mailbox_capacity: default_mailbox_capacity(),
            room_history_limit: default_room_history_limit(),
            stale_after_ms: default_stale_after_ms(),
            close_grace_ms: default_close_grace_ms(),
            idle_room_after_ms: default_idle_room_after_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            replay_page_size: default_replay_page_size(),
            default_tenant: TenantPolicy::default(),
            tenants: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Policy for a tenant: its override if one exists, else the default.
    pub fn policy_for(&self, tenant_id: Uuid) -> &TenantPolicy {
        self.tenants
            .iter()
            .find(|t| t.tenant_id == tenant_id)
            .map(|t| &t.policy)
            .unwrap_or(&self.default_tenant)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn idle_room_after(&self) -> Duration {
        Duration::from_millis(self.idle_room_after_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Admission policy for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPolicy {
    /// Maximum concurrent sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Tenant-wide publish token refill rate (tokens per second).
    #[serde(default = "default_publish_rate")]
    pub publish_rate: f64,

    /// Tenant-wide publish bucket capacity.
    #[serde(default = "default_publish_burst")]
    pub publish_burst: f64,

    /// Per-session publish token refill rate (tokens per second).
    #[serde(default = "default_session_rate")]
    pub session_rate: f64,

    /// Per-session publish bucket capacity.
    #[serde(default = "default_session_burst")]
    pub session_burst: f64,

    /// Maximum publishes in flight at once across the tenant.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u32,
}

fn default_max_sessions() -> usize {
    200
}

fn default_publish_rate() -> f64 {
    25.0
}

fn default_publish_burst() -> f64 {
    50.0
}

fn default_session_rate() -> f64 {
    5.0
}

fn default_session_burst() -> f64 {
    10.0
}

fn default_max_inflight() -> u32 {
    64
}

impl Default for TenantPolicy {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            publish_rate: default_publish_rate(),
            publish_burst: default_publish_burst(),
            session_rate: default_session_rate(),
            session_burst: default_session_burst(),
            max_inflight: default_max_inflight(),
        }
    }
}

/// A tenant id paired with the policy that overrides the default for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantOverride {
    pub tenant_id: Uuid,
    #[serde(flatten)]
    pub policy: TenantPolicy,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
