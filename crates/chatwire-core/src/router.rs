//! Room router: membership, room lifecycle, and the idle-room reaper.
//!
//! Rooms are created lazily by the first join and deleted only by the
//! reaper, after sitting empty for the configured idle window. The reaper
//! re-checks emptiness under the same lock that deletes the entry, so a
//! join racing the sweep always keeps its room.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chatwire_types::error::RoomError;
use chatwire_types::room::{RoomInfo, RoomKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::registry::SessionRegistry;

struct RoomState {
    members: HashSet<Uuid>,
    created_at: DateTime<Utc>,
    /// Set when the room becomes empty; cleared by the next join.
    idle_since: Option<Instant>,
}

/// Tenant-scoped room membership table.
pub struct RoomRouter {
    registry: Arc<SessionRegistry>,
    rooms: DashMap<RoomKey, RoomState>,
}

impl RoomRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            rooms: DashMap::new(),
        }
    }

    /// Add a session to a room, creating the room on first join.
    ///
    /// Joining twice is a no-op. Returns `true` when this call created the
    /// room.
    pub fn join(&self, room: RoomKey, session_id: Uuid) -> Result<bool, RoomError> {
        let session_tenant = self
            .registry
            .tenant_of(session_id)
            .ok_or(RoomError::UnknownSession(session_id))?;
        if session_tenant != room.tenant_id {
            return Err(RoomError::TenantMismatch {
                session_id,
                session_tenant,
                room_tenant: room.tenant_id,
            });
        }

        let mut created = false;
        let mut state = self.rooms.entry(room.clone()).or_insert_with(|| {
            created = true;
            RoomState {
                members: HashSet::new(),
                created_at: Utc::now(),
                idle_since: None,
            }
        });
        state.members.insert(session_id);
        state.idle_since = None;
        drop(state);

        if created {
            debug!(%room, %session_id, "room created");
        }
        Ok(created)
    }

    /// Remove a session from a room. Removing a non-member is a no-op.
    pub fn leave(&self, room: &RoomKey, session_id: Uuid) -> Result<(), RoomError> {
        let mut state = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| RoomError::RoomNotFound(room.clone()))?;
        state.members.remove(&session_id);
        if state.members.is_empty() && state.idle_since.is_none() {
            state.idle_since = Some(Instant::now());
        }
        Ok(())
    }

    /// Membership snapshot. `None` when the room does not exist.
    pub fn members_of(&self, room: &RoomKey) -> Option<Vec<Uuid>> {
        self.rooms
            .get(room)
            .map(|state| state.members.iter().copied().collect())
    }

    pub fn contains(&self, room: &RoomKey) -> bool {
        self.rooms.contains_key(room)
    }

    /// Drop a session from every room it joined, marking emptied rooms
    /// idle. Returns the rooms the session was a member of.
    pub fn remove_session(&self, session_id: Uuid) -> Vec<RoomKey> {
        let mut affected = Vec::new();
        for mut entry in self.rooms.iter_mut() {
            if entry.members.remove(&session_id) {
                if entry.members.is_empty() && entry.idle_since.is_none() {
                    entry.idle_since = Some(Instant::now());
                }
                affected.push(entry.key().clone());
            }
        }
        affected
    }

    /// Delete rooms that have sat empty past `idle_after`, as observed at
    /// `now`. Returns the deleted keys so the caller can drop dependent
    /// state (message logs, receipts).
    pub fn reap(&self, now: Instant, idle_after: Duration) -> Vec<RoomKey> {
        let expired = |state: &RoomState| {
            state.members.is_empty()
                && state
                    .idle_since
                    .is_some_and(|since| now.duration_since(since) >= idle_after)
        };

        let candidates: Vec<RoomKey> = self
            .rooms
            .iter()
            .filter(|entry| expired(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = Vec::new();
        for room in candidates {
            // The predicate runs again under the entry's write lock: a join
            // that landed since the scan keeps the room alive.
            if self.rooms.remove_if(&room, |_, state| expired(state)).is_some() {
                debug!(%room, "idle room reaped");
                reaped.push(room);
            }
        }
        reaped
    }

    pub fn room_info(&self, room: &RoomKey) -> Option<RoomInfo> {
        self.rooms.get(room).map(|state| RoomInfo {
            room: room.clone(),
            created_at: state.created_at,
            member_count: state.members.len(),
            last_seq: 0,
        })
    }

    /// Snapshot all of a tenant's rooms, oldest first. `last_seq` is zero
    /// here; the hub fills it from the relay log.
    pub fn list_rooms(&self, tenant_id: Uuid) -> Vec<RoomInfo> {
        let mut rooms: Vec<RoomInfo> = self
            .rooms
            .iter()
            .filter(|entry| entry.key().tenant_id == tenant_id)
            .map(|entry| RoomInfo {
                room: entry.key().clone(),
                created_at: entry.created_at,
                member_count: entry.members.len(),
                last_seq: 0,
            })
            .collect();
        rooms.sort_by_key(|r| r.created_at);
        rooms
    }
}

impl std::fmt::Debug for RoomRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRouter")
            .field("rooms", &self.rooms.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::session_mailbox;
    use chatwire_types::config::RelayConfig;
    use chatwire_types::session::ParticipantRole;

    fn make_router() -> (Arc<SessionRegistry>, RoomRouter) {
        let registry = Arc::new(SessionRegistry::new(Arc::new(RelayConfig::default())));
        let router = RoomRouter::new(Arc::clone(&registry));
        (registry, router)
    }

    fn register(registry: &SessionRegistry, tenant: Uuid) -> Uuid {
        // Membership tests never read the mailbox; dropping the receiver is
        // fine because the router only consults the registry for tenancy.
        let (handle, _rx) = session_mailbox(16);
        registry
            .register(tenant, ParticipantRole::Visitor, handle)
            .unwrap()
    }

    #[test]
    fn first_join_creates_room() {
        let (registry, router) = make_router();
        let tenant = Uuid::now_v7();
        let a = register(&registry, tenant);
        let b = register(&registry, tenant);
        let room = RoomKey::new(tenant, "support");

        assert!(router.join(room.clone(), a).unwrap());
        assert!(!router.join(room.clone(), b).unwrap());

        let mut members = router.members_of(&room).unwrap();
        members.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(members, expected);
    }

    #[test]
    fn join_rejects_unknown_session_and_foreign_tenant() {
        let (registry, router) = make_router();
        let tenant = Uuid::now_v7();
        let other_tenant = Uuid::now_v7();
        let session = register(&registry, tenant);

        let unknown = router.join(RoomKey::new(tenant, "r"), Uuid::now_v7());
        assert!(matches!(unknown, Err(RoomError::UnknownSession(_))));

        let mismatch = router.join(RoomKey::new(other_tenant, "r"), session);
        assert!(matches!(mismatch, Err(RoomError::TenantMismatch { .. })));
    }

    #[test]
    fn same_room_id_is_distinct_per_tenant() {
        let (registry, router) = make_router();
        let tenant_a = Uuid::now_v7();
        let tenant_b = Uuid::now_v7();
        let a = register(&registry, tenant_a);
        let b = register(&registry, tenant_b);

        router.join(RoomKey::new(tenant_a, "support"), a).unwrap();
        router.join(RoomKey::new(tenant_b, "support"), b).unwrap();

        assert_eq!(
            router.members_of(&RoomKey::new(tenant_a, "support")).unwrap(),
            vec![a]
        );
        assert_eq!(
            router.members_of(&RoomKey::new(tenant_b, "support")).unwrap(),
            vec![b]
        );
    }

    #[test]
    fn empty_room_is_reaped_after_idle_window() {
        let (registry, router) = make_router();
        let tenant = Uuid::now_v7();
        let session = register(&registry, tenant);
        let room = RoomKey::new(tenant, "support");
        let idle = Duration::from_millis(100);

        router.join(room.clone(), session).unwrap();
        router.leave(&room, session).unwrap();

        // Still inside the idle window: kept.
        assert!(router.reap(Instant::now(), idle).is_empty());
        assert!(router.contains(&room));

        let reaped = router.reap(Instant::now() + Duration::from_millis(150), idle);
        assert_eq!(reaped, vec![room.clone()]);
        assert!(!router.contains(&room));
    }

    #[test]
    fn rejoin_resets_idle_and_preserves_room_identity() {
        let (registry, router) = make_router();
        let tenant = Uuid::now_v7();
        let session = register(&registry, tenant);
        let room = RoomKey::new(tenant, "support");
        let idle = Duration::from_millis(100);

        router.join(room.clone(), session).unwrap();
        let created_at = router.room_info(&room).unwrap().created_at;

        router.leave(&room, session).unwrap();
        router.join(room.clone(), session).unwrap();

        // The rejoin cleared the idle mark, so even a late sweep keeps it.
        assert!(router
            .reap(Instant::now() + Duration::from_millis(150), idle)
            .is_empty());
        assert_eq!(router.room_info(&room).unwrap().created_at, created_at);
    }

    #[test]
    fn reap_racing_join_leaves_member_in_place() {
        let (registry, router) = make_router();
        let router = Arc::new(router);
        let tenant = Uuid::now_v7();
        let session = register(&registry, tenant);
        let room = RoomKey::new(tenant, "support");
        let idle = Duration::from_millis(50);

        for _ in 0..50 {
            router.join(room.clone(), session).unwrap();
            router.leave(&room, session).unwrap();

            let reaper = {
                let router = Arc::clone(&router);
                let sweep_at = Instant::now() + Duration::from_millis(100);
                std::thread::spawn(move || {
                    router.reap(sweep_at, idle);
                })
            };
            let joiner = {
                let router = Arc::clone(&router);
                let room = room.clone();
                std::thread::spawn(move || {
                    router.join(room, session).unwrap();
                })
            };
            reaper.join().unwrap();
            joiner.join().unwrap();

            // Whichever side won the race, the member must survive it.
            assert_eq!(router.members_of(&room).unwrap(), vec![session]);
        }
    }

    #[test]
    fn remove_session_reports_affected_rooms() {
        let (registry, router) = make_router();
        let tenant = Uuid::now_v7();
        let session = register(&registry, tenant);
        let other = register(&registry, tenant);

        router.join(RoomKey::new(tenant, "a"), session).unwrap();
        router.join(RoomKey::new(tenant, "b"), session).unwrap();
        router.join(RoomKey::new(tenant, "b"), other).unwrap();

        let mut affected = router.remove_session(session);
        affected.sort_by(|x, y| x.room_id.cmp(&y.room_id));
        assert_eq!(affected.len(), 2);
        assert_eq!(affected[0].room_id, "a");
        assert_eq!(affected[1].room_id, "b");

        // Room "b" still has a member and must not be idle-marked.
        assert_eq!(
            router.members_of(&RoomKey::new(tenant, "b")).unwrap(),
            vec![other]
        );
    }

    #[test]
    fn list_rooms_is_tenant_scoped() {
        let (registry, router) = make_router();
        let tenant_a = Uuid::now_v7();
        let tenant_b = Uuid::now_v7();
        let a = register(&registry, tenant_a);
        let b = register(&registry, tenant_b);

        router.join(RoomKey::new(tenant_a, "one"), a).unwrap();
        router.join(RoomKey::new(tenant_a, "two"), a).unwrap();
        router.join(RoomKey::new(tenant_b, "one"), b).unwrap();

        let rooms = router.list_rooms(tenant_a);
        assert_eq!(rooms.len(), 2);
        assert!(rooms.iter().all(|r| r.room.tenant_id == tenant_a));
        assert_eq!(rooms[0].member_count, 1);
    }
}
