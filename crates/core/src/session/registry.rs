use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use quorum_primitives::{ServiceId, SessionId};

use super::Session;

/// Owner of every live [`Session`], indexed by session id and by owning
/// service.
///
/// Other components hold [`SessionId`]s and resolve them here at point of
/// use; nothing outside the registry keeps a `Session` reference. The handle
/// is cloneable and internally locked, but every entry has a single logical
/// writer: the state context.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    by_service: HashMap<ServiceId, HashSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Session) {
        let mut inner = self.inner.write();
        inner.by_service.entry(session.service()).or_default().insert(session.id());
        inner.sessions.insert(session.id(), session);
    }

    pub fn remove(&self, id: SessionId) -> Option<Session> {
        let mut inner = self.inner.write();
        let session = inner.sessions.remove(&id)?;
        if let Some(ids) = inner.by_service.get_mut(&session.service()) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.by_service.remove(&session.service());
            }
        }
        Some(session)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.inner.read().sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }

    pub fn with_session<R>(&self, id: SessionId, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.inner.read().sessions.get(&id).map(f)
    }

    pub fn with_session_mut<R>(&self, id: SessionId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.inner.write().sessions.get_mut(&id).map(f)
    }

    /// Ids of every live session, in ascending order.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.inner.read().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of the sessions bound to `service`, in ascending order.
    pub fn sessions_for(&self, service: ServiceId) -> Vec<SessionId> {
        let inner = self.inner.read();
        let mut ids: Vec<_> = inner
            .by_service
            .get(&service)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Remove every session bound to `service`, returning them.
    pub fn remove_service(&self, service: ServiceId) -> Vec<Session> {
        let mut inner = self.inner.write();
        let ids = inner.by_service.remove(&service).unwrap_or_default();
        let mut removed: Vec<_> = ids.into_iter().filter_map(|id| inner.sessions.remove(&id)).collect();
        removed.sort_unstable_by_key(|s| s.id());
        removed
    }

    /// The lowest `last_completed` watermark across all sessions, or `None`
    /// when no sessions exist.
    pub fn min_last_completed(&self) -> Option<u64> {
        self.inner.read().sessions.values().map(|s| s.last_completed()).min()
    }

    /// Snapshot the watermarks of every session bound to `service`, in
    /// ascending session order.
    pub fn snapshot_service(&self, service: ServiceId) -> Vec<crate::snapshot::SessionSnapshot> {
        let inner = self.inner.read();
        let mut snapshots: Vec<_> = inner
            .by_service
            .get(&service)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id))
                    .map(|s| s.snapshot())
                    .collect()
            })
            .unwrap_or_default();
        snapshots.sort_unstable_by_key(|s| s.session);
        snapshots
    }
}
