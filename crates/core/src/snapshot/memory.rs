use parking_lot::Mutex;

use crate::error::SnapshotError;

use super::{Snapshot, SnapshotStore};

/// Keeps snapshots on the heap: one staged, one current. Suitable for tests
/// and for deployments whose durability comes entirely from the log.
#[derive(Default)]
pub struct MemorySnapshotStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    staged: Option<Snapshot>,
    current: Option<Snapshot>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an already-completed snapshot, as when a follower
    /// receives one from the leader before replay starts.
    pub fn with_current(snapshot: Snapshot) -> Self {
        Self {
            inner: Mutex::new(Inner {
                staged: None,
                current: Some(snapshot),
            }),
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        self.inner.lock().staged = Some(snapshot);
        Ok(())
    }

    fn complete(&self, index: u64) -> Result<Snapshot, SnapshotError> {
        let mut inner = self.inner.lock();
        match inner.staged.take() {
            Some(snapshot) if snapshot.index == index => {
                inner.current = Some(snapshot.clone());
                Ok(snapshot)
            }
            staged => {
                inner.staged = staged;
                Err(SnapshotError::NotFound(index))
            }
        }
    }

    fn abandon(&self, index: u64) {
        let mut inner = self.inner.lock();
        if inner.staged.as_ref().is_some_and(|s| s.index == index) {
            inner.staged = None;
        }
    }

    fn current(&self) -> Option<Snapshot> {
        self.inner.lock().current.clone()
    }
}
