//! Per-owner mutual exclusion.
//!
//! Each owner gets its own async mutex, created on first use. Holders may
//! `.await` store calls while locked. Callers never hold two owner locks at
//! once.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use accrue_core::types::OwnerId;

/// Guard for one owner's critical section.
pub type OwnerGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct OwnerLocks {
    locks: DashMap<OwnerId, Arc<Mutex<()>>>,
}

impl OwnerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, owner: &OwnerId) -> Arc<Mutex<()>> {
        if let Some(m) = self.locks.get(owner) {
            return Arc::clone(m.value());
        }
        Arc::clone(self.locks.entry(owner.clone()).or_default().value())
    }

    /// Wait for the owner's lock.
    pub async fn lock(&self, owner: &OwnerId) -> OwnerGuard {
        self.slot(owner).lock_owned().await
    }

    /// Take the owner's lock only if nobody holds it.
    pub fn try_lock(&self, owner: &OwnerId) -> Option<OwnerGuard> {
        self.slot(owner).try_lock_owned().ok()
    }

    /// Number of owners with a lock slot.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop slots that nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
    }
}
