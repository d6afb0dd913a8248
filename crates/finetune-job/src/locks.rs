//! Per-key serialization of reconcile passes
//!
//! The controller runtime already avoids running two reconciles for the same
//! object at once. The engine does not rely on that: every pass holds the
//! lock for its TrainingJob key for its whole duration.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::store::ObjectKey;

/// Lock table keyed by TrainingJob namespace and name
#[derive(Default)]
pub struct KeyLocks {
    locks: DashMap<ObjectKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &ObjectKey) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(key.clone()).or_default().clone();
        mutex.lock_owned().await
    }

    /// Drop the entry for `key` if nobody holds or waits for it
    pub fn prune(&self, key: &ObjectKey) {
        self.locks
            .remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no key is tracked
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
