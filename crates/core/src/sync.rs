//! Coordination primitives shared by ingestion and garbage collection.
//!
//! - [`KeyedLocks`] serialises ingestions per MRN while leaving different MRNs independent.
//! - [`IngestGate`] lets any number of ingestions run while excluding the garbage collector's
//!   status deletions, so a status canonicalised by an in-flight ingestion cannot be deleted
//!   before that ingestion commits.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One mutex per key, created on demand and dropped once unused.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Clone + Eq + Hash> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_lock<T>(&self, key: &K, f: impl FnOnce() -> T) -> T {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let result = {
            let _held = slot.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        drop(slot);
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(key)
            .is_some_and(|existing| Arc::strong_count(existing) == 1)
        {
            slots.remove(key);
        }
        result
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Shared/exclusive gate between ingestions and garbage-collection deletes.
#[derive(Debug, Default)]
pub struct IngestGate {
    lock: RwLock<()>,
}

impl IngestGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Held by an ingestion from canonicalisation through commit.
    pub fn enter(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Held by the garbage collector around each status deletion batch.
    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().unwrap_or_else(PoisonError::into_inner)
    }
}
