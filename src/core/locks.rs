//! Per-key mutual exclusion
//!
//! The check/mutate/update sequence against the kernel is a classic
//! check-then-act: two requests for the same `(port, range)` must not
//! interleave. [`KeyedLocks`] hands out one async mutex per key, created on
//! first use and dropped from the table once nobody holds or waits on it.
//! Requests for distinct keys never contend beyond the brief table lookup.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub struct KeyedLocks<K> {
    table: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Waits until `key` is free and returns a guard holding it.
    ///
    /// Cancelling the returned future while it waits still releases the
    /// waiter's claim on the table entry.
    pub async fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let slot = {
            let mut table = self.table.lock();
            Arc::clone(table.entry(key.clone()).or_default())
        };
        let claim = SlotClaim {
            locks: self,
            key,
            slot,
        };

        let guard = Arc::clone(&claim.slot).lock_owned().await;

        KeyGuard {
            _guard: guard,
            _claim: claim,
        }
    }

    /// Number of keys currently held or waited on
    pub fn active_keys(&self) -> usize {
        self.table.lock().len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Held lock on one key. Releases the mutex, then the table claim.
pub struct KeyGuard<'a, K: Eq + Hash> {
    _guard: OwnedMutexGuard<()>,
    _claim: SlotClaim<'a, K>,
}

/// A holder's or waiter's reference to a table slot
struct SlotClaim<'a, K: Eq + Hash> {
    locks: &'a KeyedLocks<K>,
    key: K,
    slot: Arc<AsyncMutex<()>>,
}

impl<K: Eq + Hash> Drop for SlotClaim<'_, K> {
    fn drop(&mut self) {
        let mut table = self.locks.table.lock();
        // One reference in the table, one here. Anything more is another
        // holder or waiter that still needs the slot.
        if table
            .get(&self.key)
            .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot) && Arc::strong_count(slot) == 2)
        {
            table.remove(&self.key);
        }
    }
}
