//! Weakly keyed maps
//!
//! Engine state hangs off loaders and instances it must never keep alive.
//! `WeakKeyMap` keys entries by the address of an `Arc` and keeps a `Weak`
//! next to the value. While that `Weak` exists the allocation cannot be
//! reused, so an address identifies at most one live key. Entries whose key
//! has been dropped are skipped by every lookup and dropped by `purge`.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

struct WeakEntry<K, V> {
    key: Weak<K>,
    value: V,
}

impl<K, V> WeakEntry<K, V> {
    fn is_live(&self) -> bool {
        self.key.strong_count() > 0
    }
}

/// Map from `Arc<K>` identity to `V` that does not keep keys alive
pub struct WeakKeyMap<K, V> {
    entries: RwLock<FxHashMap<usize, WeakEntry<K, V>>>,
    inserts_since_purge: AtomicUsize,
}

impl<K, V> Default for WeakKeyMap<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            inserts_since_purge: AtomicUsize::new(0),
        }
    }
}

impl<K, V> fmt::Debug for WeakKeyMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakKeyMap")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}

#[inline]
fn address<K>(key: &Arc<K>) -> usize {
    Arc::as_ptr(key) as usize
}

impl<K, V: Clone> WeakKeyMap<K, V> {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for a live key
    pub fn get(&self, key: &Arc<K>) -> Option<V> {
        let entries = self.entries.read();
        entries
            .get(&address(key))
            .filter(|e| e.is_live())
            .map(|e| e.value.clone())
    }

    /// Value for `key`, inserting `make()` when absent
    pub fn get_or_insert_with(&self, key: &Arc<K>, make: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(key) {
            return value;
        }

        let mut entries = self.entries.write();
        self.maybe_purge(&mut entries);
        let entry = entries.entry(address(key)).or_insert_with(|| WeakEntry {
            key: Arc::downgrade(key),
            value: make(),
        });
        entry.value.clone()
    }

    /// Insert or replace the value for `key`
    pub fn insert(&self, key: &Arc<K>, value: V) -> Option<V> {
        let mut entries = self.entries.write();
        self.maybe_purge(&mut entries);
        entries
            .insert(
                address(key),
                WeakEntry {
                    key: Arc::downgrade(key),
                    value,
                },
            )
            .filter(|e| e.is_live())
            .map(|e| e.value)
    }

    /// Remove the entry for `key`
    pub fn remove(&self, key: &Arc<K>) -> Option<V> {
        self.entries
            .write()
            .remove(&address(key))
            .filter(|e| e.is_live())
            .map(|e| e.value)
    }

    /// Live keys with their values
    pub fn entries(&self) -> Vec<(Arc<K>, V)> {
        self.entries
            .read()
            .values()
            .filter_map(|e| e.key.upgrade().map(|k| (k, e.value.clone())))
            .collect()
    }

    /// Number of entries whose key is still alive
    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|e| e.is_live()).count()
    }

    /// Whether no live entries remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries whose key has been collected, returning how many were dropped
    pub fn purge(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_live());
        self.inserts_since_purge.store(0, Ordering::Relaxed);
        before - entries.len()
    }

    /// Amortized cleanup: sweep once the number of inserts since the last
    /// sweep reaches the table size.
    fn maybe_purge(&self, entries: &mut FxHashMap<usize, WeakEntry<K, V>>) {
        let inserts = self.inserts_since_purge.fetch_add(1, Ordering::Relaxed) + 1;
        if inserts >= entries.len().max(16) {
            entries.retain(|_, e| e.is_live());
            self.inserts_since_purge.store(0, Ordering::Relaxed);
        }
    }
}
