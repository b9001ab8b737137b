//! Bounded concurrent map with bulk eviction.
//!
//! The map holds at most `capacity` entries. Inserting a new key at
//! capacity first evicts a fixed percentage of entries (minimum one) in
//! iteration order, which amortises eviction cost under churn. Callers
//! that need per-entry TTLs layer them on top of the stored values, as the
//! resolution cache does.

use parking_lot::RwLock;
use std::collections::HashMap;

/// The default eviction percentage, applied when the map reaches its
/// capacity at insertion.
pub const DEFAULT_EVICTION_PERCENTAGE: usize = 5;

/// A fixed-capacity map that can be safely accessed concurrently.
///
/// Readers proceed in parallel; writers are exclusive. Eviction order is
/// the map's iteration order and is deliberately unspecified: tests may
/// assert how many entries survive, never which.
pub struct SyncMap<V> {
    entries: RwLock<HashMap<String, V>>,
    capacity: usize,
    eviction_percentage: usize,
}

impl<V: Clone> SyncMap<V> {
    /// Create a map holding at most `capacity` entries. A capacity below 1
    /// is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        Self::with_eviction_percentage(capacity, DEFAULT_EVICTION_PERCENTAGE)
    }

    /// Create a map with an explicit eviction percentage.
    pub fn with_eviction_percentage(capacity: usize, eviction_percentage: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            eviction_percentage,
        }
    }

    /// Retrieve the value associated with `key`, if present.
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Insert or update an entry.
    ///
    /// If `key` is new and the map is at capacity, `max(1, len * pct / 100)`
    /// entries are evicted before the insertion. Updates never evict.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let mut entries = self.entries.write();

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let num_to_evict = (entries.len() * self.eviction_percentage / 100).max(1);
            let victims: Vec<String> = entries.keys().take(num_to_evict).cloned().collect();
            for victim in victims {
                entries.remove(&victim);
            }
        }

        entries.insert(key, value);
    }

    /// Remove the entry with `key`. Does nothing if the key is absent.
    pub fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of the current keys, in iteration order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}
