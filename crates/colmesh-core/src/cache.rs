//! Memory-bounded counting cache for column shards.
//!
//! Entries are keyed by two levels (shard, column) so a whole shard can be
//! invalidated at once. Each entry counts its accesses; when the resident size
//! exceeds the byte budget the entry with the lowest count is evicted, the
//! oldest insertion losing ties.
//!
//! Values are handed out as `Arc`s. Evicting an entry only drops the cache's
//! reference, so a reader holding a handle keeps the data alive.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use colmesh_proto::ShardId;
use parking_lot::RwLock;
use tracing::debug;

use crate::storage::{ColumnShard, ShardEventListener, TableShard};

/// Approximate memory footprint of a cached value.
pub trait CacheSize {
    fn approximate_size_in_bytes(&self) -> usize;
}

/// Cache of column shards keyed by (shard, column name).
pub type ColumnShardCache = CountingCache<ShardId, String, ColumnShard>;

struct CacheEntry<V> {
    value: Arc<V>,
    size: usize,
    hits: AtomicU64,
    inserted: u64,
}

impl<V> CacheEntry<V> {
    fn record_hit(&self) {
        self.hits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn hits(&self) -> u64 {
        self.hits.load(AtomicOrdering::Relaxed)
    }
}

struct CacheState<K1, K2, V> {
    entries: HashMap<K1, HashMap<K2, CacheEntry<V>>>,
    resident_bytes: usize,
    next_seq: u64,
}

/// Two-level keyed cache with a hard byte budget and count-based eviction.
pub struct CountingCache<K1, K2, V> {
    state: RwLock<CacheState<K1, K2, V>>,
    max_bytes: usize,
    stats: CacheStats,
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    rejected: AtomicU64,
}

impl CacheStats {
    /// Get hit count.
    pub fn hits(&self) -> u64 {
        self.hits.load(AtomicOrdering::Relaxed)
    }

    /// Get miss count.
    pub fn misses(&self) -> u64 {
        self.misses.load(AtomicOrdering::Relaxed)
    }

    /// Get eviction count.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(AtomicOrdering::Relaxed)
    }

    /// Values returned to the caller but too large to keep.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(AtomicOrdering::Relaxed)
    }

    /// Calculate hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

impl<K1, K2, V> CountingCache<K1, K2, V>
where
    K1: Eq + Hash + Clone,
    K2: Eq + Hash + Clone,
    V: CacheSize,
{
    /// Create a cache holding at most `max_bytes` of values.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                resident_bytes: 0,
                next_seq: 0,
            }),
            max_bytes,
            stats: CacheStats::default(),
        }
    }

    /// Look up a value, counting the access. Never loads.
    pub fn get<Q>(&self, k1: &K1, k2: &Q) -> Option<Arc<V>>
    where
        K2: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let state = self.state.read();
        match state.entries.get(k1).and_then(|m| m.get(k2)) {
            Some(entry) => {
                entry.record_hit();
                self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                self.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);
                None
            }
        }
    }

    /// Insert a value, replacing any previous value under the same key.
    ///
    /// Evicts until the resident size fits the budget. A value larger than the
    /// whole budget is returned but not kept.
    pub fn put(&self, k1: K1, k2: K2, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let mut state = self.state.write();
        self.insert_locked(&mut state, k1, k2, value.clone());
        value
    }

    /// Return the cached value or load it.
    ///
    /// The loader runs without holding the cache lock. If another caller
    /// inserted the same key meanwhile, that entry wins and is returned.
    pub fn get_or_load<E, F>(&self, k1: K1, k2: K2, load: F) -> Result<Option<Arc<V>>, E>
    where
        F: FnOnce() -> Result<Option<V>, E>,
    {
        if let Some(value) = self.get(&k1, &k2) {
            return Ok(Some(value));
        }

        let Some(loaded) = load()? else {
            return Ok(None);
        };
        let loaded = Arc::new(loaded);

        let mut state = self.state.write();
        if let Some(existing) = state.entries.get(&k1).and_then(|m| m.get(&k2)) {
            existing.record_hit();
            return Ok(Some(existing.value.clone()));
        }
        self.insert_locked(&mut state, k1, k2, loaded.clone());
        Ok(Some(loaded))
    }

    fn insert_locked(&self, state: &mut CacheState<K1, K2, V>, k1: K1, k2: K2, value: Arc<V>) {
        let size = value.approximate_size_in_bytes();

        let replaced = state
            .entries
            .get_mut(&k1)
            .and_then(|m| m.remove(&k2))
            .map(|old| old.size);
        if let Some(old_size) = replaced {
            state.resident_bytes -= old_size;
        }

        if size > self.max_bytes {
            self.stats.rejected.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(size, max_bytes = self.max_bytes, "Value exceeds cache budget, not cached");
            prune_empty(state, &k1);
            return;
        }

        let inserted = state.next_seq;
        state.next_seq += 1;
        state.resident_bytes += size;
        state.entries.entry(k1).or_default().insert(
            k2,
            CacheEntry {
                value,
                size,
                hits: AtomicU64::new(0),
                inserted,
            },
        );

        while state.resident_bytes > self.max_bytes {
            if !self.evict_one(state) {
                break;
            }
        }
    }

    /// Drop the entry with the lowest access count, oldest first on ties.
    fn evict_one(&self, state: &mut CacheState<K1, K2, V>) -> bool {
        let victim = state
            .entries
            .iter()
            .flat_map(|(k1, m)| m.iter().map(move |(k2, e)| ((e.hits(), e.inserted), k1, k2)))
            .min_by_key(|(rank, _, _)| *rank)
            .map(|(_, k1, k2)| (k1.clone(), k2.clone()));

        let Some((k1, k2)) = victim else {
            return false;
        };
        if let Some(entry) = state.entries.get_mut(&k1).and_then(|m| m.remove(&k2)) {
            state.resident_bytes -= entry.size;
            self.stats.evictions.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(size = entry.size, hits = entry.hits(), "Evicted cache entry");
        }
        prune_empty(state, &k1);
        true
    }

    /// Remove one entry. Removing an absent key is a no-op.
    pub fn remove_from_cache<Q>(&self, k1: &K1, k2: &Q) -> bool
    where
        K2: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut state = self.state.write();
        let removed = state.entries.get_mut(k1).and_then(|m| m.remove(k2));
        match removed {
            Some(entry) => {
                state.resident_bytes -= entry.size;
                prune_empty(&mut state, k1);
                true
            }
            None => false,
        }
    }

    /// Remove every entry under a first-level key. Returns how many were removed.
    pub fn remove_all(&self, k1: &K1) -> usize {
        let mut state = self.state.write();
        match state.entries.remove(k1) {
            Some(entries) => {
                let freed: usize = entries.values().map(|e| e.size).sum();
                state.resident_bytes -= freed;
                entries.len()
            }
            None => 0,
        }
    }

    pub fn contains<Q>(&self, k1: &K1, k2: &Q) -> bool
    where
        K2: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.state
            .read()
            .entries
            .get(k1)
            .is_some_and(|m| m.contains_key(k2))
    }

    /// Bytes currently accounted to cached values.
    pub fn resident_bytes(&self) -> usize {
        self.state.read().resident_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.state.read().entries.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Clear all cached entries.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        state.resident_bytes = 0;
    }
}

fn prune_empty<K1: Eq + Hash, K2, V>(state: &mut CacheState<K1, K2, V>, k1: &K1) {
    if state.entries.get(k1).is_some_and(|m| m.is_empty()) {
        state.entries.remove(k1);
    }
}

impl ShardEventListener for ColumnShardCache {
    fn shard_loaded(&self, _shard: &TableShard) {}

    fn shard_unloaded(&self, shard: &ShardId) {
        let removed = self.remove_all(shard);
        debug!(shard = %shard, removed, "Invalidated cached columns of unloaded shard");
    }
}
