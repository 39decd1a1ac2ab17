//! Sharded cache store with TTL and stale-while-revalidate windows.
//!
//! Entries are immutable once stored; a put replaces the whole
//! `Arc<CacheEntry<T>>`, so readers either see the old entry or the new
//! one, never a partial write. Replacement is monotone in `created_at`:
//! a put carrying an older timestamp than the stored entry is dropped.
//!
//! The store knows nothing about coalescing or providers; the hub
//! orchestrates single-writer behavior per key on top of it.

use crate::clock::{Clock, MonotonicClock};
use crate::fingerprint::Fingerprint;
use crate::telemetry::{CacheOpKind, CoreEvent, Emitter};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cache sizing knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of independent shards; more shards, less lock contention.
    pub shards: usize,
    /// Total entry cap across all shards.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { shards: 8, max_entries: 4_096 }
    }
}

/// One cached value with its freshness windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<T> {
    pub value: T,
    /// Monotonic millis at which the producing fetch completed.
    pub created_at: u64,
    pub fresh_until: u64,
    pub stale_until: u64,
    /// Provider id that produced the value.
    pub source: String,
    pub etag: Option<String>,
}

/// Lookup classification. Expired entries are removed on contact and
/// reported as a miss; they are never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    FreshHit,
    StaleHit,
    Miss,
}

/// Point-in-time counters for the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_serves: u64,
    pub evictions: u64,
    pub bytes_est: usize,
}

struct Stored<T> {
    entry: Arc<CacheEntry<T>>,
    touched: u64,
}

type Shard<T> = Mutex<HashMap<Fingerprint, Stored<T>>>;

pub struct CacheStore<T> {
    shards: Vec<Shard<T>>,
    shard_cap: usize,
    clock: Arc<dyn Clock>,
    emitter: Emitter,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_serves: AtomicU64,
    evictions: AtomicU64,
}

impl<T: Clone> CacheStore<T> {
    pub fn new(config: CacheConfig) -> Self {
        let shards = config.shards.max(1);
        let shard_cap = (config.max_entries / shards).max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            shard_cap,
            clock: Arc::new(MonotonicClock::default()),
            emitter: Emitter::disabled(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_serves: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    fn shard(&self, key: &Fingerprint) -> &Shard<T> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Look up an entry, classifying it against the current clock.
    pub fn get(&self, key: &Fingerprint) -> (Option<Arc<CacheEntry<T>>>, EntryStatus) {
        let now = self.clock.now_millis();
        let mut shard = self.shard(key).lock().unwrap_or_else(|p| p.into_inner());
        match shard.get_mut(key) {
            Some(stored) if now < stored.entry.stale_until => {
                stored.touched = now;
                let entry = Arc::clone(&stored.entry);
                drop(shard);
                if now < entry.fresh_until {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    self.op(CacheOpKind::HitFresh, key);
                    (Some(entry), EntryStatus::FreshHit)
                } else {
                    self.stale_serves.fetch_add(1, Ordering::Relaxed);
                    self.op(CacheOpKind::HitStale, key);
                    (Some(entry), EntryStatus::StaleHit)
                }
            }
            Some(_) => {
                // Expired on contact: destroy and report a miss.
                shard.remove(key);
                drop(shard);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.op(CacheOpKind::Evict, key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.op(CacheOpKind::Miss, key);
                (None, EntryStatus::Miss)
            }
            None => {
                drop(shard);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.op(CacheOpKind::Miss, key);
                (None, EntryStatus::Miss)
            }
        }
    }

    /// Store a value. Returns false when the write was dropped because a
    /// newer entry is already present.
    ///
    /// `stale_ttl` shorter than `fresh_ttl` is lifted to `fresh_ttl`.
    pub fn put(
        &self,
        key: &Fingerprint,
        value: T,
        fresh_ttl: Duration,
        stale_ttl: Duration,
        source: &str,
        etag: Option<String>,
    ) -> bool {
        let now = self.clock.now_millis();
        let stale_ttl = stale_ttl.max(fresh_ttl);
        let entry = CacheEntry {
            value,
            created_at: now,
            fresh_until: now + fresh_ttl.as_millis() as u64,
            stale_until: now + stale_ttl.as_millis() as u64,
            source: source.to_string(),
            etag,
        };

        let mut evicted: Option<Fingerprint> = None;
        {
            let mut shard = self.shard(key).lock().unwrap_or_else(|p| p.into_inner());
            if let Some(existing) = shard.get(key) {
                if existing.entry.created_at > entry.created_at {
                    tracing::debug!(key = %key, "dropping put older than stored entry");
                    return false;
                }
            }
            shard.insert(key.clone(), Stored { entry: Arc::new(entry), touched: now });

            if shard.len() > self.shard_cap {
                // Approximate LRU within the shard.
                if let Some(victim) = shard
                    .iter()
                    .filter(|(k, _)| *k != key)
                    .min_by_key(|(_, s)| s.touched)
                    .map(|(k, _)| k.clone())
                {
                    shard.remove(&victim);
                    evicted = Some(victim);
                }
            }
        }

        self.op(CacheOpKind::Put, key);
        if let Some(victim) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.op(CacheOpKind::Evict, &victim);
        }
        true
    }

    /// Remove an entry immediately. Returns whether one was present.
    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        let removed = self
            .shard(key)
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key)
            .is_some();
        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.op(CacheOpKind::Evict, key);
        }
        removed
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|p| p.into_inner());
            let expired: Vec<_> = shard
                .iter()
                .filter(|(_, s)| now >= s.entry.stale_until)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                shard.remove(&key);
                removed.push(key);
            }
        }
        for key in &removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.op(CacheOpKind::Evict, key);
        }
        removed.len()
    }

    pub fn stats(&self) -> CacheStats {
        let entries: usize = self
            .shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).len())
            .sum();
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_serves: self.stale_serves.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes_est: entries * (mem::size_of::<CacheEntry<T>>() + mem::size_of::<Fingerprint>()),
        }
    }

    fn op(&self, op: CacheOpKind, key: &Fingerprint) {
        self.emitter.emit(CoreEvent::CacheOp { op, key: key.to_string() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fingerprint::Params;

    fn key(name: &str) -> Fingerprint {
        Fingerprint::new(name, &Params::new())
    }

    fn store(clock: &ManualClock) -> CacheStore<i64> {
        CacheStore::new(CacheConfig::default()).with_clock(clock.clone())
    }

    const FRESH: Duration = Duration::from_millis(1_000);
    const STALE: Duration = Duration::from_millis(5_000);

    #[test]
    fn miss_then_put_then_fresh_hit() {
        let clock = ManualClock::new();
        let cache = store(&clock);
        let k = key("btc-price");

        assert_eq!(cache.get(&k).1, EntryStatus::Miss);
        assert!(cache.put(&k, 62_000, FRESH, STALE, "coingecko", None));

        let (entry, status) = cache.get(&k);
        assert_eq!(status, EntryStatus::FreshHit);
        let entry = entry.unwrap();
        assert_eq!(entry.value, 62_000);
        assert_eq!(entry.source, "coingecko");
    }

    #[test]
    fn entry_becomes_stale_then_expired() {
        let clock = ManualClock::new();
        let cache = store(&clock);
        let k = key("btc-price");
        cache.put(&k, 1, FRESH, STALE, "p", None);

        clock.advance(1_500);
        let (entry, status) = cache.get(&k);
        assert_eq!(status, EntryStatus::StaleHit);
        assert_eq!(entry.unwrap().value, 1);

        clock.advance(4_000);
        let (entry, status) = cache.get(&k);
        assert_eq!(status, EntryStatus::Miss);
        assert!(entry.is_none());
        // The expired entry was destroyed on contact.
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn boundary_instants_classify_downward() {
        let clock = ManualClock::new();
        let cache = store(&clock);
        let k = key("k");
        cache.put(&k, 1, FRESH, STALE, "p", None);

        clock.set(1_000); // exactly fresh_until
        assert_eq!(cache.get(&k).1, EntryStatus::StaleHit);
        clock.set(5_000); // exactly stale_until
        assert_eq!(cache.get(&k).1, EntryStatus::Miss);
    }

    #[test]
    fn put_with_older_created_at_is_dropped() {
        let clock = ManualClock::new();
        let cache = store(&clock);
        let k = key("k");

        clock.set(100);
        assert!(cache.put(&k, 2, FRESH, STALE, "newer", None));
        clock.set(50);
        assert!(!cache.put(&k, 1, FRESH, STALE, "older", None));

        clock.set(120);
        let (entry, _) = cache.get(&k);
        assert_eq!(entry.unwrap().value, 2);
    }

    #[test]
    fn replacement_is_monotone_in_created_at() {
        let clock = ManualClock::new();
        let cache = store(&clock);
        let k = key("k");

        let mut last_created = 0;
        for t in [10u64, 20, 30] {
            clock.set(t);
            cache.put(&k, t as i64, FRESH, STALE, "p", None);
            let (entry, _) = cache.get(&k);
            let created = entry.unwrap().created_at;
            assert!(created >= last_created);
            last_created = created;
        }
    }

    #[test]
    fn invalidate_removes_immediately() {
        let clock = ManualClock::new();
        let cache = store(&clock);
        let k = key("k");
        cache.put(&k, 1, FRESH, STALE, "p", None);

        assert!(cache.invalidate(&k));
        assert!(!cache.invalidate(&k));
        assert_eq!(cache.get(&k).1, EntryStatus::Miss);
    }

    #[test]
    fn lru_eviction_at_shard_cap() {
        let clock = ManualClock::new();
        let cache: CacheStore<i64> =
            CacheStore::new(CacheConfig { shards: 1, max_entries: 2 }).with_clock(clock.clone());

        let a = key("a");
        let b = key("b");
        let c = key("c");
        clock.set(10);
        cache.put(&a, 1, FRESH, STALE, "p", None);
        clock.set(20);
        cache.put(&b, 2, FRESH, STALE, "p", None);
        // Touch `a` so `b` is the least recently used.
        clock.set(30);
        cache.get(&a);
        clock.set(40);
        cache.put(&c, 3, FRESH, STALE, "p", None);

        assert_eq!(cache.get(&b).1, EntryStatus::Miss);
        assert_eq!(cache.get(&a).1, EntryStatus::FreshHit);
        assert_eq!(cache.get(&c).1, EntryStatus::FreshHit);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let clock = ManualClock::new();
        let cache = store(&clock);
        let a = key("a");
        let b = key("b");
        cache.put(&a, 1, FRESH, Duration::from_millis(2_000), "p", None);
        cache.put(&b, 2, FRESH, STALE, "p", None);

        clock.set(3_000);
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.get(&b).1, EntryStatus::StaleHit);
    }

    #[test]
    fn stale_ttl_shorter_than_fresh_is_lifted() {
        let clock = ManualClock::new();
        let cache = store(&clock);
        let k = key("k");
        cache.put(&k, 1, FRESH, Duration::from_millis(10), "p", None);

        clock.set(999);
        assert_eq!(cache.get(&k).1, EntryStatus::FreshHit);
    }

    #[test]
    fn stats_count_each_outcome() {
        let clock = ManualClock::new();
        let cache = store(&clock);
        let k = key("k");

        cache.get(&k); // miss
        cache.put(&k, 1, FRESH, STALE, "p", None);
        cache.get(&k); // fresh hit
        clock.advance(2_000);
        cache.get(&k); // stale serve

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.stale_serves, 1);
        assert_eq!(stats.entries, 1);
        assert!(stats.bytes_est > 0);
    }

    #[tokio::test]
    async fn concurrent_readers_and_writers_smoke() {
        let cache: Arc<CacheStore<u64>> = Arc::new(CacheStore::new(CacheConfig::default()));
        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                let k = key(&format!("key-{}", worker % 4));
                for i in 0..100 {
                    cache.put(&k, worker * 1_000 + i, FRESH, STALE, "p", None);
                    let (entry, status) = cache.get(&k);
                    if status != EntryStatus::Miss {
                        // A reader sees a complete entry or nothing.
                        let entry = entry.unwrap();
                        assert!(entry.stale_until >= entry.fresh_until);
                        assert!(entry.fresh_until >= entry.created_at);
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
