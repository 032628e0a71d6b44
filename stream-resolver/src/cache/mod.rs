//! Bounded TTL caches and request coalescing.
//!
//! [`TtlCache`] is a size-bounded store with per-entry expiry and LRU eviction.
//! [`CacheLayer`] bundles the three namespaces used during resolution (stream,
//! validation, negative) together with the in-flight map used to coalesce
//! identical concurrent resolutions.

mod layer;
mod singleflight;

pub use layer::{CacheLayer, CacheLayerConfig, CacheLayerStats, FlightResult, NegativeEntry};
pub use singleflight::{Flight, InFlightState, LeaderGuard, SingleFlight};

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

/// A cached value with its expiration time and recency stamp.
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    tick: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct CacheInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Recency index: smallest tick is least recently used.
    recency: BTreeMap<u64, K>,
    next_tick: u64,
}

impl<K: Eq + Hash + Clone, V> CacheInner<K, V> {
    fn touch(&mut self, key: &K) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }
}

/// Size-bounded TTL cache with least-recently-used eviction.
///
/// Expired entries are dropped lazily on `get` and eagerly by [`TtlCache::cleanup_expired`].
pub struct TtlCache<K, V> {
    name: &'static str,
    inner: Mutex<CacheInner<K, V>>,
    default_ttl: Duration,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: &'static str, default_ttl: Duration, max_size: usize) -> Self {
        Self {
            name,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
            }),
            default_ttl,
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a live entry, refreshing its recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = inner.entries.get(key).map(|entry| entry.is_expired(now));
        match expired {
            None => {
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(true) => {
                inner.remove(key);
                drop(inner);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(false) => {}
        }

        inner.touch(key);
        let value = inner.entries.get(key).map(|e| e.value.clone());
        drop(inner);
        self.hits.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Insert with the store's default TTL.
    pub fn insert(&self, key: K, value: V) {
        self.set(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL, evicting the least recently used entries when full.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let mut inner = self.inner.lock();
        inner.remove(&key);

        let tick = inner.next_tick;
        inner.next_tick += 1;
        inner.recency.insert(tick, key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
                tick,
            },
        );

        while inner.entries.len() > self.max_size {
            let Some((_, oldest)) = inner.recency.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
            trace!(cache = self.name, "Evicted least recently used entry");
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key).map(|e| e.value)
    }

    /// Drop every entry. Hit/miss counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Remove all expired entries, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size: self.len(),
            max_size: self.max_size,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}

/// Statistics for one cache namespace.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}
