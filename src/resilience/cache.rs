//! In-memory response cache with per-entry TTL and LRU eviction.
//!
//! Entries are checked for expiry on every read, so the background sweep is
//! only an optimization. When the cache is full, expired entries are purged
//! first and then the least recently used fraction of capacity is evicted.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use crate::config::CacheConfig;

/// Cache counters. Reading them never changes cache state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub max_entries: usize,
    /// Sum of approximate entry sizes, in bytes.
    pub approximate_size: usize,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    created: Instant,
    ttl: Duration,
    access_count: u64,
    last_access: Instant,
    size: usize,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created) >= self.ttl
    }
}

#[derive(Debug)]
struct Store<V> {
    entries: HashMap<String, Entry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<V> Store<V> {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let removed = before - self.entries.len();
        self.expirations += removed as u64;
        removed
    }
}

/// Size-bounded cache keyed by string.
#[derive(Debug)]
pub struct CacheManager<V> {
    config: CacheConfig,
    store: Mutex<Store<V>>,
}

impl<V> CacheManager<V>
where
    V: Clone + Serialize,
{
    /// Creates an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: Mutex::new(Store {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
        }
    }

    /// Returns the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the cached value, or `None` on a miss.
    ///
    /// An expired entry is removed and counted as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.store.lock();
        let store = &mut *guard;

        let expired = match store.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_access = now;
                let value = entry.value.clone();
                store.hits += 1;
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            store.entries.remove(key);
            store.expirations += 1;
        }
        store.misses += 1;
        None
    }

    /// Inserts or overwrites `key`, using the default TTL when `ttl` is `None`.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        if self.config.max_entries == 0 {
            return;
        }
        let key = key.into();
        let now = Instant::now();
        let size = approximate_size(&key, &value);
        let mut store = self.store.lock();

        if !store.entries.contains_key(&key) && store.entries.len() >= self.config.max_entries {
            store.purge_expired(now);
            if store.entries.len() >= self.config.max_entries {
                self.evict(&mut store);
            }
        }

        store.entries.insert(
            key,
            Entry {
                value,
                created: now,
                ttl: ttl.unwrap_or_else(|| self.config.default_ttl()),
                access_count: 0,
                last_access: now,
                size,
            },
        );
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.store.lock().entries.remove(key).is_some()
    }

    /// Removes every entry. Counters are kept.
    pub fn clear(&self) {
        self.store.lock().entries.clear();
    }

    /// Returns true if `key` holds an unexpired value. Does not count as an access.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.store
            .lock()
            .entries
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false)
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired entry and returns how many were removed.
    pub fn sweep(&self) -> usize {
        let removed = self.store.lock().purge_expired(Instant::now());
        if removed > 0 {
            tracing::debug!(removed, "swept expired cache entries");
        }
        removed
    }

    /// Returns current counters.
    pub fn stats(&self) -> CacheStats {
        let store = self.store.lock();
        let lookups = store.hits + store.misses;
        CacheStats {
            hits: store.hits,
            misses: store.misses,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                store.hits as f64 / lookups as f64
            },
            evictions: store.evictions,
            expirations: store.expirations,
            entries: store.entries.len(),
            max_entries: self.config.max_entries,
            approximate_size: store.entries.values().map(|e| e.size).sum(),
        }
    }

    fn evict(&self, store: &mut Store<V>) {
        let max = self.config.max_entries;
        let count = ((max as f64 * self.config.eviction_fraction).ceil() as usize)
            .max(1)
            .min(store.entries.len());

        let mut order: Vec<(Instant, u64, String)> = store
            .entries
            .iter()
            .map(|(k, e)| (e.last_access, e.access_count, k.clone()))
            .collect();
        order.sort();

        for (_, _, key) in order.into_iter().take(count) {
            store.entries.remove(&key);
        }
        store.evictions += count as u64;
        tracing::debug!(evicted = count, max_entries = max, "cache full, evicted entries");
    }
}

impl<V> CacheManager<V>
where
    V: Clone + Serialize + Send + 'static,
{
    /// Starts a background task that sweeps expired entries periodically.
    ///
    /// The task holds a weak reference and stops once the cache is dropped.
    /// Returns `None` when the sweep is disabled or no runtime is running.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.sweep_interval()?;
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let weak: Weak<Self> = Arc::downgrade(self);

        Some(handle.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                    }
                    None => break,
                }
            }
        }))
    }
}

/// JSON length of the value plus the key, at two bytes per character.
fn approximate_size<V: Serialize>(key: &str, value: &V) -> usize {
    let json = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
    (key.len() + json) * 2
}
