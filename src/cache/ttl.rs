use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry cap. Zero disables storage entirely (every get misses).
    pub max_entries: usize,
    /// Age after which an entry is treated as absent.
    #[serde(with = "crate::config::serde_millis")]
    pub ttl: Duration,
    /// How often the background sweep removes expired entries.
    #[serde(with = "crate::config::serde_millis")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

struct Entry<V> {
    value: V,
    refreshed_at: Instant,
}

/// Map plus recency order. The front of `order` is the least recently used
/// key; both structures are mutated together under one lock.
struct CacheInner<V> {
    map: HashMap<String, Entry<V>>,
    order: VecDeque<String>,
}

impl<V> CacheInner<V> {
    fn forget_key(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
    }

    fn promote_key(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}

#[derive(Debug, Default)]
struct CacheStatsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    inserts: AtomicU64,
}

/// Fixed-capacity TTL cache with least-recently-used eviction.
///
/// A hit refreshes both the entry's recency position and its expiry clock.
/// All access goes through one mutex; callers across threads see a
/// consistent map-plus-order pair.
pub struct ResponseCache<V> {
    config: CacheConfig,
    inner: Mutex<CacheInner<V>>,
    stats: CacheStatsCollector,
}

impl<V: Clone + Send + 'static> ResponseCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            stats: CacheStatsCollector::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = inner
            .map
            .get(key)
            .map(|entry| entry.refreshed_at.elapsed() > self.config.ttl);

        match expired {
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(true) => {
                inner.map.remove(key);
                inner.forget_key(key);
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(false) => {
                inner.promote_key(key);
                let value = inner.map.get_mut(key).map(|entry| {
                    entry.refreshed_at = Instant::now();
                    entry.value.clone()
                });
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                value
            }
        }
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        if self.config.max_entries == 0 {
            return;
        }
        let key = key.into();
        let mut inner = self.inner.lock();

        if inner.map.remove(&key).is_some() {
            inner.forget_key(&key);
        } else if inner.map.len() >= self.config.max_entries {
            if let Some(victim) = inner.order.pop_front() {
                inner.map.remove(&victim);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %victim, "evicted least recently used cache entry");
            }
        }

        inner.map.insert(
            key.clone(),
            Entry {
                value,
                refreshed_at: Instant::now(),
            },
        );
        inner.order.push_back(key);
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry regardless of access. Returns the count.
    pub fn sweep(&self) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let ttl = self.config.ttl;
        let before = inner.map.len();
        inner.map.retain(|_, entry| entry.refreshed_at.elapsed() <= ttl);
        let removed = before - inner.map.len();
        if removed > 0 {
            let map = &inner.map;
            inner.order.retain(|key| map.contains_key(key));
            self.stats.expired.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Spawn the periodic sweep loop. Stops when `cancel` fires.
    pub fn start_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "cache sweep removed expired entries");
                        }
                    }
                }
            }
        })
    }

    /// Rough in-memory footprint, for pressure accounting.
    pub fn approx_memory_bytes(&self) -> usize {
        let inner = self.inner.lock();
        let entry_overhead = std::mem::size_of::<Entry<V>>() + std::mem::size_of::<String>();
        let key_bytes: usize = inner.order.iter().map(String::len).sum();
        inner
            .map
            .len()
            .saturating_mul(entry_overhead)
            .saturating_add(key_bytes)
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            size: self.len(),
            max_entries: self.config.max_entries,
            ttl_ms: self.config.ttl.as_millis() as u64,
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
        }
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Immutable snapshot of cache state, polled by the telemetry collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub size: usize,
    pub max_entries: usize,
    pub ttl_ms: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub inserts: u64,
}
