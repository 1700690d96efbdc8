//! In-process result cache keyed by operation and arguments.
//!
//! Values are stored with the time they were computed. A read older than the
//! caller's TTL counts as a miss and recomputes. When the cache is full the
//! oldest inserted key is evicted, regardless of how recently it was read.
//!
//! The lock is never held while a value is being computed, so two callers
//! missing the same key at once may both compute it; the later write wins.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;

/// Deterministic cache key: operation name plus a digest of the arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Fails when `args` has no JSON form, so distinct arguments never share a key.
    pub fn new<A: Serialize + ?Sized>(operation: &str, args: &A) -> serde_json::Result<Self> {
        let encoded = serde_json::to_vec(args)?;
        let digest = Sha256::digest(&encoded);
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Ok(Self(format!("{operation}:{hex}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Entry<V> {
    value: V,
    stored_at: Instant,
    approx_bytes: usize,
}

struct Inner<V> {
    entries: HashMap<CacheKey, Entry<V>>,
    /// Insertion order, oldest first.
    order: VecDeque<CacheKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub total_items: usize,
    pub size_bytes: usize,
    pub max_items: usize,
    pub ttl_seconds: u64,
    pub utilization_percent: f64,
}

pub struct ResultCache<V = serde_json::Value> {
    inner: Mutex<Inner<V>>,
    config: CacheConfig,
}

impl<V: Clone + Serialize> ResultCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            config,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_seconds)
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return a fresh cached value or compute, store and return a new one.
    ///
    /// Failed computations are returned to the caller and not cached.
    pub async fn get_or_compute<F, Fut, E>(&self, key: CacheKey, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if !self.config.enabled || self.config.max_items == 0 {
            return compute().await;
        }

        if let Some(value) = self.lookup(&key, ttl) {
            debug!(key = %key, "Cache hit");
            return Ok(value);
        }

        debug!(key = %key, "Cache miss");
        let value = compute().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    fn lookup(&self, key: &CacheKey, ttl: Duration) -> Option<V> {
        let inner = self.lock();
        inner
            .entries
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < ttl)
            .map(|entry| entry.value.clone())
    }

    fn insert(&self, key: CacheKey, value: V) {
        let approx_bytes = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);
        let entry = Entry {
            value,
            stored_at: Instant::now(),
            approx_bytes,
        };

        let mut inner = self.lock();
        if inner.entries.insert(key.clone(), entry).is_some() {
            // Refreshed entries move to the back of the eviction queue.
            inner.order.retain(|k| k != &key);
        }
        inner.order.push_back(key);

        while inner.entries.len() > self.config.max_items {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            debug!(key = %oldest, "Evicted oldest cache entry");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let total_items = inner.entries.len();
        let size_bytes = inner.entries.values().map(|e| e.approx_bytes).sum();
        let utilization_percent = if self.config.max_items == 0 {
            0.0
        } else {
            let pct = total_items as f64 / self.config.max_items as f64 * 100.0;
            (pct * 100.0).round() / 100.0
        };

        CacheStats {
            enabled: self.config.enabled,
            total_items,
            size_bytes,
            max_items: self.config.max_items,
            ttl_seconds: self.config.ttl_seconds,
            utilization_percent,
        }
    }

    /// Drop every entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.order.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn cache(max_items: usize) -> ResultCache<u32> {
        ResultCache::new(CacheConfig {
            enabled: true,
            ttl_seconds: 1800,
            max_items,
        })
    }

    async fn counted(cache: &ResultCache<u32>, key: &str, calls: &AtomicU32, ttl: Duration) -> u32 {
        cache
            .get_or_compute(CacheKey::new("op", key).unwrap(), ttl, || async {
                Ok::<_, Infallible>(calls.fetch_add(1, Ordering::SeqCst) + 1)
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = CacheKey::new("alerts", &("RJ", 0.7)).unwrap();
        let b = CacheKey::new("alerts", &("RJ", 0.7)).unwrap();
        let c = CacheKey::new("alerts", &("SP", 0.7)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("alerts:"));
        assert_eq!(a.as_str().len(), "alerts:".len() + 64);
    }

    #[test]
    fn test_key_rejects_args_without_json_form() {
        // JSON object keys must be strings.
        let mut by_pair = BTreeMap::new();
        by_pair.insert((1u8, 2u8), "a");
        let mut other = BTreeMap::new();
        other.insert((3u8, 4u8), "b");

        assert!(CacheKey::new("op", &by_pair).is_err());
        assert!(CacheKey::new("op", &other).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl_then_recompute_after_expiry() {
        let cache = cache(10);
        let calls = AtomicU32::new(0);
        let ttl = Duration::from_secs(600);

        assert_eq!(counted(&cache, "k", &calls, ttl).await, 1);
        tokio::time::advance(Duration::from_secs(599)).await;
        assert_eq!(counted(&cache, "k", &calls, ttl).await, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(counted(&cache, "k", &calls, ttl).await, 2);
        assert_eq!(cache.stats().total_items, 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = cache(10);
        let key = CacheKey::new("op", "k").unwrap();

        let failed: Result<u32, &str> = cache
            .get_or_compute(key.clone(), cache.default_ttl(), || async { Err("boom") })
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.stats().total_items, 0);

        let ok: Result<u32, &str> = cache
            .get_or_compute(key, cache.default_ttl(), || async { Ok(7) })
            .await;
        assert_eq!(ok, Ok(7));
        assert_eq!(cache.stats().total_items, 1);
    }

    #[tokio::test]
    async fn test_evicts_oldest_inserted_when_full() {
        let cache = cache(2);
        let calls = AtomicU32::new(0);
        let ttl = cache.default_ttl();

        counted(&cache, "a", &calls, ttl).await;
        counted(&cache, "b", &calls, ttl).await;
        // Reading "a" does not protect it.
        counted(&cache, "a", &calls, ttl).await;
        counted(&cache, "c", &calls, ttl).await;

        assert_eq!(cache.stats().total_items, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // "a" was evicted and must be recomputed, "c" is still cached.
        counted(&cache, "c", &calls, ttl).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        counted(&cache, "a", &calls, ttl).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_disabled_always_computes() {
        let cache = ResultCache::<u32>::new(CacheConfig {
            enabled: false,
            ttl_seconds: 1800,
            max_items: 10,
        });
        let calls = AtomicU32::new(0);
        let ttl = cache.default_ttl();

        counted(&cache, "k", &calls, ttl).await;
        counted(&cache, "k", &calls, ttl).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().total_items, 0);
        assert!(!cache.stats().enabled);
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let cache = cache(4);
        let calls = AtomicU32::new(0);
        let ttl = cache.default_ttl();
        counted(&cache, "a", &calls, ttl).await;
        counted(&cache, "b", &calls, ttl).await;

        let stats = cache.stats();
        assert_eq!(stats.total_items, 2);
        assert_eq!(stats.size_bytes, 2);
        assert_eq!(stats.max_items, 4);
        assert_eq!(stats.ttl_seconds, 1800);
        assert_eq!(stats.utilization_percent, 50.0);

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats().total_items, 0);
        assert_eq!(cache.stats().size_bytes, 0);
    }
}
