//! Thread-safe LRU+TTL cache for callback results.
//!
//! Results are keyed by the function name and the compact serialisation of
//! its arguments. Every entry expires a fixed TTL after insertion; capacity
//! eviction removes the least recently written entries first. The hit path
//! takes only the read lock and deliberately does not refresh LRU order, so
//! concurrent readers never contend; recency changes on `put` alone.

use crate::config::CallbackWrapper;
use crate::value::ValueExt;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Decides whether results for a given function may be cached. Returning
/// `false` keeps side-effectful or non-deterministic callbacks out of the
/// cache.
pub type CachePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CallbackCacheConfig {
    /// Time-to-live for cached entries.
    pub ttl: Duration,
    /// Maximum number of entries; 0 means unbounded.
    pub max_entries: usize,
    /// Cache null results. Usually off: null-returning callbacks exist for
    /// their side effects.
    pub cache_void_callbacks: bool,
}

impl Default for CallbackCacheConfig {
    fn default() -> Self {
        CallbackCacheConfig {
            ttl: Duration::from_secs(5),
            max_entries: 10_000,
            cache_void_callbacks: false,
        }
    }
}

struct Entry {
    value: Value,
    expires_at: Instant,
    generation: u64,
}

/// Map plus a generation-stamped recency queue. A `put` pushes a fresh
/// stamp and bumps the entry's generation; stamps whose generation no
/// longer matches are skipped lazily during eviction.
#[derive(Default)]
struct Inner {
    map: HashMap<String, Entry>,
    recency: VecDeque<(String, u64)>,
    next_generation: u64,
}

pub struct CallbackCache {
    inner: RwLock<Inner>,
    predicate: RwLock<Option<CachePredicate>>,
    config: CallbackCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CallbackCache {
    pub fn new(config: CallbackCacheConfig) -> Self {
        CallbackCache {
            inner: RwLock::new(Inner::default()),
            predicate: RwLock::new(None),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Sets the predicate deciding which callbacks are cached. Without one,
    /// everything is.
    pub fn set_cache_predicate(&self, predicate: CachePredicate) {
        *self.predicate.write().unwrap() = Some(predicate);
    }

    /// Cache key: `name:arg1,arg2,…` with compact JSON for each argument;
    /// a null argument serialises as `null`.
    fn make_key(function_name: &str, args: &[Value]) -> String {
        let mut key = String::with_capacity(function_name.len() + 1 + args.len() * 16);
        key.push_str(function_name);
        key.push(':');
        for (index, arg) in args.iter().enumerate() {
            if index > 0 {
                key.push(',');
            }
            key.push_str(&arg.dump());
        }
        key
    }

    /// Read-only lookup. Hits do not move the entry in the LRU order.
    pub fn try_get(&self, function_name: &str, args: &[Value]) -> Option<Value> {
        let key = Self::make_key(function_name, args);
        let now = Instant::now();
        {
            let inner = self.inner.read().unwrap();
            if let Some(entry) = inner.map.get(&key) {
                if entry.expires_at > now {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(function = function_name, "callback cache hit");
                    return Some(entry.value.clone());
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, function_name: &str, args: &[Value], value: &Value) {
        if value.is_null() && !self.config.cache_void_callbacks {
            return;
        }
        let key = Self::make_key(function_name, args);
        let expires_at = Instant::now() + self.config.ttl;

        let mut inner = self.inner.write().unwrap();
        self.drain_expired(&mut inner);

        if inner.map.contains_key(&key) {
            let generation = inner.next_generation;
            inner.next_generation += 1;
            if let Some(entry) = inner.map.get_mut(&key) {
                entry.value = value.clone();
                entry.expires_at = expires_at;
                entry.generation = generation;
            }
            inner.recency.push_back((key, generation));
        } else {
            if self.config.max_entries > 0 {
                self.evict_to_capacity(&mut inner);
            }
            let generation = inner.next_generation;
            inner.next_generation += 1;
            inner.map.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    expires_at,
                    generation,
                },
            );
            inner.recency.push_back((key, generation));
        }
    }

    /// Removes expired entries from the cold end of the queue.
    fn drain_expired(&self, inner: &mut Inner) {
        let now = Instant::now();
        loop {
            let Some((key, generation)) = inner.recency.front() else {
                break;
            };
            match inner.map.get(key) {
                Some(entry) if entry.generation == *generation => {
                    if entry.expires_at > now {
                        break;
                    }
                    let key = key.clone();
                    inner.recency.pop_front();
                    inner.map.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                // Stale stamp: the entry was re-put or invalidated.
                _ => {
                    inner.recency.pop_front();
                }
            }
        }
    }

    fn evict_to_capacity(&self, inner: &mut Inner) {
        while inner.map.len() >= self.config.max_entries {
            let Some((key, generation)) = inner.recency.pop_front() else {
                break;
            };
            let live = inner
                .map
                .get(&key)
                .map(|entry| entry.generation == generation)
                .unwrap_or(false);
            if live {
                inner.map.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.map.clear();
        inner.recency.clear();
    }

    /// Removes every cached entry for the given function name, regardless
    /// of arguments. Returns the number of entries removed.
    pub fn invalidate(&self, function_name: &str) -> usize {
        let prefix = format!("{function_name}:");
        let mut inner = self.inner.write().unwrap();
        let before = inner.map.len();
        inner.map.retain(|key, _| !key.starts_with(&prefix));
        before - inner.map.len()
    }

    /// A [`CallbackWrapper`] that consults the cache before executing the
    /// callback and stores the result afterwards.
    pub fn make_caching_wrapper(self: Arc<Self>) -> CallbackWrapper {
        let cache = self;
        Arc::new(move |name, args, thunk| {
            let predicate = cache.predicate.read().unwrap().clone();
            if let Some(predicate) = predicate {
                if !predicate(name) {
                    return thunk();
                }
            }
            if let Some(value) = cache.try_get(name, args) {
                return Ok(value);
            }
            let value = thunk()?;
            cache.put(name, args, &value);
            Ok(value)
        })
    }

    /// Like [`CallbackCache::make_caching_wrapper`], but delegates misses to
    /// `inner` so caching can be chained with other instrumentation such as
    /// tracing.
    pub fn make_caching_wrapper_with_inner(self: Arc<Self>, inner: CallbackWrapper) -> CallbackWrapper {
        let cache = self;
        Arc::new(move |name, args, thunk| {
            let predicate = cache.predicate.read().unwrap().clone();
            if let Some(predicate) = predicate {
                if !predicate(name) {
                    return inner(name, args, thunk);
                }
            }
            if let Some(value) = cache.try_get(name, args) {
                return Ok(value);
            }
            let value = inner(name, args, thunk)?;
            cache.put(name, args, &value);
            Ok(value)
        })
    }

    // Statistics. Counters are relaxed atomics; values are approximate
    // under contention.

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    pub fn config(&self) -> &CallbackCacheConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_cache(max_entries: usize, ttl: Duration) -> CallbackCache {
        CallbackCache::new(CallbackCacheConfig {
            ttl,
            max_entries,
            cache_void_callbacks: false,
        })
    }

    #[test]
    fn test_put_and_get() {
        let cache = small_cache(10, Duration::from_secs(60));
        cache.put("f", &[json!(1)], &json!("one"));
        assert_eq!(cache.try_get("f", &[json!(1)]), Some(json!("one")));
        assert_eq!(cache.try_get("f", &[json!(2)]), None);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_key_format_distinguishes_args() {
        assert_eq!(
            CallbackCache::make_key("f", &[json!(1), json!("a"), Value::Null]),
            "f:1,\"a\",null"
        );
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = small_cache(10, Duration::from_millis(30));
        cache.put("f", &[], &json!(1));
        assert_eq!(cache.try_get("f", &[]), Some(json!(1)));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.try_get("f", &[]), None);
    }

    #[test]
    fn test_capacity_eviction_drops_oldest() {
        let cache = small_cache(2, Duration::from_secs(60));
        cache.put("f", &[json!(1)], &json!(1));
        cache.put("f", &[json!(2)], &json!(2));
        cache.put("f", &[json!(3)], &json!(3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.try_get("f", &[json!(1)]), None);
        assert_eq!(cache.try_get("f", &[json!(3)]), Some(json!(3)));
        assert!(cache.evictions() >= 1);
    }

    #[test]
    fn test_update_refreshes_recency() {
        let cache = small_cache(2, Duration::from_secs(60));
        cache.put("f", &[json!(1)], &json!(1));
        cache.put("f", &[json!(2)], &json!(2));
        // Re-put the first entry; the second becomes the eviction victim.
        cache.put("f", &[json!(1)], &json!(10));
        cache.put("f", &[json!(3)], &json!(3));
        assert_eq!(cache.try_get("f", &[json!(1)]), Some(json!(10)));
        assert_eq!(cache.try_get("f", &[json!(2)]), None);
    }

    #[test]
    fn test_null_results_not_cached_by_default() {
        let cache = small_cache(10, Duration::from_secs(60));
        cache.put("f", &[], &Value::Null);
        assert!(cache.is_empty());

        let caching = CallbackCache::new(CallbackCacheConfig {
            cache_void_callbacks: true,
            ..CallbackCacheConfig::default()
        });
        caching.put("f", &[], &Value::Null);
        assert_eq!(caching.len(), 1);
    }

    #[test]
    fn test_invalidate_by_function_name() {
        let cache = small_cache(10, Duration::from_secs(60));
        cache.put("f", &[json!(1)], &json!(1));
        cache.put("f", &[json!(2)], &json!(2));
        cache.put("g", &[json!(1)], &json!(3));
        assert_eq!(cache.invalidate("f"), 2);
        assert_eq!(cache.try_get("f", &[json!(1)]), None);
        assert_eq!(cache.try_get("g", &[json!(1)]), Some(json!(3)));
    }

    #[test]
    fn test_caching_wrapper_skips_thunk_on_hit() {
        use std::sync::atomic::AtomicUsize;

        let cache = Arc::new(small_cache(10, Duration::from_secs(60)));
        let wrapper = Arc::clone(&cache).make_caching_wrapper();
        let calls = AtomicUsize::new(0);
        let thunk = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(42))
        };
        assert_eq!(wrapper("f", &[json!(1)], &thunk).unwrap(), json!(42));
        assert_eq!(wrapper("f", &[json!(1)], &thunk).unwrap(), json!(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_predicate_vetoes_caching() {
        use std::sync::atomic::AtomicUsize;

        let cache = Arc::new(small_cache(10, Duration::from_secs(60)));
        cache.set_cache_predicate(Arc::new(|name| name != "random"));
        let wrapper = Arc::clone(&cache).make_caching_wrapper();
        let calls = AtomicUsize::new(0);
        let thunk = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!(7))
        };
        wrapper("random", &[], &thunk).unwrap();
        wrapper("random", &[], &thunk).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }
}
