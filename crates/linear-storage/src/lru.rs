//! Size-bounded LRU Cache with Load Deduplication
//!
//! A generic cache that bounds the *total size* of its entries rather than
//! their number, and makes sure concurrent misses on the same key run the
//! loader only once.
//!
//! ## How It Works
//!
//! ```text
//! get_or_load(key, load)
//!         ↓
//! lock ── resident? ──YES──→ move to MRU, return clone
//!         │
//!         NO
//!         ↓
//!     in flight? ──YES──→ clone shared future
//!         │
//!         NO
//!         ↓
//! register shared future for key
//!         ↓
//! unlock, await shared future
//!         ↓
//! (future body) load() ── error ──→ unregister, every waiter sees the error
//!         │
//!         ok (value, size)
//!         ↓
//! lock, unregister, evict LRU until size fits, insert at MRU
//! ```
//!
//! The global lock is only held for O(1) bookkeeping and never across an
//! `.await`. The loader runs inside the shared future, so whoever polls it
//! drives it: if every waiter is dropped the load is parked and the next
//! caller for that key resumes it.
//!
//! Recency order and the key map come from the `lru` crate's unbounded cache;
//! this type adds byte accounting and the in-flight map on top.
//!
//! ## Eviction
//!
//! `on_remove` runs for every entry evicted under size pressure, while the
//! global lock is held. It must not call back into the same cache.
//!
//! ## Example
//!
//! ```ignore
//! let cache = LruCache::new(1024, |key: &String, _value: &Bytes| {
//!     tracing::debug!(key = %key, "evicted");
//! });
//!
//! let value = cache
//!     .get_or_load("a".to_string(), || async {
//!         let data = Bytes::from_static(b"hello");
//!         let size = data.len() as u64;
//!         Ok((data, size))
//!     })
//!     .await?;
//! ```

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A load in flight, awaited by every concurrent caller for the same key
type PendingLoad<V> = Shared<BoxFuture<'static, std::result::Result<V, Arc<Error>>>>;

type RemoveFn<K, V> = dyn Fn(&K, &V) + Send + Sync;

struct Resident<V> {
    value: V,
    size: u64,
}

struct State<K: Hash + Eq, V> {
    /// Resident entries, most recently used first
    entries: lru::LruCache<K, Resident<V>>,

    /// Loads in flight
    loading: HashMap<K, PendingLoad<V>>,

    /// Sum of the sizes of resident entries
    current_size: u64,
}

struct Inner<K: Hash + Eq, V> {
    state: Mutex<State<K, V>>,
    max_size: u64,
    on_remove: Box<RemoveFn<K, V>>,
}

/// Size-bounded LRU cache, cheap to clone
pub struct LruCache<K: Hash + Eq, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K: Hash + Eq, V> Clone for LruCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `max_size` bytes (in caller-defined units)
    pub fn new<F>(max_size: u64, on_remove: F) -> Self
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    entries: lru::LruCache::unbounded(),
                    loading: HashMap::new(),
                    current_size: 0,
                }),
                max_size,
                on_remove: Box::new(on_remove),
            }),
        }
    }

    /// Return the cached value for `key`, loading it with `load` on a miss.
    ///
    /// `load` is called with the lock held and must only build the future;
    /// the future itself runs without the lock. It resolves to the value and
    /// its size.
    pub async fn get_or_load<F, Fut>(&self, key: K, load: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(V, u64)>> + Send + 'static,
    {
        let pending = {
            let mut state = self.inner.state.lock();
            if let Some(resident) = state.entries.get(&key) {
                return Ok(resident.value.clone());
            }

            match state.loading.entry(key.clone()) {
                Entry::Occupied(o) => o.get().clone(),
                Entry::Vacant(v) => {
                    let future =
                        Self::load_and_insert(Arc::clone(&self.inner), key, load()).boxed();
                    let shareable = future.shared();
                    v.insert(shareable.clone());
                    shareable
                }
            }
        };

        pending.await.map_err(Error::unshare)
    }

    async fn load_and_insert<Fut>(
        inner: Arc<Inner<K, V>>,
        key: K,
        load: Fut,
    ) -> std::result::Result<V, Arc<Error>>
    where
        Fut: Future<Output = Result<(V, u64)>>,
    {
        let loaded = load.await;

        let mut state = inner.state.lock();
        state.loading.remove(&key);

        let (value, size) = loaded.map_err(Arc::new)?;
        if size > inner.max_size {
            return Err(Arc::new(Error::CapacityExceeded {
                size,
                max_size: inner.max_size,
            }));
        }

        while state.current_size + size > inner.max_size {
            let Some((evicted_key, evicted)) = state.entries.pop_lru() else {
                break;
            };
            state.current_size -= evicted.size;
            (inner.on_remove)(&evicted_key, &evicted.value);
        }

        state.current_size += size;
        state.entries.push(
            key,
            Resident {
                value: value.clone(),
                size,
            },
        );

        Ok(value)
    }

    /// Drain every resident entry, running `close_value` on each.
    ///
    /// All errors are collected; one failing entry does not stop the others.
    pub fn close<F>(&self, mut close_value: F) -> Result<()>
    where
        F: FnMut(&K, &V) -> Result<()>,
    {
        let drained = {
            let mut state = self.inner.state.lock();
            state.current_size = 0;
            let mut drained = Vec::with_capacity(state.entries.len());
            while let Some((key, resident)) = state.entries.pop_lru() {
                drained.push((key, resident.value));
            }
            drained
        };

        let errors: Vec<Error> = drained
            .iter()
            .filter_map(|(key, value)| close_value(key, value).err())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(errors))
        }
    }

    /// Sum of the sizes of resident entries
    pub fn current_size(&self) -> u64 {
        self.inner.state.lock().current_size
    }

    pub fn max_size(&self) -> u64 {
        self.inner.max_size
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is resident, without touching its recency
    pub fn contains(&self, key: &K) -> bool {
        self.inner.state.lock().entries.contains(key)
    }

    /// Resident keys, most recently used first
    pub fn keys(&self) -> Vec<K> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn recording_cache(max_size: u64) -> (LruCache<String, u64>, Arc<Mutex<Vec<String>>>) {
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&removed);
        let cache = LruCache::new(max_size, move |key: &String, _value: &u64| {
            sink.lock().push(key.clone());
        });
        (cache, removed)
    }

    async fn put(cache: &LruCache<String, u64>, key: &str, size: u64) -> Result<u64> {
        cache
            .get_or_load(key.to_string(), move || async move { Ok((size, size)) })
            .await
    }

    #[tokio::test]
    async fn test_hit_does_not_reload() {
        let (cache, _) = recording_cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value = cache
                .get_or_load("a".to_string(), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok((7, 1))
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.current_size(), 1);
    }

    #[tokio::test]
    async fn test_eviction_follows_recency() {
        let (cache, removed) = recording_cache(3);
        put(&cache, "a", 1).await.unwrap();
        put(&cache, "b", 1).await.unwrap();
        put(&cache, "c", 1).await.unwrap();

        // Touch "a" so "b" becomes least recently used
        put(&cache, "a", 1).await.unwrap();
        assert_eq!(cache.keys(), vec!["a", "c", "b"]);

        put(&cache, "d", 1).await.unwrap();
        assert_eq!(*removed.lock(), vec!["b".to_string()]);
        assert_eq!(cache.keys(), vec!["d", "a", "c"]);

        // A large entry evicts as many LRU entries as it needs
        put(&cache, "e", 2).await.unwrap();
        assert_eq!(
            *removed.lock(),
            vec!["b".to_string(), "c".to_string(), "a".to_string()]
        );
        assert_eq!(cache.keys(), vec!["e", "d"]);
        assert_eq!(cache.current_size(), 3);
    }

    #[tokio::test]
    async fn test_size_invariant_holds() {
        let (cache, _) = recording_cache(10);
        let sizes = [3, 4, 1, 5, 2, 2, 6, 1, 9, 3];
        for (i, size) in sizes.iter().enumerate() {
            put(&cache, &format!("k{}", i), *size).await.unwrap();
            assert!(cache.current_size() <= cache.max_size());
        }

        let expected: u64 = cache
            .keys()
            .iter()
            .map(|k| sizes[k[1..].parse::<usize>().unwrap()])
            .sum();
        assert_eq!(cache.current_size(), expected);
    }

    #[tokio::test]
    async fn test_capacity_exceeded_inserts_nothing() {
        let (cache, removed) = recording_cache(5);
        put(&cache, "small", 2).await.unwrap();

        let err = put(&cache, "huge", 6).await.unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExceeded {
                size: 6,
                max_size: 5
            }
        ));
        assert!(removed.lock().is_empty());
        assert!(!cache.contains(&"huge".to_string()));
        assert_eq!(cache.current_size(), 2);

        // The key is not stuck in flight
        put(&cache, "huge", 3).await.unwrap();
        assert!(cache.contains(&"huge".to_string()));
    }

    #[tokio::test]
    async fn test_load_error_is_not_cached() {
        let (cache, _) = recording_cache(5);

        let err = cache
            .get_or_load("a".to_string(), || async {
                Err::<(u64, u64), _>(Error::Callback("boom".to_string()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(cache.is_empty());

        assert_eq!(put(&cache, "a", 1).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_run_once() {
        let (cache, _) = recording_cache(100);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("shared".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok((42, 1))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_waiters_share_error() {
        let (cache, _) = recording_cache(100);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load("bad".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<(u64, u64), _>(Error::Callback("unavailable".to_string()))
                    })
                    .await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.root().to_string(), "unavailable");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_load_is_resumed() {
        let (cache, _) = recording_cache(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let slow = {
            let calls = Arc::clone(&calls);
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok((5, 1))
            }
        };

        let first = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_load("k".to_string(), slow.clone()),
        )
        .await;
        assert!(first.is_err());

        let value = cache.get_or_load("k".to_string(), slow).await.unwrap();
        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_aggregates_errors() {
        let (cache, removed) = recording_cache(10);
        put(&cache, "a", 1).await.unwrap();
        put(&cache, "b", 2).await.unwrap();
        put(&cache, "c", 3).await.unwrap();

        let mut closed = Vec::new();
        let err = cache
            .close(|key, _| {
                closed.push(key.clone());
                if key == "a" {
                    Ok(())
                } else {
                    Err(Error::Callback(format!("close {}", key)))
                }
            })
            .unwrap_err();

        match err {
            Error::Aggregate(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected Aggregate, got {:?}", other),
        }
        closed.sort();
        assert_eq!(closed, vec!["a", "b", "c"]);
        assert!(cache.is_empty());
        assert_eq!(cache.current_size(), 0);
        // Close is not eviction
        assert!(removed.lock().is_empty());
    }
}
