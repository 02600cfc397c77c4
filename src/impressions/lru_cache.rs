use std::{
    hash::Hash,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use ::lru::LruCache;

/// Notified with the key of every entry evicted from a [`ListenableLruCache`].
pub trait RemovalListener<K>: Send + Sync {
    /// Called with the key of an entry evicted to make room.
    fn on_removal(&self, key: K);
}

impl<K, T: Fn(K) + Send + Sync> RemovalListener<K> for T {
    fn on_removal(&self, key: K) {
        self(key)
    }
}

/// Thread-safe LRU cache calling a listener on eviction.
///
/// The listener runs after the cache lock is released, so it may block or call back into the
/// cache.
pub struct ListenableLruCache<K: Hash + Eq, V> {
    cache: Mutex<LruCache<K, V>>,
    listener: Option<Box<dyn RemovalListener<K>>>,
    evictions: AtomicU64,
}

impl<K: Hash + Eq, V: Clone> ListenableLruCache<K, V> {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: NonZeroUsize) -> ListenableLruCache<K, V> {
        ListenableLruCache {
            cache: Mutex::new(LruCache::new(capacity)),
            listener: None,
            evictions: AtomicU64::new(0),
        }
    }

    /// Same as [`ListenableLruCache::new`], calling `listener` with the key of every evicted entry.
    pub fn with_listener(
        capacity: NonZeroUsize,
        listener: impl RemovalListener<K> + 'static,
    ) -> ListenableLruCache<K, V> {
        ListenableLruCache {
            listener: Some(Box::new(listener)),
            ..ListenableLruCache::new(capacity)
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, LruCache<K, V>> {
        self.cache
            .lock()
            .expect("thread holding lru cache lock should not panic")
    }

    /// Value of `key`, marking it as most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.cache().get(key).cloned()
    }

    /// Insert or replace `key`, returning the value it replaced.
    ///
    /// Inserting a new key into a full cache evicts the least recently used entry.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let evicted = {
            let mut cache = self.cache();
            if let Some(current) = cache.get_mut(&key) {
                return Some(std::mem::replace(current, value));
            }
            // The key is new, so anything returned was evicted.
            cache.push(key, value)
        };

        if let Some((evicted, _)) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            if let Some(listener) = &self.listener {
                listener.on_removal(evicted);
            }
        }
        None
    }

    /// Remove `key` without notifying the listener.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.cache().pop(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.cache().len()
    }

    /// Whether the cache holds no entry.
    pub fn is_empty(&self) -> bool {
        self.cache().is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.cache().cap().get()
    }

    /// Number of entries evicted since creation.
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}
