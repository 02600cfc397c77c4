use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use super::{
    lru_cache::ListenableLruCache, storage::PersistentObserverStorage, Impression,
    ImpressionHasher,
};
use crate::{
    config::ObserverCacheConfig,
    sync::{SystemClock, TimestampProvider},
};

/// Fingerprint to last-seen time map: an in-memory LRU in front of durable storage.
///
/// Storage failures are logged and never returned. In the worst case deduplication falls back to
/// memory only.
pub struct ImpressionsObserverCache {
    cache: ListenableLruCache<u64, i64>,
    storage: Arc<dyn PersistentObserverStorage>,
}

impl ImpressionsObserverCache {
    /// Create a cache keeping up to `capacity` fingerprints in memory. Evicted fingerprints are
    /// deleted from `storage`.
    pub fn new(capacity: NonZeroUsize, storage: Arc<dyn PersistentObserverStorage>) -> Self {
        let cache = {
            let storage = Arc::clone(&storage);
            ListenableLruCache::with_listener(capacity, move |hash: u64| {
                if let Err(err) = storage.on_removal(hash) {
                    log::error!(target: "flagsync", "failed to delete evicted fingerprint {hash}: {err}");
                }
            })
        };
        ImpressionsObserverCache { cache, storage }
    }

    /// Last-seen time of `hash`. A value found only in storage is promoted back into memory.
    pub fn get(&self, hash: u64) -> Option<i64> {
        if let Some(time) = self.cache.get(&hash) {
            return Some(time);
        }

        match self.storage.get(hash) {
            Ok(Some(time)) => {
                self.cache.put(hash, time);
                Some(time)
            }
            Ok(None) => None,
            Err(err) => {
                log::error!(target: "flagsync", "failed to read fingerprint {hash}: {err}");
                None
            }
        }
    }

    /// Record `time` as the last-seen time of `hash`, in memory and in storage.
    pub fn put(&self, hash: u64, time: i64) {
        self.cache.put(hash, time);
        if let Err(err) = self.storage.insert(hash, time) {
            log::error!(target: "flagsync", "failed to store fingerprint {hash}: {err}");
        }
    }

    /// Number of fingerprints held in memory.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether no fingerprint is held in memory.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Number of fingerprints evicted from memory.
    pub fn eviction_count(&self) -> u64 {
        self.cache.eviction_count()
    }
}

const LOCK_STRIPES: usize = 16;

/// Remembers when each impression fingerprint was last seen.
pub struct ImpressionsObserver {
    cache: ImpressionsObserverCache,
    storage: Arc<dyn PersistentObserverStorage>,
    clock: Arc<dyn TimestampProvider>,
    /// Serializes read-and-replace per fingerprint without a global lock.
    locks: [Mutex<()>; LOCK_STRIPES],
}

impl ImpressionsObserver {
    /// Create an observer on top of `storage`. Expired persisted fingerprints are pruned right
    /// away.
    pub fn new(config: &ObserverCacheConfig, storage: Arc<dyn PersistentObserverStorage>) -> Self {
        ImpressionsObserver::with_clock(config, storage, Arc::new(SystemClock))
    }

    /// Same as [`ImpressionsObserver::new`] with a custom clock for pruning.
    pub fn with_clock(
        config: &ObserverCacheConfig,
        storage: Arc<dyn PersistentObserverStorage>,
        clock: Arc<dyn TimestampProvider>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        let observer = ImpressionsObserver {
            cache: ImpressionsObserverCache::new(capacity, Arc::clone(&storage)),
            storage,
            clock,
            locks: std::array::from_fn(|_| Mutex::new(())),
        };
        observer.prune(observer.clock.now_millis());
        observer
    }

    /// Record `impression` as seen at `impression.time` and return when it was previously seen.
    ///
    /// Returns `None` the first time a fingerprint is observed. Concurrent calls for the same
    /// fingerprint are serialized, so every previous time is handed out exactly once and the
    /// last call's time is what remains stored.
    pub fn test_and_set(&self, impression: &Impression) -> Option<i64> {
        let hash = ImpressionHasher::process(impression);

        // Guards (), so a poisoned lock carries no broken state.
        let _guard = self.locks[(hash % LOCK_STRIPES as u64) as usize]
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        let previous = self.cache.get(hash);
        self.cache.put(hash, impression.time);
        previous
    }

    /// Call when the application comes back to foreground. Prunes expired persisted
    /// fingerprints.
    pub fn resume(&self) {
        self.prune(self.clock.now_millis());
    }

    /// Prune persisted fingerprints expired at `now`.
    pub fn prune(&self, now: i64) {
        match self.storage.delete_outdated(now) {
            Ok(deleted) => {
                log::debug!(target: "flagsync", "pruned {deleted} persisted fingerprints");
            }
            Err(err) => {
                log::error!(target: "flagsync", "failed to prune persisted fingerprints: {err}");
            }
        }
    }

    /// In-memory side of the observer.
    pub fn cache(&self) -> &ImpressionsObserverCache {
        &self.cache
    }
}
