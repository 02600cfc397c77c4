//! Configuration for the synchronization engine and the impressions observer cache.
use std::time::Duration;

/// Configuration for [`SyncManager`](crate::sync::SyncManager).
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// When `false`, only a single initial synchronization is performed: no polling and no
    /// streaming.
    ///
    /// Defaults to `true`.
    pub sync_enabled: bool,
    /// Whether the push stream should be used. When `false`, the engine only polls.
    ///
    /// Defaults to `true`.
    pub streaming_enabled: bool,
    /// Interval between flag polls while polling is active.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_FEATURES_REFRESH_RATE`].
    pub features_refresh_rate: Duration,
    /// Interval between membership polls while polling is active.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_SEGMENTS_REFRESH_RATE`].
    pub segments_refresh_rate: Duration,
    /// Randomized duration subtracted from every poll interval. This helps to avoid multiple
    /// clients synchronizing and producing spiky network load.
    ///
    /// Defaults to [`SyncConfig::DEFAULT_POLL_JITTER`].
    pub poll_jitter: Duration,
    /// First delay used by exponential backoff.
    pub backoff_base: Duration,
    /// Upper bound for exponential backoff.
    pub backoff_max: Duration,
    /// Number of streaming reconnection attempts before falling back to polling-only mode.
    pub max_stream_retry_attempts: u32,
    /// Reconnection cadence used once `max_stream_retry_attempts` is exceeded.
    pub slow_stream_retry_interval: Duration,
    /// Minimum time between two full synchronizations triggered by resume events.
    ///
    /// Values lower than [`SyncConfig::MIN_MAX_SYNC_PERIOD`] are raised to it.
    pub max_sync_period: Duration,
    /// Update interval used for membership refetch jitter when a notification does not carry one.
    pub default_update_interval: Duration,
    /// Maximum number of attempts for a flag refetch triggered by a notification. `None` retries
    /// until success.
    pub flag_sync_max_attempts: Option<u32>,
}

impl SyncConfig {
    /// Default value for [`SyncConfig::features_refresh_rate`].
    pub const DEFAULT_FEATURES_REFRESH_RATE: Duration = Duration::from_secs(3600);
    /// Default value for [`SyncConfig::segments_refresh_rate`].
    pub const DEFAULT_SEGMENTS_REFRESH_RATE: Duration = Duration::from_secs(1800);
    /// Default value for [`SyncConfig::poll_jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);
    /// Default value for [`SyncConfig::backoff_base`].
    pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
    /// Default value for [`SyncConfig::backoff_max`].
    pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(1800);
    /// Default value for [`SyncConfig::max_stream_retry_attempts`].
    pub const DEFAULT_MAX_STREAM_RETRY_ATTEMPTS: u32 = 10;
    /// Default value for [`SyncConfig::slow_stream_retry_interval`].
    pub const DEFAULT_SLOW_STREAM_RETRY_INTERVAL: Duration = Duration::from_secs(300);
    /// Platform floor for [`SyncConfig::max_sync_period`].
    pub const MIN_MAX_SYNC_PERIOD: Duration = Duration::from_secs(30);
    /// Default value for [`SyncConfig::default_update_interval`].
    pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`SyncConfig::flag_sync_max_attempts`].
    pub const DEFAULT_FLAG_SYNC_MAX_ATTEMPTS: u32 = 10;

    /// Create a new `SyncConfig` using default configuration.
    pub fn new() -> SyncConfig {
        SyncConfig::default()
    }

    /// Enable or disable all background synchronization.
    pub fn with_sync_enabled(mut self, enabled: bool) -> SyncConfig {
        self.sync_enabled = enabled;
        self
    }

    /// Enable or disable the push stream.
    pub fn with_streaming_enabled(mut self, enabled: bool) -> SyncConfig {
        self.streaming_enabled = enabled;
        self
    }

    /// Update flag poll interval with `rate`.
    pub fn with_features_refresh_rate(mut self, rate: Duration) -> SyncConfig {
        self.features_refresh_rate = rate;
        self
    }

    /// Update membership poll interval with `rate`.
    pub fn with_segments_refresh_rate(mut self, rate: Duration) -> SyncConfig {
        self.segments_refresh_rate = rate;
        self
    }

    /// Update poll jitter with `jitter`.
    pub fn with_poll_jitter(mut self, jitter: Duration) -> SyncConfig {
        self.poll_jitter = jitter;
        self
    }

    /// Update exponential backoff bounds.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> SyncConfig {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Update how many times the stream is retried before falling back to polling-only mode.
    pub fn with_max_stream_retry_attempts(mut self, attempts: u32) -> SyncConfig {
        self.max_stream_retry_attempts = attempts;
        self
    }

    /// Update the reconnection cadence used after retries are exhausted.
    pub fn with_slow_stream_retry_interval(mut self, interval: Duration) -> SyncConfig {
        self.slow_stream_retry_interval = interval;
        self
    }

    /// Update the minimum period between resume-triggered synchronizations. The value is
    /// clamped to [`SyncConfig::MIN_MAX_SYNC_PERIOD`].
    pub fn with_max_sync_period(mut self, period: Duration) -> SyncConfig {
        self.max_sync_period = period.max(SyncConfig::MIN_MAX_SYNC_PERIOD);
        self
    }

    /// Update the fallback update interval used by refetch jitter.
    pub fn with_default_update_interval(mut self, interval: Duration) -> SyncConfig {
        self.default_update_interval = interval;
        self
    }

    /// Update the number of attempts for notification-triggered flag refetches.
    pub fn with_flag_sync_max_attempts(mut self, attempts: Option<u32>) -> SyncConfig {
        self.flag_sync_max_attempts = attempts;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            sync_enabled: true,
            streaming_enabled: true,
            features_refresh_rate: SyncConfig::DEFAULT_FEATURES_REFRESH_RATE,
            segments_refresh_rate: SyncConfig::DEFAULT_SEGMENTS_REFRESH_RATE,
            poll_jitter: SyncConfig::DEFAULT_POLL_JITTER,
            backoff_base: SyncConfig::DEFAULT_BACKOFF_BASE,
            backoff_max: SyncConfig::DEFAULT_BACKOFF_MAX,
            max_stream_retry_attempts: SyncConfig::DEFAULT_MAX_STREAM_RETRY_ATTEMPTS,
            slow_stream_retry_interval: SyncConfig::DEFAULT_SLOW_STREAM_RETRY_INTERVAL,
            max_sync_period: SyncConfig::MIN_MAX_SYNC_PERIOD,
            default_update_interval: SyncConfig::DEFAULT_UPDATE_INTERVAL,
            flag_sync_max_attempts: Some(SyncConfig::DEFAULT_FLAG_SYNC_MAX_ATTEMPTS),
        }
    }
}

/// Configuration for the impressions observer cache.
#[derive(Debug, Clone)]
pub struct ObserverCacheConfig {
    /// Maximum number of fingerprints kept in memory.
    pub capacity: usize,
    /// Persisted fingerprints older than this are pruned.
    pub expiration_period: Duration,
    /// Upper bound of rows kept in durable storage after pruning.
    pub max_persisted_rows: usize,
    /// Number of rows deleted per pruning statement.
    pub prune_batch_size: usize,
    /// Delay before buffered writes are flushed to durable storage.
    pub persistence_delay: Duration,
}

impl ObserverCacheConfig {
    /// Default value for [`ObserverCacheConfig::capacity`].
    pub const DEFAULT_CAPACITY: usize = 500;
    /// Default value for [`ObserverCacheConfig::expiration_period`].
    pub const DEFAULT_EXPIRATION_PERIOD: Duration = Duration::from_secs(4 * 3600);
    /// Default value for [`ObserverCacheConfig::max_persisted_rows`].
    pub const DEFAULT_MAX_PERSISTED_ROWS: usize = 2000;
    /// Default value for [`ObserverCacheConfig::prune_batch_size`].
    pub const DEFAULT_PRUNE_BATCH_SIZE: usize = 100;
    /// Default value for [`ObserverCacheConfig::persistence_delay`].
    pub const DEFAULT_PERSISTENCE_DELAY: Duration = Duration::from_secs(1);

    /// Create a new `ObserverCacheConfig` using default configuration.
    pub fn new() -> ObserverCacheConfig {
        ObserverCacheConfig::default()
    }

    /// Update in-memory capacity.
    pub fn with_capacity(mut self, capacity: usize) -> ObserverCacheConfig {
        self.capacity = capacity;
        self
    }

    /// Update persisted row time-to-live.
    pub fn with_expiration_period(mut self, period: Duration) -> ObserverCacheConfig {
        self.expiration_period = period;
        self
    }

    /// Update the persisted row ceiling.
    pub fn with_max_persisted_rows(mut self, rows: usize) -> ObserverCacheConfig {
        self.max_persisted_rows = rows;
        self
    }

    /// Update pruning batch size.
    pub fn with_prune_batch_size(mut self, batch_size: usize) -> ObserverCacheConfig {
        self.prune_batch_size = batch_size.max(1);
        self
    }

    /// Update write-behind delay.
    pub fn with_persistence_delay(mut self, delay: Duration) -> ObserverCacheConfig {
        self.persistence_delay = delay;
        self
    }
}

impl Default for ObserverCacheConfig {
    fn default() -> ObserverCacheConfig {
        ObserverCacheConfig {
            capacity: ObserverCacheConfig::DEFAULT_CAPACITY,
            expiration_period: ObserverCacheConfig::DEFAULT_EXPIRATION_PERIOD,
            max_persisted_rows: ObserverCacheConfig::DEFAULT_MAX_PERSISTED_ROWS,
            prune_batch_size: ObserverCacheConfig::DEFAULT_PRUNE_BATCH_SIZE,
            persistence_delay: ObserverCacheConfig::DEFAULT_PERSISTENCE_DELAY,
        }
    }
}
