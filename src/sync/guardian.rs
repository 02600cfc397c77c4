use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Source of the current time in milliseconds since epoch.
pub trait TimestampProvider: Send + Sync {
    /// Current time in milliseconds since epoch.
    fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimestampProvider for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

impl<T: Fn() -> i64 + Send + Sync> TimestampProvider for T {
    fn now_millis(&self) -> i64 {
        self()
    }
}

struct GuardianState {
    initialized: bool,
    last_sync: i64,
    max_sync_period: Duration,
}

/// Suppresses redundant full synchronizations.
///
/// When the application comes back to foreground a full synchronization is normally triggered.
/// While streaming is healthy that is only needed if nothing was synchronized for a while.
pub struct SyncGuardian {
    min_max_sync_period: Duration,
    sync_enabled: bool,
    streaming_enabled: bool,
    clock: Arc<dyn TimestampProvider>,
    state: Mutex<GuardianState>,
}

impl SyncGuardian {
    /// Create a guardian enforcing `max_sync_period`. [`SyncGuardian::set_max_sync_period`]
    /// accepts any value not lower than `min_max_sync_period`.
    pub fn new(
        min_max_sync_period: Duration,
        max_sync_period: Duration,
        sync_enabled: bool,
        streaming_enabled: bool,
        clock: Arc<dyn TimestampProvider>,
    ) -> SyncGuardian {
        SyncGuardian {
            min_max_sync_period,
            sync_enabled,
            streaming_enabled,
            clock,
            state: Mutex::new(GuardianState {
                initialized: false,
                last_sync: 0,
                max_sync_period: max_sync_period.max(min_max_sync_period),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GuardianState> {
        self.state
            .lock()
            .expect("thread holding guardian lock should not panic")
    }

    /// Record that a synchronization just happened.
    pub fn update_last_sync_timestamp(&self) {
        let now = self.clock.now_millis();
        self.state().last_sync = now;
    }

    /// Whether a full synchronization is due.
    pub fn must_sync(&self) -> bool {
        if !self.sync_enabled || !self.streaming_enabled {
            return false;
        }

        let state = self.state();
        if !state.initialized {
            return false;
        }
        let elapsed = self.clock.now_millis().saturating_sub(state.last_sync);
        elapsed >= state.max_sync_period.as_millis() as i64
    }

    /// Update max sync period. Values lower than the floor are ignored.
    pub fn set_max_sync_period(&self, period: Duration) {
        if period < self.min_max_sync_period {
            log::debug!(target: "flagsync", "ignoring max sync period {period:?} lower than floor");
            return;
        }
        self.state().max_sync_period = period;
    }

    /// Max sync period currently enforced.
    pub fn max_sync_period(&self) -> Duration {
        self.state().max_sync_period
    }

    /// Enable [`SyncGuardian::must_sync`]. Called once streaming is established.
    pub fn initialize(&self) {
        self.state().initialized = true;
    }
}
