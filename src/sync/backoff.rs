use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    executor::{CancellationHandle, TaskExecutor},
    Result,
};

/// Exponential backoff: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone)]
pub struct BackoffCounter {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl BackoffCounter {
    /// Backoff starting at `base` and capped at `max`.
    pub fn new(base: Duration, max: Duration) -> BackoffCounter {
        BackoffCounter {
            base,
            max,
            attempts: 0,
        }
    }

    /// Delay before the next attempt. Each call counts as one attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start over from `base`.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Notified when a [`RetryTimer`] run finishes, either with success or with the error that made
/// it give up.
pub trait RetryListener: Send + Sync {
    /// Called once per run with the final result.
    fn on_complete(&self, result: Result<()>);
}

impl<T: Fn(Result<()>) + Send + Sync> RetryListener for T {
    fn on_complete(&self, result: Result<()>) {
        self(result)
    }
}

type RetryTask = dyn Fn() -> Result<()> + Send + Sync;

struct TimerState {
    /// Bumped on every start and stop so that attempts of a previous run do not reschedule.
    generation: u64,
    backoff: BackoffCounter,
    attempts: u32,
    pending: Option<CancellationHandle>,
}

struct TimerInner {
    executor: Arc<TaskExecutor>,
    task: Box<RetryTask>,
    listener: Option<Box<dyn RetryListener>>,
    max_attempts: Option<u32>,
    state: Mutex<TimerState>,
}

/// Runs one task until it succeeds, backing off between failed attempts.
///
/// Gives up when the task returns a non-retryable error or after `max_attempts` attempts.
#[derive(Clone)]
pub struct RetryTimer {
    inner: Arc<TimerInner>,
}

impl RetryTimer {
    /// Timer retrying `task` with `backoff` between attempts, at most `max_attempts` times.
    pub fn new<F>(
        executor: Arc<TaskExecutor>,
        backoff: BackoffCounter,
        max_attempts: Option<u32>,
        task: F,
    ) -> RetryTimer
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        RetryTimer::build(executor, backoff, max_attempts, Box::new(task), None)
    }

    /// Same as [`RetryTimer::new`] with a completion listener.
    pub fn with_listener<F>(
        executor: Arc<TaskExecutor>,
        backoff: BackoffCounter,
        max_attempts: Option<u32>,
        task: F,
        listener: impl RetryListener + 'static,
    ) -> RetryTimer
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        RetryTimer::build(
            executor,
            backoff,
            max_attempts,
            Box::new(task),
            Some(Box::new(listener)),
        )
    }

    fn build(
        executor: Arc<TaskExecutor>,
        backoff: BackoffCounter,
        max_attempts: Option<u32>,
        task: Box<RetryTask>,
        listener: Option<Box<dyn RetryListener>>,
    ) -> RetryTimer {
        RetryTimer {
            inner: Arc::new(TimerInner {
                executor,
                task,
                listener,
                max_attempts,
                state: Mutex::new(TimerState {
                    generation: 0,
                    backoff,
                    attempts: 0,
                    pending: None,
                }),
            }),
        }
    }

    /// Start a new run. The first attempt is executed immediately. A run in progress is
    /// superseded and its attempt counter reset.
    pub fn start(&self) {
        let generation = {
            let mut state = self.inner.state();
            state.generation += 1;
            state.attempts = 0;
            state.backoff.reset();
            if let Some(pending) = state.pending.take() {
                pending.cancel();
            }
            state.generation
        };
        TimerInner::schedule(&self.inner, generation, Duration::ZERO);
    }

    /// Cancel the pending attempt, if any. Does nothing if already stopped.
    pub fn stop(&self) {
        let mut state = self.inner.state();
        state.generation += 1;
        if let Some(pending) = state.pending.take() {
            pending.cancel();
        }
    }

    /// Attempts made in the current run.
    pub fn attempts(&self) -> u32 {
        self.inner.state().attempts
    }
}

impl TimerInner {
    fn state(&self) -> std::sync::MutexGuard<'_, TimerState> {
        self.state
            .lock()
            .expect("thread holding retry timer lock should not panic")
    }

    fn schedule(inner: &Arc<TimerInner>, generation: u64, delay: Duration) {
        let handle = {
            let task_inner = Arc::clone(inner);
            inner
                .executor
                .schedule(delay, move || TimerInner::attempt(&task_inner, generation))
        };

        let mut state = inner.state();
        if state.generation == generation {
            state.pending = Some(handle);
        } else {
            handle.cancel();
        }
    }

    fn attempt(inner: &Arc<TimerInner>, generation: u64) {
        if inner.state().generation != generation {
            return;
        }

        let result = (inner.task)();

        let delay = {
            let mut state = inner.state();
            if state.generation != generation {
                return;
            }
            state.attempts += 1;
            state.pending = None;

            match &result {
                Ok(()) => None,
                Err(err) if !err.is_retryable() => None,
                Err(_) if inner.max_attempts.is_some_and(|max| state.attempts >= max) => None,
                Err(_) => Some(state.backoff.next_delay()),
            }
        };

        match delay {
            Some(delay) => {
                log::debug!(target: "flagsync", "retrying in {delay:?}");
                TimerInner::schedule(inner, generation, delay);
            }
            None => {
                if let Err(err) = &result {
                    log::warn!(target: "flagsync", "giving up retrying task: {err}");
                }
                if let Some(listener) = &inner.listener {
                    listener.on_complete(result);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            mpsc, Arc,
        },
        time::Duration,
    };

    use super::*;
    use crate::Error;

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut backoff = BackoffCounter::new(Duration::from_secs(1), Duration::from_secs(10));

        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(backoff.attempts(), 6);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_does_not_overflow() {
        let mut backoff = BackoffCounter::new(Duration::from_secs(1), Duration::from_secs(1800));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(1800));
        }
    }

    fn fast_backoff() -> BackoffCounter {
        BackoffCounter::new(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn retries_until_success() {
        let executor = Arc::new(TaskExecutor::new().unwrap());
        let calls = Arc::new(AtomicU32::new(0));
        let (sender, receiver) = mpsc::sync_channel(1);

        let timer = {
            let calls = Arc::clone(&calls);
            RetryTimer::with_listener(
                executor.clone(),
                fast_backoff(),
                None,
                move || {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::retryable("503"))
                    } else {
                        Ok(())
                    }
                },
                move |result: Result<()>| {
                    let _ = sender.send(result.is_ok());
                },
            )
        };
        timer.start();

        assert!(receiver.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(timer.attempts(), 3);
        executor.shutdown();
    }

    #[test]
    fn non_retryable_error_stops_immediately() {
        let executor = Arc::new(TaskExecutor::new().unwrap());
        let calls = Arc::new(AtomicU32::new(0));
        let (sender, receiver) = mpsc::sync_channel(1);

        let timer = {
            let calls = Arc::clone(&calls);
            RetryTimer::with_listener(
                executor.clone(),
                fast_backoff(),
                None,
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::non_retryable("401"))
                },
                move |result: Result<()>| {
                    let _ = sender.send(result.is_ok());
                },
            )
        };
        timer.start();

        assert!(!receiver.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        executor.shutdown();
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let executor = Arc::new(TaskExecutor::new().unwrap());
        let calls = Arc::new(AtomicU32::new(0));
        let (sender, receiver) = mpsc::sync_channel(1);

        let timer = {
            let calls = Arc::clone(&calls);
            RetryTimer::with_listener(
                executor.clone(),
                fast_backoff(),
                Some(3),
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::retryable("timeout"))
                },
                move |result: Result<()>| {
                    let _ = sender.send(result.is_ok());
                },
            )
        };
        timer.start();

        assert!(!receiver.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        executor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_rescheduling() {
        let executor = Arc::new(TaskExecutor::with_handle(tokio::runtime::Handle::current()));
        let calls = Arc::new(AtomicU32::new(0));

        let timer = {
            let calls = Arc::clone(&calls);
            RetryTimer::new(
                executor.clone(),
                BackoffCounter::new(Duration::from_secs(60), Duration::from_secs(60)),
                None,
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::retryable("503"))
                },
            )
        };
        timer.start();
        while timer.attempts() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        timer.stop();
        timer.stop();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_for_backoff() {
        let executor = Arc::new(TaskExecutor::with_handle(tokio::runtime::Handle::current()));
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let start = tokio::time::Instant::now();

        let timer = RetryTimer::with_listener(
            executor,
            BackoffCounter::new(Duration::from_secs(10), Duration::from_secs(15)),
            Some(4),
            || Err(Error::retryable("timeout")),
            move |result: Result<()>| {
                let _ = sender.send(result.is_ok());
            },
        );
        timer.start();

        assert_eq!(receiver.recv().await, Some(false));
        // Attempt 0 runs right away, then 10s, 15s and 15s of backoff.
        assert!(start.elapsed() >= Duration::from_secs(40));
        assert_eq!(timer.attempts(), 4);
    }
}
