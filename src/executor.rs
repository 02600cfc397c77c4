//! Scheduled task execution.
//!
//! [`TaskExecutor`] runs delayed and periodic tasks on a tokio runtime. Every scheduled task
//! returns a [`CancellationHandle`], and [`TaskExecutor::shutdown`] cancels all of them at once.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    runtime::{Handle, Runtime},
    sync::watch,
    task::AbortHandle,
};

use crate::Result;

/// Cancels a scheduled task.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
    abort_handle: AbortHandle,
}

impl CancellationHandle {
    /// Cancel the task. A task that has not started yet never runs. Calling this more than once
    /// has no further effect.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.abort_handle.abort();
        }
    }

    /// Whether [`CancellationHandle::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether the task has run to completion or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.abort_handle.is_finished()
    }
}

/// Runs delayed, periodic and background tasks.
pub struct TaskExecutor {
    handle: Handle,
    /// Runtime created by [`TaskExecutor::new`]. `None` when running on a borrowed runtime.
    runtime: Mutex<Option<Runtime>>,
    shutdown: watch::Sender<bool>,
}

impl TaskExecutor {
    /// Create an executor backed by its own multi-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`](crate::Error::Io) if the runtime could not be started.
    pub fn new() -> Result<TaskExecutor> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("flagsync-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(TaskExecutor {
            handle,
            runtime: Mutex::new(Some(runtime)),
            shutdown: watch::channel(false).0,
        })
    }

    /// Create an executor that spawns onto an existing runtime.
    pub fn with_handle(handle: Handle) -> TaskExecutor {
        TaskExecutor {
            handle,
            runtime: Mutex::new(None),
            shutdown: watch::channel(false).0,
        }
    }

    /// Runtime tasks are spawned on.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Whether [`TaskExecutor::shutdown`] was called.
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run blocking `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> CancellationHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut shutdown = self.shutdown.subscribe();

        let join_handle = {
            let cancelled = Arc::clone(&cancelled);
            self.handle.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stopped(&mut shutdown) => return,
                }
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                if let Err(err) = tokio::task::spawn_blocking(task).await {
                    log::error!(target: "flagsync", "scheduled task panicked: {err}");
                }
            })
        };

        CancellationHandle {
            cancelled,
            abort_handle: join_handle.abort_handle(),
        }
    }

    /// Run blocking `task` after `initial_delay` and then repeatedly, waiting `next_delay()` after
    /// each run.
    pub fn schedule_periodic<F, D>(
        &self,
        initial_delay: Duration,
        next_delay: D,
        task: F,
    ) -> CancellationHandle
    where
        F: Fn() + Send + Sync + 'static,
        D: Fn() -> Duration + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut shutdown = self.shutdown.subscribe();
        let task = Arc::new(task);

        let join_handle = {
            let cancelled = Arc::clone(&cancelled);
            self.handle.spawn(async move {
                let mut delay = initial_delay;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stopped(&mut shutdown) => return,
                    }
                    if cancelled.load(Ordering::Acquire) {
                        return;
                    }
                    let task = Arc::clone(&task);
                    if let Err(err) = tokio::task::spawn_blocking(move || task()).await {
                        log::error!(target: "flagsync", "periodic task panicked: {err}");
                    }
                    delay = next_delay();
                }
            })
        };

        CancellationHandle {
            cancelled,
            abort_handle: join_handle.abort_handle(),
        }
    }

    /// Cancel every outstanding task. Tasks scheduled afterwards never run.
    ///
    /// The owned runtime, if any, is shut down in background: running blocking tasks are not
    /// waited for.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let runtime = self
            .runtime
            .lock()
            .expect("thread holding runtime lock should not panic")
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        log::debug!(target: "flagsync", "task executor shut down");
    }
}

/// Resolves once `receiver` observes `true` or the sender is gone.
async fn stopped(receiver: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *receiver.borrow_and_update();
        if stopped || receiver.changed().await.is_err() {
            return;
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if let Ok(mut runtime) = self.runtime.lock() {
            if let Some(runtime) = runtime.take() {
                runtime.shutdown_background();
            }
        }
    }
}
