//! A background poller thread that periodically runs a synchronization task.
use std::{sync::mpsc::RecvTimeoutError, time::Duration};

use rand::{thread_rng, Rng};

use crate::{Error, Result};

/// Configuration for [`PollerThread`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub(crate) struct PollerThreadConfig {
    /// Interval to wait between two runs of the task.
    pub interval: Duration,
    /// Randomized duration subtracted from `interval`. This helps to avoid multiple clients
    /// synchronizing and producing spiky network load.
    pub jitter: Duration,
    /// Wait before the first run. Zero runs the task as soon as the thread starts.
    pub initial_delay: Duration,
}

impl PollerThreadConfig {
    pub fn new(interval: Duration) -> PollerThreadConfig {
        PollerThreadConfig {
            interval,
            jitter: Duration::ZERO,
            initial_delay: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> PollerThreadConfig {
        self.initial_delay = delay;
        self
    }
}

/// A polling thread.
///
/// Runs `task` every `interval` until stopped. Retryable errors are logged and the task runs again
/// on the next tick. A non-retryable error ends the thread.
pub(crate) struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,
}

impl PollerThread {
    /// Starts a poller thread named `name`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread failed to start.
    pub fn start<F>(name: &str, config: PollerThreadConfig, mut task: F) -> std::io::Result<PollerThread>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        // Using `sync_channel` here as it makes `stop_sender` `Sync`. Buffer size of 1 is enough
        // as we only ever send a stop command, and `try_send()` failing on a full buffer means
        // another thread has already sent it.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let thread_name = name.to_owned();
        let join_handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let wait = |timeout: Duration| match stop_receiver.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => true,
                    Ok(()) => {
                        log::debug!(target: "flagsync", "{thread_name} received stop command");
                        false
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        log::debug!(target: "flagsync", "{thread_name} received disconnected");
                        false
                    }
                };

                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    if !config.initial_delay.is_zero() && !wait(config.initial_delay) {
                        return;
                    }

                    loop {
                        match task() {
                            Ok(()) => {}
                            Err(err) if err.is_retryable() => {
                                log::warn!(target: "flagsync", "{thread_name} failed, retrying on next tick: {err}");
                            }
                            Err(err) => {
                                log::error!(target: "flagsync", "{thread_name} stopped after unrecoverable error: {err}");
                                return;
                            }
                        }

                        if !wait(jitter(config.interval, config.jitter)) {
                            return;
                        }
                    }
                }));

                if result.is_err() {
                    log::error!(target: "flagsync", "{thread_name} panicked");
                }
            })?;

        Ok(PollerThread {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the thread already exited or that a stop command is already queued.
        // Either way the thread will stop.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::ThreadPanicked)?;
        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
