use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use tokio::{sync::mpsc, task::JoinHandle};

use super::backoff::{BackoffCounter, RetryTimer};
use crate::{executor::TaskExecutor, notification::FlagsChanged, Result};

/// Storage and network operations on flag definitions.
///
/// Methods are blocking and are never called from the stream reader thread.
pub trait FlagsSynchronizer: Send + Sync {
    /// Change number of locally stored flag definitions.
    fn change_number(&self) -> i64;

    /// Fetch flag changes from the server. With a target, keep fetching until the local change
    /// number reaches it.
    fn synchronize(&self, target_change_number: Option<i64>) -> Result<()>;

    /// Mark flag `name` as killed locally.
    fn kill_flag(&self, name: &str, default_treatment: &str, change_number: i64) -> Result<()>;

    /// Store a flag definition received inline with a notification.
    fn apply_flag_definition(&self, definition: serde_json::Value, change_number: i64)
        -> Result<()>;
}

/// Consumes flag change notifications.
///
/// A notification carrying the definition of a change that directly follows the local state is
/// applied as is. Anything else newer than the local state triggers a refetch, retried with
/// backoff.
pub struct FlagUpdatesWorker {
    join_handle: JoinHandle<()>,
    timer: RetryTimer,
}

impl FlagUpdatesWorker {
    /// Start consuming `receiver`. Refetches go through `flags` with retries.
    pub fn start(
        executor: Arc<TaskExecutor>,
        flags: Arc<dyn FlagsSynchronizer>,
        backoff: BackoffCounter,
        max_attempts: Option<u32>,
        mut receiver: mpsc::UnboundedReceiver<FlagsChanged>,
    ) -> FlagUpdatesWorker {
        let target = Arc::new(AtomicI64::new(i64::MIN));

        let timer = {
            let flags = Arc::clone(&flags);
            let target = Arc::clone(&target);
            RetryTimer::new(executor.clone(), backoff, max_attempts, move || {
                let target = target.load(Ordering::Acquire);
                flags.synchronize((target != i64::MIN).then_some(target))
            })
        };

        let join_handle = {
            let timer = timer.clone();
            executor.handle().spawn(async move {
                while let Some(change) = receiver.recv().await {
                    let flags = Arc::clone(&flags);
                    let outcome =
                        tokio::task::spawn_blocking(move || try_instant_update(flags.as_ref(), &change)).await;

                    match outcome {
                        Ok(Update::Applied) => {}
                        Ok(Update::UpToDate) => {
                            log::debug!(target: "flagsync", "flags already up to date");
                        }
                        Ok(Update::Fetch(change_number)) => {
                            target.fetch_max(change_number, Ordering::AcqRel);
                            timer.start();
                        }
                        Err(err) => {
                            log::error!(target: "flagsync", "flag update panicked: {err}");
                        }
                    }
                }
                log::debug!(target: "flagsync", "flag updates worker stopped");
            })
        };

        FlagUpdatesWorker { join_handle, timer }
    }

    /// Stop processing notifications and cancel pending refetches.
    pub fn stop(&self) {
        self.join_handle.abort();
        self.timer.stop();
    }
}

enum Update {
    Applied,
    UpToDate,
    Fetch(i64),
}

fn try_instant_update(flags: &dyn FlagsSynchronizer, change: &FlagsChanged) -> Update {
    let local = flags.change_number();
    if change.change_number <= local {
        return Update::UpToDate;
    }

    if change.previous_change_number == Some(local) {
        match change.decode_definition() {
            Ok(Some(definition)) => match flags.apply_flag_definition(definition, change.change_number) {
                Ok(()) => {
                    log::debug!(target: "flagsync", "applied inline flag update {}", change.change_number);
                    return Update::Applied;
                }
                Err(err) => {
                    log::warn!(target: "flagsync", "failed to apply inline flag update: {err}");
                }
            },
            Ok(None) => {}
            Err(err) => {
                log::warn!(target: "flagsync", "failed to decode inline flag update: {err}");
            }
        }
    }

    Update::Fetch(change.change_number)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::{
            atomic::{AtomicI64, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use tokio::sync::mpsc;

    use super::*;
    use crate::{codec::Compression, Error};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum FlagCall {
        Synchronize(Option<i64>),
        Kill(String, String, i64),
        Apply(serde_json::Value, i64),
    }

    pub(crate) struct RecordingFlags {
        change_number: AtomicI64,
        failures: Mutex<Vec<Error>>,
        pub calls: Mutex<Vec<FlagCall>>,
        sender: mpsc::UnboundedSender<FlagCall>,
        receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<FlagCall>>,
    }

    impl RecordingFlags {
        pub(crate) fn new(change_number: i64) -> RecordingFlags {
            let (sender, receiver) = mpsc::unbounded_channel();
            RecordingFlags {
                change_number: AtomicI64::new(change_number),
                failures: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                sender,
                receiver: tokio::sync::Mutex::new(receiver),
            }
        }

        /// Make the next `synchronize` calls fail with `errors`, in order.
        pub(crate) fn fail_with(&self, errors: Vec<Error>) {
            *self.failures.lock().unwrap() = errors;
        }

        pub(crate) async fn next_call(&self) -> FlagCall {
            let mut receiver = self.receiver.lock().await;
            tokio::time::timeout(Duration::from_secs(5), receiver.recv())
                .await
                .expect("timed out waiting for flags call")
                .expect("sender dropped")
        }

        fn record(&self, call: FlagCall) {
            self.calls.lock().unwrap().push(call.clone());
            let _ = self.sender.send(call);
        }
    }

    impl FlagsSynchronizer for RecordingFlags {
        fn change_number(&self) -> i64 {
            self.change_number.load(Ordering::SeqCst)
        }

        fn synchronize(&self, target_change_number: Option<i64>) -> Result<()> {
            self.record(FlagCall::Synchronize(target_change_number));
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
            if let Some(target) = target_change_number {
                self.change_number.fetch_max(target, Ordering::SeqCst);
            }
            Ok(())
        }

        fn kill_flag(&self, name: &str, default_treatment: &str, change_number: i64) -> Result<()> {
            self.record(FlagCall::Kill(
                name.to_owned(),
                default_treatment.to_owned(),
                change_number,
            ));
            Ok(())
        }

        fn apply_flag_definition(
            &self,
            definition: serde_json::Value,
            change_number: i64,
        ) -> Result<()> {
            self.record(FlagCall::Apply(definition, change_number));
            self.change_number.store(change_number, Ordering::SeqCst);
            Ok(())
        }
    }

    fn start(flags: Arc<RecordingFlags>) -> (FlagUpdatesWorker, mpsc::UnboundedSender<FlagsChanged>, Arc<TaskExecutor>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let executor = Arc::new(TaskExecutor::with_handle(tokio::runtime::Handle::current()));
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = FlagUpdatesWorker::start(
            executor.clone(),
            flags,
            BackoffCounter::new(Duration::from_millis(1), Duration::from_millis(5)),
            Some(5),
            receiver,
        );
        (worker, sender, executor)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn newer_change_triggers_fetch() {
        let flags = Arc::new(RecordingFlags::new(100));
        let (worker, sender, _executor) = start(flags.clone());

        sender.send(FlagsChanged::new(200)).unwrap();

        assert_eq!(flags.next_call().await, FlagCall::Synchronize(Some(200)));
        worker.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn old_change_is_ignored() {
        let flags = Arc::new(RecordingFlags::new(100));
        let (worker, sender, _executor) = start(flags.clone());

        sender.send(FlagsChanged::new(100)).unwrap();
        sender.send(FlagsChanged::new(50)).unwrap();
        sender.send(FlagsChanged::new(101)).unwrap();

        // Only the last notification is newer than local state.
        assert_eq!(flags.next_call().await, FlagCall::Synchronize(Some(101)));
        assert_eq!(flags.calls.lock().unwrap().len(), 1);
        worker.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_fetch_is_retried() {
        let flags = Arc::new(RecordingFlags::new(1));
        flags.fail_with(vec![Error::retryable("503"), Error::retryable("503")]);
        let (worker, sender, _executor) = start(flags.clone());

        sender.send(FlagsChanged::new(2)).unwrap();

        for _ in 0..3 {
            assert_eq!(flags.next_call().await, FlagCall::Synchronize(Some(2)));
        }
        worker.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inline_definition_is_applied_without_fetch() {
        let flags = Arc::new(RecordingFlags::new(1000));
        let (worker, sender, _executor) = start(flags.clone());
        let definition = serde_json::json!({"name": "flag", "status": "ACTIVE"});

        sender
            .send(FlagsChanged {
                change_number: 1001,
                previous_change_number: Some(1000),
                compression: Some(2),
                definition: Some(crate::codec::tests::encode(
                    definition.to_string().as_bytes(),
                    Compression::Zlib,
                )),
            })
            .unwrap();

        assert_eq!(flags.next_call().await, FlagCall::Apply(definition, 1001));
        worker.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inline_definition_with_gap_fetches() {
        let flags = Arc::new(RecordingFlags::new(1000));
        let (worker, sender, _executor) = start(flags.clone());

        sender
            .send(FlagsChanged {
                change_number: 1002,
                previous_change_number: Some(1001),
                compression: Some(0),
                definition: Some(crate::codec::tests::encode(b"{}", Compression::None)),
            })
            .unwrap();

        assert_eq!(flags.next_call().await, FlagCall::Synchronize(Some(1002)));
        worker.stop();
    }
}
