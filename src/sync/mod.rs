//! Push/poll orchestration.
//!
//! [`SyncManager`] keeps flags and memberships fresh. It prefers the push stream and falls back to
//! polling whenever the stream is unavailable, paused, or has no publishers.
use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    config::SyncConfig,
    executor::{CancellationHandle, TaskExecutor},
    membership::{MembershipAction, MembershipRegistry, MembershipSynchronizer, SyncWorkItem},
    notification::{FlagsChanged, NotificationDispatcher},
};

mod backoff;
pub(crate) mod flags;
mod guardian;
mod poller;
mod push_status;
mod stream;

pub use backoff::{BackoffCounter, RetryListener, RetryTimer};
pub use flags::{FlagUpdatesWorker, FlagsSynchronizer};
pub use guardian::{SyncGuardian, SystemClock, TimestampProvider};
pub use push_status::{PushStatus, PushStatusKeeper};
pub use stream::{HandshakeError, StreamReader, StreamTransport};

use poller::{PollerThread, PollerThreadConfig};

/// Why the engine is polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingReason {
    /// Streaming is turned off in [`SyncConfig`] or no transport was provided.
    Configured,
    /// The stream is open but not delivering, or is being reconnected.
    StreamingDown,
    /// The server disabled streaming for this session.
    StreamingDisabled,
    /// The stream handshake was rejected with a non-retryable error.
    HandshakeRejected,
    /// Reconnection attempts were exhausted. The stream is still retried at a slow cadence.
    RetriesExhausted,
}

/// Current synchronization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Not started, paused or stopped.
    Disconnected,
    /// Stream handshake in progress.
    Connecting,
    /// Updates arrive through the stream. Polling is off.
    Streaming,
    /// Polling while waiting to reconnect the stream.
    Backoff {
        /// Reconnection attempt being waited for, starting at 1.
        attempt: u32,
    },
    /// Polling only.
    Polling {
        /// Why streaming is not used.
        reason: PollingReason,
    },
}

struct ManagerState {
    started: bool,
    paused: bool,
    stopped: bool,
    /// Set once streaming can no longer be used for the rest of the session.
    streaming_disabled: bool,
    reader: Option<StreamReader>,
    flag_poller: Option<PollerThread>,
    membership_poller: Option<PollerThread>,
    reconnect: Option<CancellationHandle>,
    backoff: BackoffCounter,
    flag_worker: Option<FlagUpdatesWorker>,
    feedback: Option<JoinHandle<()>>,
    statuses: Option<mpsc::UnboundedReceiver<PushStatus>>,
    flag_updates: Option<mpsc::UnboundedReceiver<FlagsChanged>>,
}

struct Inner {
    config: SyncConfig,
    executor: Arc<TaskExecutor>,
    flags: Arc<dyn FlagsSynchronizer>,
    transport: Option<Arc<dyn StreamTransport>>,
    registry: Arc<MembershipRegistry>,
    guardian: SyncGuardian,
    keeper: Arc<PushStatusKeeper>,
    dispatcher: Arc<NotificationDispatcher>,
    mode: watch::Sender<SyncMode>,
    state: Mutex<ManagerState>,
}

/// Decides whether streaming, polling or both are active, and moves between them.
///
/// ```text
/// Disconnected -> Connecting -> Streaming <-> Backoff <-> Polling
/// ```
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    /// Create a manager. Nothing runs until [`SyncManager::start`] is called.
    ///
    /// Without a `transport`, the manager only polls.
    pub fn new(
        config: SyncConfig,
        executor: Arc<TaskExecutor>,
        flags: Arc<dyn FlagsSynchronizer>,
        transport: Option<Arc<dyn StreamTransport>>,
        registry: Arc<MembershipRegistry>,
    ) -> SyncManager {
        SyncManager::with_clock(
            config,
            executor,
            flags,
            transport,
            registry,
            Arc::new(SystemClock),
        )
    }

    /// Same as [`SyncManager::new`] with a custom clock for the sync guardian.
    pub fn with_clock(
        config: SyncConfig,
        executor: Arc<TaskExecutor>,
        flags: Arc<dyn FlagsSynchronizer>,
        transport: Option<Arc<dyn StreamTransport>>,
        registry: Arc<MembershipRegistry>,
        clock: Arc<dyn TimestampProvider>,
    ) -> SyncManager {
        let (status_sender, statuses) = mpsc::unbounded_channel();
        let (flag_sender, flag_updates) = mpsc::unbounded_channel();
        let keeper = Arc::new(PushStatusKeeper::new(status_sender));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            executor.handle().clone(),
            Arc::clone(&flags),
            flag_sender,
            Arc::clone(&registry),
            Arc::clone(&keeper),
        ));
        let guardian = SyncGuardian::new(
            SyncConfig::MIN_MAX_SYNC_PERIOD,
            config.max_sync_period,
            config.sync_enabled,
            config.streaming_enabled,
            clock,
        );

        SyncManager {
            inner: Arc::new(Inner {
                state: Mutex::new(ManagerState {
                    started: false,
                    paused: false,
                    stopped: false,
                    streaming_disabled: false,
                    reader: None,
                    flag_poller: None,
                    membership_poller: None,
                    reconnect: None,
                    backoff: BackoffCounter::new(config.backoff_base, config.backoff_max),
                    flag_worker: None,
                    feedback: None,
                    statuses: Some(statuses),
                    flag_updates: Some(flag_updates),
                }),
                config,
                executor,
                flags,
                transport,
                registry,
                guardian,
                keeper,
                dispatcher,
                mode: watch::channel(SyncMode::Disconnected).0,
            }),
        }
    }

    /// Run the initial synchronization and start streaming or polling.
    ///
    /// Calling `start` more than once, or after [`SyncManager::stop`], has no effect.
    pub fn start(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state();
            if state.started || state.stopped {
                return;
            }
            state.started = true;
        }
        log::info!(target: "flagsync", "starting synchronization");

        inner.full_sync();
        if !inner.config.sync_enabled {
            log::info!(target: "flagsync", "background synchronization is disabled");
            return;
        }

        {
            let mut state = inner.state();
            if let Some(receiver) = state.flag_updates.take() {
                state.flag_worker = Some(FlagUpdatesWorker::start(
                    Arc::clone(&inner.executor),
                    Arc::clone(&inner.flags),
                    BackoffCounter::new(inner.config.backoff_base, inner.config.backoff_max),
                    inner.config.flag_sync_max_attempts,
                    receiver,
                ));
            }
            if let Some(mut statuses) = state.statuses.take() {
                let weak = Arc::downgrade(inner);
                state.feedback = Some(inner.executor.handle().spawn(async move {
                    while let Some(status) = statuses.recv().await {
                        match weak.upgrade() {
                            Some(inner) => inner.handle_status(status),
                            None => return,
                        }
                    }
                }));
            }
        }

        inner.start_sync_mode();
    }

    /// Stop streaming and polling, e.g. when the application goes to background.
    pub fn pause(&self) {
        let inner = &self.inner;
        let mut state = inner.state();
        if !state.started || state.stopped || state.paused {
            return;
        }
        state.paused = true;
        log::info!(target: "flagsync", "pausing synchronization");
        inner.cancel_reconnect(&mut state);
        inner.close_stream(&mut state);
        inner.stop_polling(&mut state);
        inner.set_mode(SyncMode::Disconnected);
    }

    /// Undo [`SyncManager::pause`]. A full synchronization is run only if the sync guardian
    /// says one is due.
    pub fn resume(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state();
            if !state.paused || state.stopped {
                return;
            }
            state.paused = false;
        }
        log::info!(target: "flagsync", "resuming synchronization");

        if inner.guardian.must_sync() {
            inner.full_sync();
        }
        if inner.config.sync_enabled {
            inner.start_sync_mode();
        }
    }

    /// Cancel every timer, close the stream, stop pollers and drain membership workers.
    ///
    /// Membership mutations already queued are applied before this returns. Queued refetches are
    /// dropped.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let (reader, pollers) = {
            let mut state = inner.state();
            if state.stopped {
                return;
            }
            state.stopped = true;
            inner.cancel_reconnect(&mut state);
            if let Some(worker) = state.flag_worker.take() {
                worker.stop();
            }
            if let Some(feedback) = state.feedback.take() {
                feedback.abort();
            }
            let reader = state.reader.take();
            if let Some(reader) = &reader {
                reader.stop();
            }
            let pollers: Vec<_> = [state.flag_poller.take(), state.membership_poller.take()]
                .into_iter()
                .flatten()
                .collect();
            (reader, pollers)
        };
        inner.set_mode(SyncMode::Disconnected);
        log::info!(target: "flagsync", "stopping synchronization");

        let joined = tokio::task::spawn_blocking(move || {
            if let Some(reader) = reader {
                if let Err(err) = reader.shutdown() {
                    log::error!(target: "flagsync", "stream reader: {err}");
                }
            }
            for poller in pollers {
                if let Err(err) = poller.shutdown() {
                    log::error!(target: "flagsync", "poller: {err}");
                }
            }
        })
        .await;
        if let Err(err) = joined {
            log::error!(target: "flagsync", "failed to join background threads: {err}");
        }

        inner.registry.shutdown().await;
    }

    /// Register a client's user key and fetch its memberships.
    pub fn register_client(&self, user_key: &str, synchronizer: Arc<dyn MembershipSynchronizer>) {
        let inner = &self.inner;
        inner.registry.register(user_key, synchronizer);

        let state = inner.state();
        if state.started && !state.stopped {
            if let Some(registration) = inner.registry.get(user_key) {
                registration.enqueue(MembershipAction::Refresh(SyncWorkItem::default()));
            }
        }
    }

    /// Remove a client's user key. Pending updates for it are dropped.
    pub fn unregister_client(&self, user_key: &str) {
        self.inner.registry.unregister(user_key);
    }

    /// Current mode.
    pub fn mode(&self) -> SyncMode {
        *self.inner.mode.borrow()
    }

    /// Watch mode changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncMode> {
        self.inner.mode.subscribe()
    }

    /// Guardian deciding whether a full synchronization is due on resume.
    pub fn guardian(&self) -> &SyncGuardian {
        &self.inner.guardian
    }

    /// Registry of user keys whose memberships are kept in sync.
    pub fn registry(&self) -> &Arc<MembershipRegistry> {
        &self.inner.registry
    }

    /// Push status keeper fed by the stream. Exposed so that transports with out-of-band signals
    /// can report them.
    pub fn push_status(&self) -> &Arc<PushStatusKeeper> {
        &self.inner.keeper
    }
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state
            .lock()
            .expect("thread holding sync manager lock should not panic")
    }

    fn set_mode(&self, mode: SyncMode) {
        let previous = self.mode.send_replace(mode);
        if previous != mode {
            log::debug!(target: "flagsync", "sync mode: {previous:?} -> {mode:?}");
        }
    }

    fn streaming_allowed(&self, state: &ManagerState) -> bool {
        self.config.streaming_enabled && self.transport.is_some() && !state.streaming_disabled
    }

    /// Enter the steady state: stream if possible, poll otherwise.
    fn start_sync_mode(self: &Arc<Self>) {
        let mut state = self.state();
        if state.stopped || state.paused {
            return;
        }
        if self.streaming_allowed(&state) {
            self.connect(&mut state);
        } else {
            let reason = if state.streaming_disabled {
                PollingReason::StreamingDisabled
            } else {
                PollingReason::Configured
            };
            self.start_polling(&mut state, Duration::ZERO);
            self.set_mode(SyncMode::Polling { reason });
        }
    }

    /// Fetch flags and memberships of every registered key in background.
    fn full_sync(&self) {
        log::debug!(target: "flagsync", "running full synchronization");
        let flags = Arc::clone(&self.flags);
        self.executor.schedule(Duration::ZERO, move || {
            if let Err(err) = flags.synchronize(None) {
                log::warn!(target: "flagsync", "flag synchronization failed: {err}");
            }
        });
        self.registry
            .broadcast(MembershipAction::Refresh(SyncWorkItem::default()));
    }

    fn connect(self: &Arc<Self>, state: &mut ManagerState) {
        let Some(transport) = &self.transport else {
            return;
        };
        self.close_stream(state);
        self.keeper.reset();
        self.set_mode(SyncMode::Connecting);

        match StreamReader::start(
            Arc::clone(transport),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.keeper),
        ) {
            Ok(reader) => state.reader = Some(reader),
            Err(err) => {
                log::error!(target: "flagsync", "failed to start stream reader: {err}");
                self.keeper.publish(PushStatus::RetryableError);
            }
        }
    }

    fn close_stream(&self, state: &mut ManagerState) {
        if let Some(reader) = state.reader.take() {
            reader.stop();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ManagerState, delay: Duration) {
        self.cancel_reconnect(state);
        let weak: Weak<Inner> = Arc::downgrade(self);
        state.reconnect = Some(self.executor.schedule(delay, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.state();
            state.reconnect = None;
            if state.stopped || state.paused || !inner.streaming_allowed(&state) {
                return;
            }
            inner.connect(&mut state);
        }));
    }

    fn cancel_reconnect(&self, state: &mut ManagerState) {
        if let Some(reconnect) = state.reconnect.take() {
            reconnect.cancel();
        }
    }

    fn start_polling(&self, state: &mut ManagerState, initial_delay: Duration) {
        if state.flag_poller.is_none() {
            let flags = Arc::clone(&self.flags);
            state.flag_poller = self.spawn_poller(
                "flagsync-flags-poller",
                self.config.features_refresh_rate,
                initial_delay,
                move || flags.synchronize(None),
            );
        }
        if state.membership_poller.is_none() {
            let registry = Arc::clone(&self.registry);
            state.membership_poller = self.spawn_poller(
                "flagsync-memberships-poller",
                self.config.segments_refresh_rate,
                initial_delay,
                move || {
                    registry.broadcast(MembershipAction::Refresh(SyncWorkItem::default()));
                    Ok(())
                },
            );
        }
    }

    fn spawn_poller<F>(
        &self,
        name: &str,
        interval: Duration,
        initial_delay: Duration,
        task: F,
    ) -> Option<PollerThread>
    where
        F: FnMut() -> crate::Result<()> + Send + 'static,
    {
        let config = PollerThreadConfig::new(interval)
            .with_jitter(self.config.poll_jitter)
            .with_initial_delay(initial_delay);
        match PollerThread::start(name, config, task) {
            Ok(poller) => Some(poller),
            Err(err) => {
                log::error!(target: "flagsync", "failed to start {name}: {err}");
                None
            }
        }
    }

    fn stop_polling(&self, state: &mut ManagerState) {
        for poller in [state.flag_poller.take(), state.membership_poller.take()]
            .into_iter()
            .flatten()
        {
            poller.stop();
        }
    }

    fn handle_status(self: &Arc<Self>, status: PushStatus) {
        let mut state = self.state();
        if state.stopped || state.paused {
            return;
        }

        match status {
            PushStatus::SubsystemUp => {
                log::info!(target: "flagsync", "streaming is up");
                self.cancel_reconnect(&mut state);
                state.backoff.reset();
                self.stop_polling(&mut state);
                self.set_mode(SyncMode::Streaming);
                drop(state);

                // Catch up with whatever happened while not streaming.
                self.full_sync();
                self.guardian.initialize();
                self.guardian.update_last_sync_timestamp();
            }
            PushStatus::SubsystemDown => {
                log::info!(target: "flagsync", "streaming is down, polling");
                self.start_polling(&mut state, Duration::ZERO);
                self.set_mode(SyncMode::Polling {
                    reason: PollingReason::StreamingDown,
                });
            }
            PushStatus::Disabled => {
                log::info!(target: "flagsync", "streaming disabled by server");
                self.disable_streaming(&mut state, PollingReason::StreamingDisabled);
            }
            PushStatus::NonRetryableError => {
                log::error!(target: "flagsync", "streaming failed permanently");
                self.disable_streaming(&mut state, PollingReason::HandshakeRejected);
            }
            PushStatus::RetryableError => {
                self.close_stream(&mut state);
                self.start_polling(&mut state, Duration::ZERO);

                let attempt = state.backoff.attempts();
                if attempt < self.config.max_stream_retry_attempts {
                    let delay = state.backoff.next_delay();
                    log::warn!(target: "flagsync", "streaming failed, reconnecting in {delay:?}");
                    self.set_mode(SyncMode::Backoff {
                        attempt: attempt + 1,
                    });
                    self.schedule_reconnect(&mut state, delay);
                } else {
                    let delay = self.config.slow_stream_retry_interval;
                    log::warn!(target: "flagsync", "streaming retries exhausted, reconnecting in {delay:?}");
                    self.set_mode(SyncMode::Polling {
                        reason: PollingReason::RetriesExhausted,
                    });
                    self.schedule_reconnect(&mut state, delay);
                }
            }
            PushStatus::Reset => {
                log::info!(target: "flagsync", "streaming reset requested");
                self.cancel_reconnect(&mut state);
                self.connect(&mut state);
            }
        }
    }

    fn disable_streaming(&self, state: &mut ManagerState, reason: PollingReason) {
        state.streaming_disabled = true;
        self.cancel_reconnect(state);
        self.close_stream(state);
        self.start_polling(state, Duration::ZERO);
        self.set_mode(SyncMode::Polling { reason });
    }
}
