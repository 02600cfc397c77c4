use std::sync::Arc;

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};

use super::{MembershipAction, MembershipSynchronizer, SyncWorkItem};

enum Command {
    Run(MembershipAction),
    Shutdown,
}

/// Single consumer of the membership actions of one user key.
///
/// At most one synchronizer call for the key is in flight at any time. Mutations run in arrival
/// order as soon as they are received. Refreshes wait for their delay, and a refresh that arrives
/// while another one is waiting is merged into it.
pub(crate) struct MembershipWorker {
    sender: mpsc::UnboundedSender<Command>,
    join_handle: JoinHandle<()>,
}

impl MembershipWorker {
    /// Spawn the worker on `runtime`.
    pub(crate) fn spawn(
        runtime: &tokio::runtime::Handle,
        user_key: String,
        synchronizer: Arc<dyn MembershipSynchronizer>,
    ) -> MembershipWorker {
        let (sender, receiver) = mpsc::unbounded_channel();
        let join_handle = runtime.spawn(run(user_key, synchronizer, receiver));
        MembershipWorker {
            sender,
            join_handle,
        }
    }

    /// Queue `action`. Returns `false` if the worker has already stopped.
    pub(crate) fn enqueue(&self, action: MembershipAction) -> bool {
        self.sender.send(Command::Run(action)).is_ok()
    }

    /// Ask the worker to stop. Queued mutations are still applied, pending refreshes are dropped.
    pub(crate) fn stop(&self) {
        let _ = self.sender.send(Command::Shutdown);
    }

    /// Stop the worker and wait for queued mutations to be applied.
    pub(crate) async fn shutdown(self) {
        self.stop();
        if let Err(err) = self.join_handle.await {
            log::error!(target: "flagsync", "membership worker failed: {err}");
        }
    }
}

/// Refresh waiting for its delay to elapse.
struct PendingRefresh {
    item: SyncWorkItem,
    deadline: Instant,
}

impl PendingRefresh {
    fn new(item: SyncWorkItem) -> PendingRefresh {
        PendingRefresh {
            deadline: Instant::now() + item.delay,
            item,
        }
    }

    /// Merge `next` in. The earliest deadline wins.
    fn merge(&mut self, next: SyncWorkItem) {
        self.deadline = self.deadline.min(Instant::now() + next.delay);
        self.item = self.item.coalesce(next);
    }
}

async fn run(
    user_key: String,
    synchronizer: Arc<dyn MembershipSynchronizer>,
    mut receiver: mpsc::UnboundedReceiver<Command>,
) {
    let mut pending: Option<PendingRefresh> = None;

    loop {
        let deadline = pending
            .as_ref()
            .map_or_else(Instant::now, |refresh| refresh.deadline);

        tokio::select! {
            _ = sleep_until(deadline), if pending.is_some() => {
                if let Some(refresh) = pending.take() {
                    execute(&user_key, &synchronizer, MembershipAction::Refresh(refresh.item)).await;
                }
            }
            command = receiver.recv() => match command {
                Some(Command::Run(MembershipAction::Refresh(next))) => match &mut pending {
                    Some(refresh) => refresh.merge(next),
                    None => pending = Some(PendingRefresh::new(next)),
                },
                // Mutations need no network and do not wait behind a pending refresh.
                Some(Command::Run(mutation)) => execute(&user_key, &synchronizer, mutation).await,
                Some(Command::Shutdown) | None => break,
            }
        }
    }

    if pending.is_some() {
        log::debug!(target: "flagsync", user_key = user_key.as_str(); "dropping pending membership refresh on shutdown");
    }
    drain(&user_key, &synchronizer, receiver).await;
}

async fn execute(
    user_key: &str,
    synchronizer: &Arc<dyn MembershipSynchronizer>,
    action: MembershipAction,
) {
    let synchronizer = Arc::clone(synchronizer);
    let key = user_key.to_owned();
    let result = tokio::task::spawn_blocking(move || {
        let result = action.apply(synchronizer.as_ref(), &key);
        (action, result)
    })
    .await;

    match result {
        Ok((action, Ok(()))) => {
            log::debug!(target: "flagsync", user_key; "membership action applied: {action:?}");
        }
        Ok((action, Err(err))) => {
            log::warn!(target: "flagsync", user_key; "membership action {action:?} failed: {err}");
        }
        Err(err) => {
            log::error!(target: "flagsync", user_key; "membership action panicked: {err}");
        }
    }
}

/// Apply mutations that were queued before shutdown. Refreshes need the network and are dropped.
async fn drain(
    user_key: &str,
    synchronizer: &Arc<dyn MembershipSynchronizer>,
    mut receiver: mpsc::UnboundedReceiver<Command>,
) {
    receiver.close();
    let mut dropped = 0;
    while let Some(command) = receiver.recv().await {
        match command {
            Command::Run(action) if action.is_refresh() => dropped += 1,
            Command::Run(action) => execute(user_key, synchronizer, action).await,
            Command::Shutdown => {}
        }
    }
    if dropped > 0 {
        log::debug!(target: "flagsync", user_key; "dropped {dropped} pending refreshes on shutdown");
    }
}
