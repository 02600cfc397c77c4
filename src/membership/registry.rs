use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use super::{
    MembershipAction, MembershipSynchronizer, MembershipWorker, UpdateStrategyExecutor,
};
use crate::{codec::channel_key_hash, notification::MembershipUpdate};

/// Suffix of membership channels shared by all keys.
const BROADCAST_CHANNEL_SUFFIX: &str = "_memberships";

/// Membership update machinery of one registered user key.
pub struct Registration {
    executor: UpdateStrategyExecutor,
    channel_hash: String,
    synchronizer: Arc<dyn MembershipSynchronizer>,
    worker: MembershipWorker,
}

impl Registration {
    /// Registered user key.
    pub fn user_key(&self) -> &str {
        self.executor.user_key()
    }

    /// Synchronizer of the key's membership stores.
    pub fn synchronizer(&self) -> &Arc<dyn MembershipSynchronizer> {
        &self.synchronizer
    }

    /// Queue an action for this key.
    pub fn enqueue(&self, action: MembershipAction) {
        if !self.worker.enqueue(action) {
            log::debug!(target: "flagsync", user_key = self.user_key(); "membership worker already stopped");
        }
    }

    /// Whether `channel` is addressed to this key.
    fn listens_to(&self, channel: &str) -> bool {
        channel.ends_with(BROADCAST_CHANNEL_SUFFIX)
            || channel.split('_').any(|part| part == self.channel_hash)
    }
}

/// Registered user keys and their membership workers.
///
/// The registry is owned by [`SyncManager`](crate::sync::SyncManager) and shared with clients,
/// which register their key when created and unregister it when destroyed.
pub struct MembershipRegistry {
    runtime: tokio::runtime::Handle,
    default_update_interval: Duration,
    registrations: RwLock<HashMap<String, Arc<Registration>>>,
}

impl MembershipRegistry {
    /// Create an empty registry. Workers are spawned on `runtime`.
    pub fn new(runtime: tokio::runtime::Handle, default_update_interval: Duration) -> Self {
        MembershipRegistry {
            runtime,
            default_update_interval,
            registrations: RwLock::new(HashMap::new()),
        }
    }

    /// Register `user_key`. Registering the same key twice replaces the previous registration.
    pub fn register(&self, user_key: &str, synchronizer: Arc<dyn MembershipSynchronizer>) {
        let registration = Arc::new(Registration {
            executor: UpdateStrategyExecutor::new(user_key, self.default_update_interval),
            channel_hash: channel_key_hash(user_key),
            worker: MembershipWorker::spawn(&self.runtime, user_key.to_owned(), synchronizer.clone()),
            synchronizer,
        });

        let previous = self
            .registrations
            .write()
            .expect("thread holding registry lock should not panic")
            .insert(user_key.to_owned(), registration);

        if let Some(previous) = previous {
            previous.worker.stop();
        }
        log::debug!(target: "flagsync", user_key; "registered key");
    }

    /// Remove `user_key`. Unknown keys are ignored.
    pub fn unregister(&self, user_key: &str) {
        let removed = self
            .registrations
            .write()
            .expect("thread holding registry lock should not panic")
            .remove(user_key);

        if let Some(registration) = removed {
            registration.worker.stop();
            log::debug!(target: "flagsync", user_key; "unregistered key");
        }
    }

    /// Registration of `user_key`, if any.
    pub fn get(&self, user_key: &str) -> Option<Arc<Registration>> {
        self.registrations
            .read()
            .expect("thread holding registry lock should not panic")
            .get(user_key)
            .cloned()
    }

    /// Snapshot of all registrations.
    pub fn registrations(&self) -> Vec<Arc<Registration>> {
        self.registrations
            .read()
            .expect("thread holding registry lock should not panic")
            .values()
            .cloned()
            .collect()
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.registrations
            .read()
            .expect("thread holding registry lock should not panic")
            .len()
    }

    /// Whether no key is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the update strategy of every key addressed by `channel` and queue resulting actions.
    ///
    /// Returns the number of actions queued. Updates for keys that are not registered (anymore)
    /// are ignored.
    pub fn dispatch(&self, channel: &str, update: &MembershipUpdate) -> usize {
        let mut queued = 0;
        for registration in self.registrations() {
            if !registration.listens_to(channel) {
                continue;
            }
            if let Some(action) = registration.executor.execute(update) {
                registration.enqueue(action);
                queued += 1;
            }
        }
        queued
    }

    /// Queue an action for every registered key.
    pub fn broadcast(&self, action: MembershipAction) {
        for registration in self.registrations() {
            registration.enqueue(action.clone());
        }
    }

    /// Stop all workers, waiting for queued mutations to be applied.
    pub async fn shutdown(&self) {
        let registrations: Vec<_> = self
            .registrations
            .write()
            .expect("thread holding registry lock should not panic")
            .drain()
            .map(|(_, registration)| registration)
            .collect();

        for registration in registrations {
            match Arc::try_unwrap(registration) {
                Ok(registration) => registration.worker.shutdown().await,
                // Someone still holds the registration. Let the worker finish in background.
                Err(registration) => registration.worker.stop(),
            }
        }
    }
}
