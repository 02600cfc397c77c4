//! Per-key membership updates.
//!
//! Each registered user key gets its own [`UpdateStrategyExecutor`], which turns a membership
//! notification into a [`MembershipAction`], and its own worker, which executes those actions one
//! at a time against a [`MembershipSynchronizer`].
use std::{collections::BTreeSet, time::Duration};

use crate::{notification::MembershipScope, Result};

mod executor;
mod registry;
mod worker;

pub use executor::UpdateStrategyExecutor;
pub use registry::{MembershipRegistry, Registration};
pub(crate) use worker::MembershipWorker;

/// Storage and network operations needed to keep memberships of a key up to date.
///
/// Methods are blocking. They are always invoked from a blocking thread pool, never from the
/// stream reader.
pub trait MembershipSynchronizer: Send + Sync {
    /// Fetch memberships of `user_key` from the server, until the stored change numbers reach the
    /// work item targets.
    fn refresh(&self, user_key: &str, item: &SyncWorkItem) -> Result<()>;

    /// Add `user_key` to (or remove it from) `names` without a network round trip.
    fn apply_segment_delta(
        &self,
        user_key: &str,
        scope: MembershipScope,
        add: bool,
        names: &BTreeSet<String>,
        change_number: Option<i64>,
    ) -> Result<()>;

    /// Remove segments `names` from `user_key` memberships.
    fn remove_segments(
        &self,
        user_key: &str,
        scope: MembershipScope,
        names: &BTreeSet<String>,
        change_number: Option<i64>,
    ) -> Result<()>;
}

/// A pending membership refetch for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncWorkItem {
    /// How long to wait before refetching.
    pub delay: Duration,
    /// Change number the regular membership store must reach, if known.
    pub target_regular_change_number: Option<i64>,
    /// Change number the large membership store must reach, if known.
    pub target_large_change_number: Option<i64>,
}

impl SyncWorkItem {
    /// Work item targeting `change_number` in `scope`.
    pub fn new(delay: Duration, scope: MembershipScope, change_number: Option<i64>) -> SyncWorkItem {
        match scope {
            MembershipScope::Regular => SyncWorkItem {
                delay,
                target_regular_change_number: change_number,
                target_large_change_number: None,
            },
            MembershipScope::Large => SyncWorkItem {
                delay,
                target_regular_change_number: None,
                target_large_change_number: change_number,
            },
        }
    }

    /// Merge two pending refetches into one.
    ///
    /// Targets only move forward, so the merged item targets the newest change numbers and runs as
    /// soon as the most urgent of the two.
    pub fn coalesce(self, other: SyncWorkItem) -> SyncWorkItem {
        SyncWorkItem {
            delay: self.delay.min(other.delay),
            target_regular_change_number: self
                .target_regular_change_number
                .max(other.target_regular_change_number),
            target_large_change_number: self
                .target_large_change_number
                .max(other.target_large_change_number),
        }
    }
}

/// What a membership notification requires for a specific key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipAction {
    /// Refetch memberships from the server.
    Refresh(SyncWorkItem),
    /// Add or remove the key from segments directly.
    ApplyDelta {
        /// Store to update.
        scope: MembershipScope,
        /// `true` to add the key to `names`, `false` to remove it.
        add: bool,
        /// Affected segments.
        names: BTreeSet<String>,
        /// Change number of the store after the update.
        change_number: Option<i64>,
    },
    /// Drop segments from the key memberships.
    Remove {
        /// Store to update.
        scope: MembershipScope,
        /// Segments to drop.
        names: BTreeSet<String>,
        /// Change number of the store after the update.
        change_number: Option<i64>,
    },
}

impl MembershipAction {
    /// Whether this is a refetch, which needs the network.
    pub fn is_refresh(&self) -> bool {
        matches!(self, MembershipAction::Refresh(_))
    }

    /// Run the action against `synchronizer`.
    pub(crate) fn apply(
        &self,
        synchronizer: &dyn MembershipSynchronizer,
        user_key: &str,
    ) -> Result<()> {
        match self {
            MembershipAction::Refresh(item) => synchronizer.refresh(user_key, item),
            MembershipAction::ApplyDelta {
                scope,
                add,
                names,
                change_number,
            } => synchronizer.apply_segment_delta(user_key, *scope, *add, names, *change_number),
            MembershipAction::Remove {
                scope,
                names,
                change_number,
            } => synchronizer.remove_segments(user_key, *scope, names, *change_number),
        }
    }
}
