//! Impression deduplication.
//!
//! Every flag evaluation produces an [`Impression`]. In optimized mode, identical impressions seen
//! within the same hour are counted instead of sent. [`ImpressionsObserver`] remembers when each
//! impression fingerprint was last seen, across restarts.
use serde::{Deserialize, Serialize};

use crate::codec::murmur3_64;

mod lru_cache;
mod observer;
mod storage;

pub use lru_cache::{ListenableLruCache, RemovalListener};
pub use observer::{ImpressionsObserver, ImpressionsObserverCache};
pub use storage::{ObserverRow, PersistentObserverStorage, SqliteObserverStorage};

/// Record of one flag evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Impression {
    /// User key the flag was evaluated for.
    pub key: String,
    /// Key used for bucketing, when different from `key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucketing_key: Option<String>,
    /// Flag name.
    pub feature: String,
    /// Treatment served.
    pub treatment: String,
    /// Rule that produced the treatment.
    pub label: Option<String>,
    /// Change number of the flag definition that was evaluated.
    pub change_number: Option<i64>,
    /// Evaluation time in milliseconds since epoch.
    pub time: i64,
    /// Last time the same impression was seen, filled by [`ImpressionsDeduper`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_time: Option<i64>,
}

/// Computes impression fingerprints.
pub struct ImpressionHasher;

impl ImpressionHasher {
    const UNKNOWN: &'static str = "UNKNOWN";

    /// Fingerprint of `impression`: the hash of key, feature, treatment, label and change number.
    /// Evaluation time is not part of it.
    pub fn process(impression: &Impression) -> u64 {
        let change_number = impression
            .change_number
            .map(|cn| cn.to_string())
            .unwrap_or_else(|| ImpressionHasher::UNKNOWN.to_owned());
        let fingerprint = format!(
            "{}:{}:{}:{}:{}",
            impression.key,
            impression.feature,
            impression.treatment,
            impression.label.as_deref().unwrap_or(ImpressionHasher::UNKNOWN),
            change_number,
        );
        murmur3_64(fingerprint.as_bytes(), 0)
    }
}

const HOUR_MILLIS: i64 = 3600 * 1000;

/// Start of the hour `time` falls in.
fn truncate_to_hour(time: i64) -> i64 {
    time - time.rem_euclid(HOUR_MILLIS)
}

/// Drops impressions already seen within the current hour.
pub struct ImpressionsDeduper {
    observer: ImpressionsObserver,
}

impl ImpressionsDeduper {
    /// Create a deduper remembering impressions in `observer`.
    pub fn new(observer: ImpressionsObserver) -> ImpressionsDeduper {
        ImpressionsDeduper { observer }
    }

    /// Fill `previous_time` and decide whether the impression must be sent. Returns `None` for a
    /// duplicate.
    pub fn process(&self, mut impression: Impression) -> Option<Impression> {
        impression.previous_time = self.observer.test_and_set(&impression);
        match impression.previous_time {
            Some(previous)
                if truncate_to_hour(previous) == truncate_to_hour(impression.time) =>
            {
                log::trace!(target: "flagsync", "duplicate impression for {}", impression.feature);
                None
            }
            _ => Some(impression),
        }
    }

    /// Observer backing this deduper.
    pub fn observer(&self) -> &ImpressionsObserver {
        &self.observer
    }
}
