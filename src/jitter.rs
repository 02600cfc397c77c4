//! Deterministic per-key refetch delay.
//!
//! After a mass invalidation every client receives the same notification at the same time. To
//! avoid a thundering herd, each client delays its refetch by an amount derived from its own key,
//! so the load is spread over the update interval while staying reproducible.
use std::time::Duration;

use crate::codec::{murmur3_32, murmur3_64, HashAlgorithm};

/// Update interval used when a notification does not carry one (or carries a non-positive one).
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(60_000);

/// Seed used when a notification does not carry one.
pub const DEFAULT_SEED: u32 = 0;

/// Compute the refetch delay for `key`.
///
/// `delay = hash(key, seed) mod interval`. Missing or non-positive `interval_ms` falls back to
/// `default_interval`, and a missing `seed` falls back to [`DEFAULT_SEED`].
pub fn sync_delay(
    key: &str,
    interval_ms: Option<i64>,
    seed: Option<u32>,
    algorithm: HashAlgorithm,
    default_interval: Duration,
) -> Duration {
    let interval = match interval_ms {
        Some(ms) if ms > 0 => ms as u64,
        _ => (default_interval.as_millis() as u64).max(1),
    };
    let seed = seed.unwrap_or(DEFAULT_SEED);

    let hash = match algorithm {
        HashAlgorithm::Murmur3_64 => murmur3_64(key.as_bytes(), seed),
        HashAlgorithm::None | HashAlgorithm::Murmur3_32 => {
            u64::from(murmur3_32(key.as_bytes(), seed))
        }
    };

    Duration::from_millis(hash % interval)
}
