use std::time::Duration;

use super::{MembershipAction, SyncWorkItem};
use crate::{
    codec::{hash_key, BitmapPayload, KeyListAction, KeyListPayload},
    jitter::sync_delay,
    notification::{MembershipUpdate, UpdateStrategy},
    Result,
};

/// Decides what a membership notification means for one user key.
#[derive(Debug, Clone)]
pub struct UpdateStrategyExecutor {
    user_key: String,
    hashed_key: u64,
    default_update_interval: Duration,
}

impl UpdateStrategyExecutor {
    /// Create an executor for `user_key`.
    pub fn new(user_key: impl Into<String>, default_update_interval: Duration) -> Self {
        let user_key = user_key.into();
        let hashed_key = hash_key(&user_key);
        UpdateStrategyExecutor {
            user_key,
            hashed_key,
            default_update_interval,
        }
    }

    /// User key this executor decides for.
    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    /// Compute the action required by `update`, if any.
    ///
    /// Payload problems never lose an update: if the payload cannot be decoded, a full refetch is
    /// requested instead.
    pub fn execute(&self, update: &MembershipUpdate) -> Option<MembershipAction> {
        let delay = self.sync_delay(update);

        match self.try_execute(update, delay) {
            Ok(action) => action,
            Err(err) => {
                log::warn!(target: "flagsync",
                           user_key = self.user_key.as_str();
                           "failed to process {:?} membership update, falling back to refetch: {err}",
                           update.strategy);
                Some(refresh(update, delay))
            }
        }
    }

    fn try_execute(
        &self,
        update: &MembershipUpdate,
        delay: Duration,
    ) -> Result<Option<MembershipAction>> {
        match update.strategy {
            UpdateStrategy::UnboundedFetch => {
                log::debug!(target: "flagsync", "unbounded membership fetch requested");
                Ok(Some(refresh(update, delay)))
            }
            UpdateStrategy::BoundedFetch => {
                let bitmap = BitmapPayload::decode(update.payload()?, update.compression()?)?;
                if bitmap.contains(self.hashed_key)? {
                    log::debug!(target: "flagsync", "key is in bounded fetch bitmap");
                    Ok(Some(refresh(update, delay)))
                } else {
                    Ok(None)
                }
            }
            UpdateStrategy::KeyList => {
                let key_list = KeyListPayload::decode(update.payload()?, update.compression()?)?;
                let add = match key_list.action(self.hashed_key) {
                    KeyListAction::Add => true,
                    KeyListAction::Remove => false,
                    KeyListAction::None => return Ok(None),
                };
                if update.names.is_empty() {
                    return Ok(None);
                }
                log::debug!(target: "flagsync", "applying key list update, adding = {add}");
                Ok(Some(MembershipAction::ApplyDelta {
                    scope: update.scope,
                    add,
                    names: update.names.clone(),
                    change_number: update.change_number,
                }))
            }
            UpdateStrategy::Removal => {
                if update.names.is_empty() {
                    return Ok(None);
                }
                log::debug!(target: "flagsync", "removing segments {:?}", update.names);
                Ok(Some(MembershipAction::Remove {
                    scope: update.scope,
                    names: update.names.clone(),
                    change_number: update.change_number,
                }))
            }
        }
    }

    /// Refetch delay for this key. Applies to fallback refetches of every strategy too.
    fn sync_delay(&self, update: &MembershipUpdate) -> Duration {
        sync_delay(
            &self.user_key,
            update.update_interval_ms,
            update.seed.map(|seed| seed as u32),
            update.hash_algorithm(),
            self.default_update_interval,
        )
    }
}

fn refresh(update: &MembershipUpdate, delay: Duration) -> MembershipAction {
    MembershipAction::Refresh(SyncWorkItem::new(delay, update.scope, update.change_number))
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, time::Duration};

    use super::*;
    use crate::{
        codec::{
            tests::{encode, BOUNDED_GZIP, BOUNDED_KEYS, KEY_LIST_GZIP},
            Compression,
        },
        jitter::DEFAULT_UPDATE_INTERVAL,
        notification::MembershipScope,
    };

    fn executor(key: &str) -> UpdateStrategyExecutor {
        let _ = env_logger::builder().is_test(true).try_init();
        UpdateStrategyExecutor::new(key, DEFAULT_UPDATE_INTERVAL)
    }

    fn update(strategy: UpdateStrategy, data: Option<&str>, compression: u8) -> MembershipUpdate {
        MembershipUpdate {
            change_number: Some(100),
            names: BTreeSet::from(["segment1".to_owned(), "segment2".to_owned()]),
            compression: Some(compression),
            data: data.map(str::to_owned),
            update_interval_ms: Some(1000),
            ..MembershipUpdate::new(MembershipScope::Regular, strategy)
        }
    }

    fn names() -> BTreeSet<String> {
        BTreeSet::from(["segment1".to_owned(), "segment2".to_owned()])
    }

    #[test]
    fn unbounded_fetch_refreshes_with_jitter() {
        let executor = executor("user1");
        let update = MembershipUpdate {
            scope: MembershipScope::Large,
            ..update(UpdateStrategy::UnboundedFetch, None, 0)
        };

        let Some(MembershipAction::Refresh(item)) = executor.execute(&update) else {
            panic!("expected refresh");
        };

        assert!(item.delay < Duration::from_millis(1000));
        assert_eq!(item.target_regular_change_number, None);
        assert_eq!(item.target_large_change_number, Some(100));
        // Same inputs, same delay.
        assert_eq!(executor.execute(&update), Some(MembershipAction::Refresh(item)));
    }

    #[test]
    fn bounded_fetch_with_bit_set_refreshes() {
        let executor = executor(BOUNDED_KEYS[4]);

        let action = executor.execute(&update(UpdateStrategy::BoundedFetch, Some(BOUNDED_GZIP), 1));

        let Some(MembershipAction::Refresh(item)) = action else {
            panic!("expected refresh, got {action:?}");
        };
        assert_eq!(item.target_regular_change_number, Some(100));
    }

    #[test]
    fn bounded_fetch_with_bit_clear_is_a_noop() {
        let bitmap = encode(&[0u8; 16], Compression::Zlib);

        for i in 0..50 {
            let executor = executor(&format!("key{i}"));
            let action = executor.execute(&update(UpdateStrategy::BoundedFetch, Some(&bitmap), 2));
            assert_eq!(action, None);
        }
    }

    #[test]
    fn bounded_fetch_with_malformed_payload_refreshes() {
        let executor = executor("user1");

        for (data, compression) in [(Some("H4sIAAAAAAAAg5EYy8MEMA20A+//5L7VQwAEAAA"), 1), (None, 1), (Some(BOUNDED_GZIP), 5)] {
            let action = executor.execute(&update(UpdateStrategy::BoundedFetch, data, compression));
            assert!(
                matches!(action, Some(MembershipAction::Refresh(_))),
                "{action:?}"
            );
        }
    }

    #[test]
    fn bounded_fetch_with_empty_bitmap_refreshes() {
        let executor = executor("user1");
        let empty = encode(&[], Compression::None);

        let action = executor.execute(&update(UpdateStrategy::BoundedFetch, Some(&empty), 0));

        assert!(matches!(action, Some(MembershipAction::Refresh(_))));
    }

    #[test]
    fn key_list_add_and_remove() {
        // Hashes in the fixture are not derived from known keys, so the executor hash is forged.
        let mut executor = executor("forged");

        executor.hashed_key = 1573573083296714675;
        let action = executor.execute(&update(UpdateStrategy::KeyList, Some(KEY_LIST_GZIP), 1));
        assert_eq!(
            action,
            Some(MembershipAction::ApplyDelta {
                scope: MembershipScope::Regular,
                add: true,
                names: names(),
                change_number: Some(100),
            })
        );

        executor.hashed_key = 6829471020522910836;
        let action = executor.execute(&update(UpdateStrategy::KeyList, Some(KEY_LIST_GZIP), 1));
        assert_eq!(
            action,
            Some(MembershipAction::ApplyDelta {
                scope: MembershipScope::Regular,
                add: false,
                names: names(),
                change_number: Some(100),
            })
        );

        executor.hashed_key = 1;
        let action = executor.execute(&update(UpdateStrategy::KeyList, Some(KEY_LIST_GZIP), 1));
        assert_eq!(action, None);
    }

    #[test]
    fn key_list_for_real_key() {
        let executor = executor("user-key");
        let payload = format!(r#"{{"a":[],"r":[{}]}}"#, hash_key("user-key"));
        let data = encode(payload.as_bytes(), Compression::None);

        let action = executor.execute(&update(UpdateStrategy::KeyList, Some(&data), 0));

        assert!(matches!(
            action,
            Some(MembershipAction::ApplyDelta { add: false, .. })
        ));
    }

    #[test]
    fn key_list_with_malformed_json_refreshes_with_jitter() {
        let executor = executor("user1");
        let data = encode(b"not json", Compression::Gzip);
        let update = update(UpdateStrategy::KeyList, Some(&data), 1);
        let jittered = sync_delay(
            "user1",
            Some(1000),
            None,
            update.hash_algorithm(),
            DEFAULT_UPDATE_INTERVAL,
        );

        let action = executor.execute(&update);

        assert_eq!(
            action,
            Some(MembershipAction::Refresh(SyncWorkItem::new(
                jittered,
                MembershipScope::Regular,
                Some(100)
            )))
        );
        // Same delay an unbounded fetch of the same key would get.
        let unbounded = MembershipUpdate {
            strategy: UpdateStrategy::UnboundedFetch,
            ..update
        };
        assert_eq!(executor.execute(&unbounded), action);
    }

    #[test]
    fn removal() {
        let executor = executor("user1");

        let action = executor.execute(&update(UpdateStrategy::Removal, None, 0));

        assert_eq!(
            action,
            Some(MembershipAction::Remove {
                scope: MembershipScope::Regular,
                names: names(),
                change_number: Some(100),
            })
        );
    }

    #[test]
    fn removal_without_names_is_a_noop() {
        let executor = executor("user1");
        let update = MembershipUpdate {
            names: BTreeSet::new(),
            ..update(UpdateStrategy::Removal, None, 0)
        };

        assert_eq!(executor.execute(&update), None);
    }
}
