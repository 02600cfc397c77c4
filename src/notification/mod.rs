//! Typed push notifications.
//!
//! Every event received on the push stream is parsed (see [`NotificationParser`]) into a
//! [`Notification`] and then routed by [`NotificationDispatcher`].
use std::collections::BTreeSet;

use serde::Deserialize;
use serde_with::{serde_as, DefaultOnNull, TryFromInto};

use crate::{
    codec::{decode_payload, Compression, HashAlgorithm},
    Error, Result,
};

mod dispatcher;
mod parser;

pub use dispatcher::NotificationDispatcher;
pub use parser::{EventStreamParser, NotificationParser, RawEvent};

/// A parsed push notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Channel the notification was published on.
    pub channel: String,
    /// Server timestamp in milliseconds since epoch. `0` when not provided.
    pub timestamp: i64,
    /// Inner JSON payload as received.
    pub raw: String,
    /// Typed notification content.
    pub kind: NotificationKind,
}

/// Closed set of notification types understood by this client.
#[derive(Debug, Clone, PartialEq, derive_more::From)]
pub enum NotificationKind {
    /// One or more flags changed.
    FlagsChanged(FlagsChanged),
    /// A flag was killed.
    FlagKilled(FlagKilled),
    /// Segment membership changed.
    Membership(MembershipUpdate),
    /// Streaming control message.
    Control(Control),
    /// Publisher count on a control channel.
    Occupancy(Occupancy),
    /// Streaming error reported by the server.
    Error(StreamingError),
}

/// `SPLIT_UPDATE` notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagsChanged {
    /// Change number of the new flag definitions.
    pub change_number: i64,
    /// Change number the inline definition applies on top of.
    #[serde(rename = "pcn", default)]
    pub previous_change_number: Option<i64>,
    /// Compression of the inline definition.
    #[serde(rename = "c", default)]
    pub compression: Option<u8>,
    /// Inline flag definition, base64 encoded and optionally compressed.
    #[serde(rename = "d", default)]
    pub definition: Option<String>,
}

impl FlagsChanged {
    /// Notification without an inline definition.
    pub fn new(change_number: i64) -> FlagsChanged {
        FlagsChanged {
            change_number,
            previous_change_number: None,
            compression: None,
            definition: None,
        }
    }

    /// Decode the inline flag definition, if any.
    pub fn decode_definition(&self) -> Result<Option<serde_json::Value>> {
        let Some(data) = &self.definition else {
            return Ok(None);
        };
        let compression = Compression::try_from(self.compression.unwrap_or(0))?;
        let bytes = decode_payload(data, compression)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// `SPLIT_KILL` notification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagKilled {
    /// Change number of the kill.
    pub change_number: i64,
    /// Killed flag.
    #[serde(rename = "splitName")]
    pub flag_name: String,
    /// Treatment served while the flag is killed.
    pub default_treatment: String,
}

/// Which membership store a [`MembershipUpdate`] targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MembershipScope {
    /// Regular segments (`MEMBERSHIPS_MS_UPDATE`).
    #[default]
    Regular,
    /// Large segments (`MEMBERSHIPS_LS_UPDATE`).
    Large,
}

/// How a membership update should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateStrategy {
    /// Refetch memberships after a jitter delay.
    UnboundedFetch,
    /// Refetch only if the key is set in the bitmap payload.
    BoundedFetch,
    /// Add or remove the key according to the hashed key list payload.
    KeyList,
    /// Remove the named segments.
    Removal,
}

impl TryFrom<u8> for UpdateStrategy {
    type Error = Error;

    fn try_from(code: u8) -> Result<UpdateStrategy> {
        match code {
            0 => Ok(UpdateStrategy::UnboundedFetch),
            1 => Ok(UpdateStrategy::BoundedFetch),
            2 => Ok(UpdateStrategy::KeyList),
            3 => Ok(UpdateStrategy::Removal),
            _ => Err(Error::UnknownCode {
                kind: "update strategy",
                code: code.to_string(),
            }),
        }
    }
}

/// `MEMBERSHIPS_MS_UPDATE` / `MEMBERSHIPS_LS_UPDATE` notification.
///
/// Compression and hash algorithm are kept as raw codes: an unknown value there must degrade into
/// a refetch instead of dropping the whole notification.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MembershipUpdate {
    /// Store targeted by this update.
    #[serde(skip)]
    pub scope: MembershipScope,
    /// Change number the update brings the store to.
    #[serde(rename = "cn", default)]
    pub change_number: Option<i64>,
    /// Affected segment names.
    #[serde(rename = "n", default)]
    #[serde_as(as = "DefaultOnNull")]
    pub names: BTreeSet<String>,
    /// How the update must be applied.
    #[serde(rename = "u")]
    #[serde_as(as = "TryFromInto<u8>")]
    pub strategy: UpdateStrategy,
    /// Raw compression code of `data`.
    #[serde(rename = "c", default)]
    pub compression: Option<u8>,
    /// Encoded payload (bitmap or key list).
    #[serde(rename = "d", default)]
    pub data: Option<String>,
    /// Update interval in milliseconds used to spread refetches.
    #[serde(rename = "i", default)]
    pub update_interval_ms: Option<i64>,
    /// Raw hash algorithm code used for jitter.
    #[serde(rename = "h", default)]
    pub hash_algorithm: Option<u8>,
    /// Hash seed used for jitter.
    #[serde(rename = "s", default)]
    pub seed: Option<i32>,
}

impl MembershipUpdate {
    /// Minimal update used by tests and by callers synthesizing notifications.
    pub fn new(scope: MembershipScope, strategy: UpdateStrategy) -> MembershipUpdate {
        MembershipUpdate {
            scope,
            change_number: None,
            names: BTreeSet::new(),
            strategy,
            compression: None,
            data: None,
            update_interval_ms: None,
            hash_algorithm: None,
            seed: None,
        }
    }

    /// Compression of the payload. Missing means none.
    pub fn compression(&self) -> Result<Compression> {
        Compression::try_from(self.compression.unwrap_or(0))
    }

    /// Hash algorithm for jitter. Unknown codes fall back to the default algorithm.
    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
            .and_then(|code| HashAlgorithm::try_from(code).ok())
            .unwrap_or_default()
    }

    /// Payload, or [`Error::MissingField`] if absent.
    pub fn payload(&self) -> Result<&str> {
        self.data.as_deref().ok_or(Error::MissingField("d"))
    }
}

/// Streaming control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlType {
    /// Stop processing data notifications and poll instead.
    StreamingPaused,
    /// Process data notifications again.
    StreamingResumed,
    /// Streaming was turned back on.
    StreamingEnabled,
    /// Streaming is off for the rest of the session.
    StreamingDisabled,
    /// Reconnect the stream.
    StreamingReset,
    /// Command not known to this client.
    #[serde(other)]
    Unknown,
}

/// `CONTROL` notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Control {
    /// Command sent.
    pub control_type: ControlType,
}

/// Control channel an occupancy message was published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OccupancyChannel {
    /// `control_pri` channel.
    Primary,
    /// `control_sec` channel.
    Secondary,
}

impl OccupancyChannel {
    /// Classify a channel name. Returns `None` for non-control channels.
    pub fn from_channel(channel: &str) -> Option<OccupancyChannel> {
        if channel.contains("control_pri") {
            Some(OccupancyChannel::Primary)
        } else if channel.contains("control_sec") {
            Some(OccupancyChannel::Secondary)
        } else {
            None
        }
    }
}

/// Occupancy notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    /// Channel the count applies to.
    pub channel: OccupancyChannel,
    /// Number of publishers currently on the channel.
    pub publishers: u32,
}

/// Error sent by the streaming server as an `error` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingError {
    /// Human readable message.
    #[serde(default)]
    pub message: String,
    /// Server error code.
    #[serde(default)]
    pub code: i64,
    /// HTTP-like status of the error.
    #[serde(default)]
    pub status_code: i64,
}

impl StreamingError {
    /// Only `4xxxx` codes are meaningful for the client.
    pub fn should_be_ignored(&self) -> bool {
        !(40000..=49999).contains(&self.code)
    }

    /// Token-related errors (`4014x`) can be fixed by reconnecting with a fresh token.
    pub fn is_retryable(&self) -> bool {
        (40140..=40149).contains(&self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_error_classification() {
        let error = |code| StreamingError {
            message: "token expired".to_owned(),
            code,
            status_code: 401,
        };

        assert!(error(40142).is_retryable());
        assert!(!error(40142).should_be_ignored());
        assert!(!error(40300).is_retryable());
        assert!(!error(40300).should_be_ignored());
        assert!(error(50000).should_be_ignored());
        assert!(error(39999).should_be_ignored());
    }

    #[test]
    fn occupancy_channel_from_name() {
        assert_eq!(
            OccupancyChannel::from_channel("[?occupancy=metrics.publishers]control_pri"),
            Some(OccupancyChannel::Primary)
        );
        assert_eq!(
            OccupancyChannel::from_channel("[?occupancy=metrics.publishers]control_sec"),
            Some(OccupancyChannel::Secondary)
        );
        assert_eq!(OccupancyChannel::from_channel("xxxx_splits"), None);
    }

    #[test]
    fn membership_update_from_json() {
        let update: MembershipUpdate = serde_json::from_str(
            r#"{"type":"MEMBERSHIPS_LS_UPDATE","cn":1702507130121,"n":["android_test","ios_test"],"c":2,"u":1,"d":"abc","i":100,"h":1,"s":325}"#,
        )
        .unwrap();

        assert_eq!(update.change_number, Some(1702507130121));
        assert_eq!(update.names.len(), 2);
        assert_eq!(update.strategy, UpdateStrategy::BoundedFetch);
        assert_eq!(update.compression().unwrap(), Compression::Zlib);
        assert_eq!(update.hash_algorithm(), HashAlgorithm::Murmur3_32);
        assert_eq!(update.seed, Some(325));
    }

    #[test]
    fn membership_update_tolerates_nulls() {
        let update: MembershipUpdate =
            serde_json::from_str(r#"{"u":0,"n":null,"c":7,"h":9}"#).unwrap();

        assert!(update.names.is_empty());
        assert!(update.compression().is_err());
        assert_eq!(update.hash_algorithm(), HashAlgorithm::None);
        assert!(matches!(update.payload(), Err(Error::MissingField("d"))));
    }

    #[test]
    fn unknown_update_strategy_is_rejected() {
        assert!(serde_json::from_str::<MembershipUpdate>(r#"{"u":9}"#).is_err());
    }

    #[test]
    fn inline_flag_definition() {
        let definition = r#"{"name":"mauro_java","changeNumber":1684265694505}"#;
        let encoded = crate::codec::tests::encode(definition.as_bytes(), Compression::Gzip);
        let notification = FlagsChanged {
            change_number: 1684265694505,
            previous_change_number: Some(0),
            compression: Some(1),
            definition: Some(encoded),
        };

        let value = notification.decode_definition().unwrap().unwrap();
        assert_eq!(value["name"], "mauro_java");
        assert_eq!(FlagsChanged::new(1).decode_definition().unwrap(), None);
    }
}
