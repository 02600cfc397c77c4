use serde::Deserialize;

use super::{
    Control, FlagKilled, FlagsChanged, MembershipScope, MembershipUpdate, Notification,
    NotificationKind, Occupancy, OccupancyChannel, StreamingError,
};
use crate::{Error, Result};

/// One server-sent event block, split into its fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    /// `id` field.
    pub id: Option<String>,
    /// `event` field, the event type.
    pub event: Option<String>,
    /// `data` field. Multiple data lines are joined with `\n`.
    pub data: Option<String>,
}

impl RawEvent {
    /// Block contained only comments (or nothing at all).
    pub fn is_keep_alive(&self) -> bool {
        self.id.is_none() && self.event.is_none() && self.data.is_none()
    }

    /// Whether this is an `error` event.
    pub fn is_error(&self) -> bool {
        self.event.as_deref() == Some("error")
    }

    /// Whether receiving this event proves the stream connection is established.
    ///
    /// The server opens the stream either with an id-only block or with a regular data message.
    pub fn is_connection_confirmation(&self) -> bool {
        if self.id.is_some() && self.data.is_none() && self.event.is_none() {
            return true;
        }
        self.data.is_some() && !self.is_error()
    }
}

/// Splits event-stream text into [`RawEvent`]s.
pub struct EventStreamParser;

impl EventStreamParser {
    /// Parse a single event block (lines up to, not including, the blank separator line).
    pub fn parse(block: &str) -> RawEvent {
        let mut event = RawEvent::default();

        for line in block.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with(':') {
                // Comments are used as keep-alives.
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "id" => event.id = Some(value.to_owned()),
                "event" => event.event = Some(value.to_owned()),
                "data" => match &mut event.data {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => event.data = Some(value.to_owned()),
                },
                _ => {
                    log::trace!(target: "flagsync", "ignoring event stream field {field:?}");
                }
            }
        }

        event
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    channel: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct OccupancyMessage {
    metrics: OccupancyMetrics,
}

#[derive(Debug, Deserialize)]
struct OccupancyMetrics {
    publishers: u32,
}

/// Turns [`RawEvent`]s into typed [`Notification`]s.
pub struct NotificationParser;

impl NotificationParser {
    /// Parse a raw event.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingField`] if the event has no data or the message has no type.
    /// - [`Error::Json`] if the envelope or the message is malformed.
    /// - [`Error::UnknownCode`] if the message type is not supported by this client.
    pub fn parse(event: &RawEvent) -> Result<Notification> {
        let data = event.data.as_deref().ok_or(Error::MissingField("data"))?;

        if event.is_error() {
            let error: StreamingError = serde_json::from_str(data)?;
            return Ok(Notification {
                channel: String::new(),
                timestamp: 0,
                raw: data.to_owned(),
                kind: error.into(),
            });
        }

        let envelope: Envelope = serde_json::from_str(data)?;
        let kind = NotificationParser::parse_message(&envelope.channel, &envelope.data)?;

        Ok(Notification {
            channel: envelope.channel,
            timestamp: envelope.timestamp,
            raw: envelope.data,
            kind,
        })
    }

    /// Parse the inner message published on `channel`.
    pub fn parse_message(channel: &str, message: &str) -> Result<NotificationKind> {
        let value: serde_json::Value = serde_json::from_str(message)?;

        let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
            // Occupancy messages carry no type, only the control channel tells them apart.
            let channel = OccupancyChannel::from_channel(channel).ok_or(Error::MissingField("type"))?;
            let occupancy = OccupancyMessage::deserialize(&value)?;
            return Ok(Occupancy {
                channel,
                publishers: occupancy.metrics.publishers,
            }
            .into());
        };

        let kind = match kind {
            "SPLIT_UPDATE" => FlagsChanged::deserialize(&value)?.into(),
            "SPLIT_KILL" => FlagKilled::deserialize(&value)?.into(),
            "MEMBERSHIPS_MS_UPDATE" => membership(&value, MembershipScope::Regular)?,
            "MEMBERSHIPS_LS_UPDATE" => membership(&value, MembershipScope::Large)?,
            "CONTROL" => Control::deserialize(&value)?.into(),
            other => {
                return Err(Error::UnknownCode {
                    kind: "notification type",
                    code: other.to_owned(),
                })
            }
        };

        Ok(kind)
    }
}

fn membership(value: &serde_json::Value, scope: MembershipScope) -> Result<NotificationKind> {
    let mut update = MembershipUpdate::deserialize(value)?;
    update.scope = scope;
    Ok(update.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{ControlType, UpdateStrategy};

    fn envelope(channel: &str, message: &str) -> RawEvent {
        let data = serde_json::json!({
            "id": "Y0wbkWL3Ow:0:0",
            "clientId": "pri:MTUzNDg4NzIxNg==",
            "timestamp": 1591988398533_i64,
            "encoding": "json",
            "channel": channel,
            "data": message,
        });
        RawEvent {
            id: Some("Y0wbkWL3Ow:0:0".to_owned()),
            event: Some("message".to_owned()),
            data: Some(data.to_string()),
        }
    }

    #[test]
    fn event_stream_block() {
        let event = EventStreamParser::parse(
            "id: 123\nevent: message\ndata: {\"a\":\ndata: 1}\nretry: 1000\n",
        );

        assert_eq!(event.id.as_deref(), Some("123"));
        assert_eq!(event.event.as_deref(), Some("message"));
        assert_eq!(event.data.as_deref(), Some("{\"a\":\n1}"));
        assert!(event.is_connection_confirmation());
    }

    #[test]
    fn keep_alive_block() {
        let event = EventStreamParser::parse(":keepalive\n");

        assert!(event.is_keep_alive());
        assert!(!event.is_connection_confirmation());
    }

    #[test]
    fn id_only_block_confirms_connection() {
        let event = EventStreamParser::parse("id: abc\n");
        assert!(event.is_connection_confirmation());
    }

    #[test]
    fn error_block_does_not_confirm_connection() {
        let event = EventStreamParser::parse(
            "event: error\ndata: {\"message\":\"Token expired\",\"code\":40142,\"statusCode\":401}\n",
        );
        assert!(!event.is_connection_confirmation());

        let notification = NotificationParser::parse(&event).unwrap();
        let NotificationKind::Error(error) = notification.kind else {
            panic!("expected error, got {:?}", notification.kind);
        };
        assert_eq!(error.code, 40142);
        assert_eq!(error.status_code, 401);
        assert!(error.is_retryable());
    }

    #[test]
    fn flag_update() {
        let notification = NotificationParser::parse(&envelope(
            "xxxx_xxxx_splits",
            r#"{"type":"SPLIT_UPDATE","changeNumber":1591996685190}"#,
        ))
        .unwrap();

        assert_eq!(notification.channel, "xxxx_xxxx_splits");
        assert_eq!(notification.timestamp, 1591988398533);
        assert_eq!(
            notification.kind,
            NotificationKind::FlagsChanged(FlagsChanged::new(1591996685190))
        );
    }

    #[test]
    fn flag_kill() {
        let notification = NotificationParser::parse(&envelope(
            "xxxx_xxxx_splits",
            r#"{"type":"SPLIT_KILL","changeNumber":1591996754396,"defaultTreatment":"off","splitName":"test"}"#,
        ))
        .unwrap();

        assert_eq!(
            notification.kind,
            NotificationKind::FlagKilled(FlagKilled {
                change_number: 1591996754396,
                flag_name: "test".to_owned(),
                default_treatment: "off".to_owned(),
            })
        );
    }

    #[test]
    fn large_membership_update() {
        let notification = NotificationParser::parse(&envelope(
            "xxxx_xxxx_memberships",
            r#"{"type":"MEMBERSHIPS_LS_UPDATE","cn":10,"n":["ls"],"u":0,"i":100}"#,
        ))
        .unwrap();

        let NotificationKind::Membership(update) = notification.kind else {
            panic!("expected membership update");
        };
        assert_eq!(update.scope, MembershipScope::Large);
        assert_eq!(update.strategy, UpdateStrategy::UnboundedFetch);
        assert_eq!(update.change_number, Some(10));
        assert_eq!(update.update_interval_ms, Some(100));
    }

    #[test]
    fn control() {
        let notification = NotificationParser::parse(&envelope(
            "[?occupancy=metrics.publishers]control_pri",
            r#"{"type":"CONTROL","controlType":"STREAMING_PAUSED"}"#,
        ))
        .unwrap();

        assert_eq!(
            notification.kind,
            NotificationKind::Control(Control {
                control_type: ControlType::StreamingPaused
            })
        );

        let unknown = NotificationParser::parse_message(
            "control_pri",
            r#"{"type":"CONTROL","controlType":"STREAMING_SOMETHING"}"#,
        )
        .unwrap();
        assert_eq!(
            unknown,
            NotificationKind::Control(Control {
                control_type: ControlType::Unknown
            })
        );
    }

    #[test]
    fn occupancy() {
        let notification = NotificationParser::parse(&envelope(
            "[?occupancy=metrics.publishers]control_sec",
            r#"{"metrics":{"publishers":0}}"#,
        ))
        .unwrap();

        assert_eq!(
            notification.kind,
            NotificationKind::Occupancy(Occupancy {
                channel: OccupancyChannel::Secondary,
                publishers: 0,
            })
        );
    }

    #[test]
    fn unknown_type() {
        let result = NotificationParser::parse(&envelope(
            "xxxx_xxxx_splits",
            r#"{"type":"RULE_BASED_SEGMENT_UPDATE","changeNumber":1}"#,
        ));

        assert!(matches!(
            result,
            Err(Error::UnknownCode {
                kind: "notification type",
                ..
            })
        ));
    }

    #[test]
    fn malformed_data() {
        let event = RawEvent {
            data: Some("{not json".to_owned()),
            ..RawEvent::default()
        };
        assert!(matches!(NotificationParser::parse(&event), Err(Error::Json(_))));
        assert!(matches!(
            NotificationParser::parse(&RawEvent::default()),
            Err(Error::MissingField("data"))
        ));
    }
}
