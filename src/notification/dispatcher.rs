use std::sync::Arc;

use tokio::sync::mpsc;

use super::{
    FlagKilled, FlagsChanged, Notification, NotificationKind, NotificationParser, RawEvent,
};
use crate::{
    membership::MembershipRegistry,
    sync::{FlagsSynchronizer, PushStatus, PushStatusKeeper},
    Error,
};

/// Routes notifications to the component responsible for them.
///
/// Runs on the stream reader thread, so it never performs I/O itself: anything needing storage or
/// network is handed over to queues or to the blocking pool.
pub struct NotificationDispatcher {
    runtime: tokio::runtime::Handle,
    flags: Arc<dyn FlagsSynchronizer>,
    flag_updates: mpsc::UnboundedSender<FlagsChanged>,
    registry: Arc<MembershipRegistry>,
    keeper: Arc<PushStatusKeeper>,
}

impl NotificationDispatcher {
    /// Create a dispatcher. Blocking work is spawned on `runtime`.
    pub fn new(
        runtime: tokio::runtime::Handle,
        flags: Arc<dyn FlagsSynchronizer>,
        flag_updates: mpsc::UnboundedSender<FlagsChanged>,
        registry: Arc<MembershipRegistry>,
        keeper: Arc<PushStatusKeeper>,
    ) -> NotificationDispatcher {
        NotificationDispatcher {
            runtime,
            flags,
            flag_updates,
            registry,
            keeper,
        }
    }

    /// Parse and dispatch a raw event. Malformed and unknown notifications are logged and dropped.
    pub fn handle_event(&self, event: &RawEvent) {
        if event.is_keep_alive() || event.data.is_none() {
            return;
        }

        match NotificationParser::parse(event) {
            Ok(notification) => self.dispatch(notification),
            Err(err @ Error::UnknownCode { .. }) => {
                log::warn!(target: "flagsync", "ignoring notification: {err}");
            }
            Err(err) => {
                log::warn!(target: "flagsync", "failed to parse notification {:?}: {err}", event.data);
            }
        }
    }

    /// Route an already parsed notification.
    pub fn dispatch(&self, notification: Notification) {
        match notification.kind {
            NotificationKind::Control(control) => {
                self.keeper
                    .handle_control(notification.timestamp, control.control_type);
            }
            NotificationKind::Occupancy(occupancy) => {
                self.keeper.handle_occupancy(
                    occupancy.channel,
                    notification.timestamp,
                    occupancy.publishers,
                );
            }
            NotificationKind::Error(error) => {
                log::warn!(target: "flagsync", "streaming error received: {} ({})", error.message, error.code);
                if error.should_be_ignored() {
                    return;
                }
                self.keeper.publish(if error.is_retryable() {
                    PushStatus::RetryableError
                } else {
                    PushStatus::NonRetryableError
                });
            }
            _ if !self.keeper.is_streaming_active() => {
                log::debug!(target: "flagsync", "streaming is paused, dropping notification");
            }
            NotificationKind::FlagsChanged(change) => self.queue_flag_update(change),
            NotificationKind::FlagKilled(kill) => self.kill_flag(kill),
            NotificationKind::Membership(update) => {
                let queued = self.registry.dispatch(&notification.channel, &update);
                log::debug!(target: "flagsync", "membership update queued for {queued} keys");
            }
        }
    }

    fn queue_flag_update(&self, change: FlagsChanged) {
        if self.flag_updates.send(change).is_err() {
            log::debug!(target: "flagsync", "flag updates worker is stopped");
        }
    }

    /// Apply the kill locally right away and confirm it with a regular update.
    fn kill_flag(&self, kill: FlagKilled) {
        let flags = Arc::clone(&self.flags);
        let change_number = kill.change_number;
        self.runtime.spawn_blocking(move || {
            if let Err(err) =
                flags.kill_flag(&kill.flag_name, &kill.default_treatment, kill.change_number)
            {
                log::warn!(target: "flagsync", "failed to kill flag {}: {err}", kill.flag_name);
            }
        });
        self.queue_flag_update(FlagsChanged::new(change_number));
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        codec::channel_key_hash,
        membership::tests::{Call, RecordingSynchronizer},
        notification::EventStreamParser,
        sync::flags::tests::{FlagCall, RecordingFlags},
    };

    struct Fixture {
        dispatcher: NotificationDispatcher,
        flag_updates: mpsc::UnboundedReceiver<FlagsChanged>,
        statuses: mpsc::UnboundedReceiver<PushStatus>,
        registry: Arc<MembershipRegistry>,
        flags: Arc<RecordingFlags>,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let runtime = tokio::runtime::Handle::current();
        let (flag_sender, flag_updates) = mpsc::unbounded_channel();
        let (status_sender, statuses) = mpsc::unbounded_channel();
        let registry = Arc::new(MembershipRegistry::new(
            runtime.clone(),
            Duration::from_secs(60),
        ));
        let flags = Arc::new(RecordingFlags::new(0));
        Fixture {
            dispatcher: NotificationDispatcher::new(
                runtime,
                flags.clone(),
                flag_sender,
                registry.clone(),
                Arc::new(PushStatusKeeper::new(status_sender)),
            ),
            flag_updates,
            statuses,
            registry,
            flags,
        }
    }

    fn message(channel: &str, timestamp: i64, data: &str) -> RawEvent {
        let envelope = serde_json::json!({
            "id": "1",
            "timestamp": timestamp,
            "channel": channel,
            "data": data,
        });
        EventStreamParser::parse(&format!("event: message\ndata: {envelope}\n"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flag_update_is_queued() {
        let mut fixture = fixture();

        fixture.dispatcher.handle_event(&message(
            "x_splits",
            1,
            r#"{"type":"SPLIT_UPDATE","changeNumber":5}"#,
        ));

        assert_eq!(fixture.flag_updates.try_recv(), Ok(FlagsChanged::new(5)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flag_kill_is_applied_and_queued() {
        let mut fixture = fixture();

        fixture.dispatcher.handle_event(&message(
            "x_splits",
            1,
            r#"{"type":"SPLIT_KILL","changeNumber":9,"splitName":"f","defaultTreatment":"off"}"#,
        ));

        assert_eq!(fixture.flag_updates.try_recv(), Ok(FlagsChanged::new(9)));
        let call = fixture.flags.next_call().await;
        assert_eq!(call, FlagCall::Kill("f".to_owned(), "off".to_owned(), 9));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn paused_streaming_drops_data_notifications() {
        let mut fixture = fixture();

        fixture.dispatcher.handle_event(&message(
            "control_pri",
            1,
            r#"{"type":"CONTROL","controlType":"STREAMING_PAUSED"}"#,
        ));
        assert_eq!(fixture.statuses.try_recv(), Ok(PushStatus::SubsystemDown));

        fixture.dispatcher.handle_event(&message(
            "x_splits",
            2,
            r#"{"type":"SPLIT_UPDATE","changeNumber":5}"#,
        ));
        assert!(fixture.flag_updates.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streaming_errors_are_classified() {
        let mut fixture = fixture();

        for (code, expected) in [
            (40142, Some(PushStatus::RetryableError)),
            (40300, Some(PushStatus::NonRetryableError)),
            (50000, None),
        ] {
            let event = EventStreamParser::parse(&format!(
                "event: error\ndata: {{\"message\":\"m\",\"code\":{code},\"statusCode\":401}}\n"
            ));
            fixture.dispatcher.handle_event(&event);
            assert_eq!(fixture.statuses.try_recv().ok(), expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn membership_update_reaches_registered_key() {
        let fixture = fixture();
        let (synchronizer, mut calls) = RecordingSynchronizer::new();
        fixture.registry.register("user1", Arc::new(synchronizer));

        let channel = format!("org_env_{}_mySegments", channel_key_hash("user1"));
        fixture.dispatcher.handle_event(&message(
            &channel,
            1,
            r#"{"type":"MEMBERSHIPS_MS_UPDATE","cn":100,"u":0,"i":10}"#,
        ));

        let call = tokio::time::timeout(Duration::from_secs(5), calls.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(call, Call::Refresh(key, item) if key == "user1" && item.target_regular_change_number == Some(100)));

        // Unregistered key: nothing to do.
        let channel = format!("org_env_{}_mySegments", channel_key_hash("user2"));
        fixture.dispatcher.handle_event(&message(
            &channel,
            2,
            r#"{"type":"MEMBERSHIPS_MS_UPDATE","cn":101,"u":0,"i":10}"#,
        ));
        fixture.registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_and_malformed_notifications_are_dropped() {
        let mut fixture = fixture();

        fixture.dispatcher.handle_event(&message("x", 1, r#"{"type":"SOMETHING_NEW"}"#));
        fixture.dispatcher.handle_event(&message("x", 2, "{broken"));
        fixture.dispatcher.handle_event(&EventStreamParser::parse(":keepalive"));

        assert!(fixture.flag_updates.try_recv().is_err());
        assert!(fixture.statuses.try_recv().is_err());
    }
}
