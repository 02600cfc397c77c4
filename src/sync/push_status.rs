use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::notification::{ControlType, OccupancyChannel};

/// Events reported by the push subsystem to [`SyncManager`](crate::sync::SyncManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// Streaming works and notifications are being delivered.
    SubsystemUp,
    /// Connection is open but nothing is being published. Polling should take over.
    SubsystemDown,
    /// Streaming was disabled by the server for the rest of the session.
    Disabled,
    /// The server asked the client to reconnect.
    Reset,
    /// Connection failed or dropped in a way that reconnecting may fix.
    RetryableError,
    /// Connection failed in a way that reconnecting cannot fix.
    NonRetryableError,
}

#[derive(Debug, Clone, Copy)]
struct Publishers {
    count: u32,
    last_timestamp: i64,
}

struct KeeperState {
    primary: Publishers,
    secondary: Publishers,
    last_control_timestamp: i64,
    streaming_active: bool,
}

impl KeeperState {
    fn initial() -> KeeperState {
        KeeperState {
            primary: Publishers {
                count: 1,
                last_timestamp: 0,
            },
            secondary: Publishers {
                count: 0,
                last_timestamp: 0,
            },
            last_control_timestamp: 0,
            streaming_active: true,
        }
    }

    fn publishers(&self) -> u32 {
        self.primary.count + self.secondary.count
    }

    fn channel(&mut self, channel: OccupancyChannel) -> &mut Publishers {
        match channel {
            OccupancyChannel::Primary => &mut self.primary,
            OccupancyChannel::Secondary => &mut self.secondary,
        }
    }
}

/// Tracks control and occupancy messages and turns them into [`PushStatus`] events.
///
/// Messages older than the last one seen on the same channel are ignored, so reordered delivery
/// cannot bring back a stale state.
pub struct PushStatusKeeper {
    state: Mutex<KeeperState>,
    sender: mpsc::UnboundedSender<PushStatus>,
}

impl PushStatusKeeper {
    /// Create a keeper publishing to `sender`.
    ///
    /// The primary control channel is assumed to have one publisher until told otherwise.
    pub fn new(sender: mpsc::UnboundedSender<PushStatus>) -> PushStatusKeeper {
        PushStatusKeeper {
            state: Mutex::new(KeeperState::initial()),
            sender,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, KeeperState> {
        self.state
            .lock()
            .expect("thread holding push status lock should not panic")
    }

    /// Publish `status`. Ignored if nobody is listening anymore.
    pub fn publish(&self, status: PushStatus) {
        log::debug!(target: "flagsync", "push status: {status:?}");
        if self.sender.send(status).is_err() {
            log::debug!(target: "flagsync", "push status receiver is gone");
        }
    }

    /// Whether data notifications should be processed.
    pub fn is_streaming_active(&self) -> bool {
        self.state().streaming_active
    }

    /// Total publishers over both control channels.
    pub fn publishers(&self) -> u32 {
        self.state().publishers()
    }

    /// Forget everything learned from the previous connection. Called before a new one opens.
    pub fn reset(&self) {
        *self.state() = KeeperState::initial();
    }

    /// Apply a control message received at `timestamp`.
    pub fn handle_control(&self, timestamp: i64, control_type: ControlType) {
        let status = {
            let mut state = self.state();
            if state.last_control_timestamp >= timestamp {
                return;
            }
            state.last_control_timestamp = timestamp;

            match control_type {
                ControlType::StreamingPaused => {
                    state.streaming_active = false;
                    Some(PushStatus::SubsystemDown)
                }
                ControlType::StreamingDisabled => {
                    state.streaming_active = false;
                    Some(PushStatus::Disabled)
                }
                ControlType::StreamingEnabled | ControlType::StreamingResumed => {
                    state.streaming_active = true;
                    (state.publishers() > 0).then_some(PushStatus::SubsystemUp)
                }
                ControlType::StreamingReset => Some(PushStatus::Reset),
                ControlType::Unknown => {
                    log::warn!(target: "flagsync", "unknown control message received");
                    None
                }
            }
        };

        if let Some(status) = status {
            self.publish(status);
        }
    }

    /// Apply the publisher count of `channel` received at `timestamp`.
    pub fn handle_occupancy(&self, channel: OccupancyChannel, timestamp: i64, publishers: u32) {
        let status = {
            let mut state = self.state();
            let previous = state.publishers();
            {
                let entry = state.channel(channel);
                if entry.last_timestamp >= timestamp {
                    return;
                }
                entry.count = publishers;
                entry.last_timestamp = timestamp;
            }
            let current = state.publishers();

            if current == 0 && previous > 0 {
                Some(PushStatus::SubsystemDown)
            } else if current > 0 && previous == 0 && state.streaming_active {
                Some(PushStatus::SubsystemUp)
            } else {
                None
            }
        };

        if let Some(status) = status {
            self.publish(status);
        }
    }
}
