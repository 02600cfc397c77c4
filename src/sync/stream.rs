use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use super::push_status::{PushStatus, PushStatusKeeper};
use crate::{
    notification::{EventStreamParser, NotificationDispatcher},
    Error, Result,
};

/// Why the stream connection could not be established.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Server answered with a non-success status.
    #[error("stream handshake failed with http status {status}")]
    Http {
        /// HTTP status code.
        status: u16,
    },
    /// Connection could not be opened.
    #[error("stream connection failed: {0}")]
    Network(String),
    /// Streaming is not enabled for this account.
    #[error("push streaming is disabled")]
    PushDisabled,
}

impl HandshakeError {
    /// Network errors, server errors and throttling can go away by themselves. Other client
    /// errors cannot.
    pub fn is_retryable(&self) -> bool {
        match self {
            HandshakeError::Network(_) => true,
            HandshakeError::Http { status } => *status == 429 || (500..=599).contains(status),
            HandshakeError::PushDisabled => false,
        }
    }
}

/// Blocking source of event-stream blocks.
///
/// Each item produced by the stream is one event block, i.e. the lines between two blank lines.
/// Authentication and TLS are the transport's business.
pub trait StreamTransport: Send + Sync {
    /// Open the stream.
    fn connect(
        &self,
    ) -> std::result::Result<Box<dyn Iterator<Item = String> + Send>, HandshakeError>;

    /// Close the stream, making the iterator returned by `connect` end. Must be callable from any
    /// thread.
    fn disconnect(&self);
}

/// Reads the stream on a dedicated thread and feeds the dispatcher.
pub struct StreamReader {
    join_handle: std::thread::JoinHandle<()>,
    stopped: Arc<AtomicBool>,
    transport: Arc<dyn StreamTransport>,
}

impl StreamReader {
    /// Connect and start reading.
    ///
    /// The outcome is reported through `keeper`: [`PushStatus::SubsystemUp`] once the connection
    /// is confirmed and delivering, [`PushStatus::SubsystemDown`] if it is confirmed while paused
    /// or without publishers, or an error status if the handshake fails or the stream ends
    /// unexpectedly.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the reader thread could not be spawned.
    pub fn start(
        transport: Arc<dyn StreamTransport>,
        dispatcher: Arc<NotificationDispatcher>,
        keeper: Arc<PushStatusKeeper>,
    ) -> std::io::Result<StreamReader> {
        let stopped = Arc::new(AtomicBool::new(false));

        let join_handle = {
            let stopped = Arc::clone(&stopped);
            let transport = Arc::clone(&transport);
            std::thread::Builder::new()
                .name("flagsync-stream".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        read(transport.as_ref(), &dispatcher, &keeper, &stopped)
                    }));

                    if result.is_err() && !stopped.load(Ordering::Acquire) {
                        log::error!(target: "flagsync", "stream reader panicked");
                        keeper.publish(PushStatus::RetryableError);
                    }
                })?
        };

        Ok(StreamReader {
            join_handle,
            stopped,
            transport,
        })
    }

    /// Close the stream. Events still in flight are discarded.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.transport.disconnect();
        }
    }

    /// Close the stream and block waiting for the reader thread to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle.join().map_err(|_| Error::ThreadPanicked)?;
        Ok(())
    }
}

fn read(
    transport: &dyn StreamTransport,
    dispatcher: &NotificationDispatcher,
    keeper: &PushStatusKeeper,
    stopped: &AtomicBool,
) {
    log::debug!(target: "flagsync", "connecting to stream");
    let events = match transport.connect() {
        Ok(events) => events,
        Err(err) => {
            if stopped.load(Ordering::Acquire) {
                return;
            }
            log::warn!(target: "flagsync", "stream handshake failed: {err}");
            keeper.publish(if err.is_retryable() {
                PushStatus::RetryableError
            } else {
                PushStatus::NonRetryableError
            });
            return;
        }
    };

    let mut confirmed = false;
    for block in events {
        if stopped.load(Ordering::Acquire) {
            return;
        }

        let event = EventStreamParser::parse(&block);
        if event.is_keep_alive() {
            continue;
        }
        if !confirmed && event.is_connection_confirmation() {
            confirmed = true;
            log::info!(target: "flagsync", "streaming connection established");
            keeper.publish(
                if keeper.is_streaming_active() && keeper.publishers() > 0 {
                    PushStatus::SubsystemUp
                } else {
                    PushStatus::SubsystemDown
                },
            );
        }
        dispatcher.handle_event(&event);
    }

    if !stopped.load(Ordering::Acquire) {
        log::warn!(target: "flagsync", "stream closed unexpectedly");
        keeper.publish(PushStatus::RetryableError);
    }
}
