use std::sync::Arc;

use crate::sync::HandshakeError;

/// Represents a result type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while synchronizing.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Payload is not valid base64.
    #[error("invalid base64 payload")]
    InvalidEncoding(#[source] base64::DecodeError),

    /// Payload could not be decompressed.
    #[error("failed to decompress payload")]
    Decompression(#[source] Arc<std::io::Error>),

    /// JSON could not be parsed.
    #[error("failed to parse json")]
    Json(#[source] Arc<serde_json::Error>),

    /// Computed bitmap index does not fit into the decoded bitmap.
    #[error("bitmap index {index} is out of range for a {len} byte bitmap")]
    BitmapIndexOutOfRange {
        /// Bit index computed for the key.
        index: u64,
        /// Bitmap length in bytes.
        len: usize,
    },

    /// Server sent a code this version does not know about.
    #[error("unknown {kind} code: {code}")]
    UnknownCode {
        /// What the code describes (compression, hash algorithm, ...).
        kind: &'static str,
        /// Raw value received.
        code: String,
    },

    /// Required field is missing in a notification.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// Push connection handshake failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Durable storage error.
    #[error(transparent)]
    // rusqlite::Error is not clonable, so we're wrapping it in an Arc.
    Storage(Arc<rusqlite::Error>),

    /// A synchronization collaborator failed to fetch or store data.
    #[error("synchronization failed: {reason}")]
    SyncFailed {
        /// Human readable reason.
        reason: String,
        /// Whether retrying the same operation may succeed.
        retryable: bool,
    },

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    ThreadPanicked,

    /// The component has been shut down.
    #[error("shut down")]
    Shutdown,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Error for a collaborator failure that can be retried (e.g., network or 5xx).
    pub fn retryable(reason: impl Into<String>) -> Error {
        Error::SyncFailed {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Error for a collaborator failure that must not be retried (e.g., invalid credentials).
    pub fn non_retryable(reason: impl Into<String>) -> Error {
        Error::SyncFailed {
            reason: reason.into(),
            retryable: false,
        }
    }

    /// Whether the operation that produced this error should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SyncFailed { retryable, .. } => *retryable,
            Error::Handshake(err) => err.is_retryable(),
            Error::Io(_) | Error::Storage(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Arc::new(value))
    }
}

impl From<base64::DecodeError> for Error {
    fn from(value: base64::DecodeError) -> Self {
        Self::InvalidEncoding(value)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(Arc::new(value))
    }
}
