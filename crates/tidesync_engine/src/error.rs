//! Error types for the sync engine.
//!
//! Client operations report validation and conflict failures as
//! [`ErrorPayload`] data, like the table store does. `SyncError` covers
//! the session: transport failures, refused handshakes, schema changes
//! and misuse of the state machine.

use thiserror::Error;
use tidesync_codec::{CodecError, Value};
use tidesync_core::CoreError;
use tidesync_protocol::{ErrorCode, ErrorPayload};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (unexpected or missing message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The hub refused a session-level call.
    #[error("hub error: {0}")]
    Hub(ErrorPayload),

    /// Table store error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The hub's schema changed in a way buffered mutations cannot survive.
    #[error("schema changed between sessions")]
    SchemaMismatch,

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Not connected.
    #[error("not connected to hub")]
    NotConnected,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an invalid state transition error.
    pub fn invalid_transition(from: impl std::fmt::Debug, to: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from: format!("{from:?}"),
            to: to.into(),
        }
    }

    /// Maps a payload returned by a hub call. Connection failures become
    /// retryable transport errors.
    pub fn from_payload(payload: ErrorPayload) -> Self {
        if payload.has_code(&ErrorCode::Connection) {
            Self::transport_retryable(payload.to_string())
        } else {
            Self::Hub(payload)
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::NotConnected => true,
            _ => false,
        }
    }

    /// The protocol code describing this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::Transport { .. } | SyncError::NotConnected => ErrorCode::Connection,
            SyncError::SchemaMismatch => ErrorCode::UnableSynchronization,
            SyncError::Hub(payload) => payload
                .first_code()
                .cloned()
                .unwrap_or(ErrorCode::ExceptionUnexpected),
            _ => ErrorCode::ExceptionUnexpected,
        }
    }

    /// Converts the error into a payload for listeners and callbacks.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            SyncError::Hub(payload) => payload.clone(),
            other => {
                let mut payload = ErrorPayload::new();
                payload.add_global(other.code(), vec![Value::from(other.to_string())]);
                payload
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("bad handshake").is_retryable());
        assert!(SyncError::NotConnected.is_retryable());
        assert!(!SyncError::SchemaMismatch.is_retryable());
    }

    #[test]
    fn payload_mapping() {
        let lost = SyncError::from_payload(ErrorPayload::global(ErrorCode::Connection));
        assert!(lost.is_retryable());
        assert_eq!(lost.code(), ErrorCode::Connection);

        let refused = SyncError::from_payload(ErrorPayload::global(ErrorCode::RecordDeleted));
        assert_eq!(refused.code(), ErrorCode::RecordDeleted);
        assert!(refused.to_payload().has_code(&ErrorCode::RecordDeleted));

        assert!(SyncError::SchemaMismatch
            .to_payload()
            .has_code(&ErrorCode::UnableSynchronization));
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::NotConnected.to_string(), "not connected to hub");
        let err = SyncError::invalid_transition("Loading", "synchronize");
        assert!(err.to_string().contains("Loading"));
    }
}
