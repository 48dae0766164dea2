//! Error types for the tidesync core.
//!
//! Validation failures of client operations are not errors of this kind:
//! they are returned as [`ErrorPayload`] data so they can be shown next to
//! the offending fields. `CoreError` covers misuse of the API and broken
//! input that no caller can correct.

use thiserror::Error;
use tidesync_protocol::{ErrorCode, ErrorPayload};

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] tidesync_codec::CodecError),

    /// The schema is inconsistent.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the problem.
        message: String,
    },

    /// A table name is not part of the schema.
    #[error("table not found: {name}")]
    TableNotFound {
        /// Name of the table.
        name: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Creates a table-not-found error.
    pub fn table_not_found(name: impl Into<String>) -> Self {
        Self::TableNotFound { name: name.into() }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Converts the error into a payload for callers that expect one.
    pub fn to_payload(&self) -> ErrorPayload {
        let mut payload = ErrorPayload::new();
        payload.add_global(
            ErrorCode::ExceptionUnexpected,
            vec![tidesync_codec::Value::from(self.to_string())],
        );
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_keeps_message() {
        let payload = CoreError::table_not_found("Invoice").to_payload();
        assert!(payload.has_code(&ErrorCode::ExceptionUnexpected));
        assert_eq!(
            payload.globals[0].parameters[0],
            tidesync_codec::Value::from("table not found: Invoice")
        );
    }
}
