//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding wire values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Floats have no place in tidesync values.
    #[error("float values are not supported")]
    FloatForbidden,

    /// Indefinite-length items are rejected.
    #[error("indefinite-length items are not supported")]
    IndefiniteLength,

    /// A text string was not valid UTF-8.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// Input ended in the middle of an item.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Bytes remained after the top-level item.
    #[error("{remaining} trailing bytes after value")]
    TrailingBytes {
        /// Number of unread bytes.
        remaining: usize,
    },

    /// The bytes decode, but not into the expected shape.
    #[error("invalid structure: {message}")]
    InvalidStructure {
        /// What was wrong.
        message: String,
    },

    /// A declared length is larger than the decoder accepts.
    #[error("declared length {claimed} exceeds limit {limit}")]
    SizeLimitExceeded {
        /// Length found in the input.
        claimed: u64,
        /// Maximum accepted length.
        limit: u64,
    },

    /// A required map field is absent.
    #[error("missing field `{field}`")]
    MissingField {
        /// Field name.
        field: String,
    },

    /// A map field holds a value of the wrong type.
    #[error("field `{field}` has the wrong type, expected {expected}")]
    WrongType {
        /// Field name.
        field: String,
        /// Expected type name.
        expected: &'static str,
    },
}

impl CodecError {
    /// Creates an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates a wrong type error.
    pub fn wrong_type(field: impl Into<String>, expected: &'static str) -> Self {
        Self::WrongType {
            field: field.into(),
            expected,
        }
    }
}
