//! Error codes and the error payload exchanged with clients and the hub.

use std::collections::BTreeMap;
use std::fmt;
use tidesync_codec::{CodecError, CodecResult, Fields, Value, WireDecode, WireEncode};

/// Error codes understood by every tidesync participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A field value could not be converted or references a missing row.
    FieldBadFormat,
    /// A required field is empty.
    FieldRequired,
    /// A unique constraint would be violated.
    FieldUnique,
    /// The caller's snapshot of the row is stale.
    RecordDifferent,
    /// The row has been deleted.
    RecordDeleted,
    /// The offline request buffer is full.
    OutOfMemory,
    /// The connection to the hub failed.
    Connection,
    /// The local state could not be replayed onto a new session.
    UnableSynchronization,
    /// Catch-all for failures nobody anticipated.
    ExceptionUnexpected,
    /// A code declared by a schema constraint.
    Custom(String),
}

impl ErrorCode {
    /// Wire name of the code.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::FieldBadFormat => "ERR_FIELD_BADFORMAT",
            ErrorCode::FieldRequired => "ERR_FIELD_REQUIRED",
            ErrorCode::FieldUnique => "ERR_FIELD_UNIQUE",
            ErrorCode::RecordDifferent => "ERR_RECORD_DIFFERENT",
            ErrorCode::RecordDeleted => "ERR_RECORD_DELETED",
            ErrorCode::OutOfMemory => "ERR_OUT_OF_MEMORY",
            ErrorCode::Connection => "ERR_CONNECTION",
            ErrorCode::UnableSynchronization => "ERR_UNABLE_SYNCHRONIZATION",
            ErrorCode::ExceptionUnexpected => "ERR_EXCEPTION_UNEXPECTED",
            ErrorCode::Custom(code) => code,
        }
    }

    /// Parses a wire name; unknown names become [`ErrorCode::Custom`].
    pub fn parse(code: &str) -> Self {
        match code {
            "ERR_FIELD_BADFORMAT" => ErrorCode::FieldBadFormat,
            "ERR_FIELD_REQUIRED" => ErrorCode::FieldRequired,
            "ERR_FIELD_UNIQUE" => ErrorCode::FieldUnique,
            "ERR_RECORD_DIFFERENT" => ErrorCode::RecordDifferent,
            "ERR_RECORD_DELETED" => ErrorCode::RecordDeleted,
            "ERR_OUT_OF_MEMORY" => ErrorCode::OutOfMemory,
            "ERR_CONNECTION" => ErrorCode::Connection,
            "ERR_UNABLE_SYNCHRONIZATION" => ErrorCode::UnableSynchronization,
            "ERR_EXCEPTION_UNEXPECTED" => ErrorCode::ExceptionUnexpected,
            other => ErrorCode::Custom(other.to_string()),
        }
    }

    /// Returns true for codes that end the current session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCode::Connection | ErrorCode::UnableSynchronization
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One error with its message parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// The error code, sent as `Message`.
    pub code: ErrorCode,
    /// Values substituted into the translated message.
    pub parameters: Vec<Value>,
}

impl ErrorMessage {
    /// Creates a message without parameters.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            parameters: Vec::new(),
        }
    }

    /// Creates a message with parameters.
    pub fn with_parameters(code: ErrorCode, parameters: Vec<Value>) -> Self {
        Self { code, parameters }
    }
}

impl WireEncode for ErrorMessage {
    fn to_value(&self) -> Value {
        Value::text_map([
            ("Message", Value::from(self.code.as_str())),
            ("Parameters", Value::Array(self.parameters.clone())),
        ])
    }
}

impl WireDecode for ErrorMessage {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        Ok(Self {
            code: ErrorCode::parse(fields.text("Message")?),
            parameters: match fields.get("Parameters") {
                None | Some(Value::Null) => Vec::new(),
                Some(_) => fields.array("Parameters")?.to_vec(),
            },
        })
    }
}

/// Errors attached to fields and errors about the request as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Errors per field name.
    pub fields: BTreeMap<String, Vec<ErrorMessage>>,
    /// Errors not tied to a field.
    pub globals: Vec<ErrorMessage>,
}

impl ErrorPayload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a payload holding one global error.
    pub fn global(code: ErrorCode) -> Self {
        let mut payload = Self::new();
        payload.add_global(code, Vec::new());
        payload
    }

    /// Creates a payload holding one field error.
    pub fn field(name: impl Into<String>, code: ErrorCode) -> Self {
        let mut payload = Self::new();
        payload.add_field(name, code, Vec::new());
        payload
    }

    /// Adds an error on a field.
    pub fn add_field(&mut self, name: impl Into<String>, code: ErrorCode, parameters: Vec<Value>) {
        self.fields
            .entry(name.into())
            .or_default()
            .push(ErrorMessage::with_parameters(code, parameters));
    }

    /// Adds a request-level error.
    pub fn add_global(&mut self, code: ErrorCode, parameters: Vec<Value>) {
        self.globals
            .push(ErrorMessage::with_parameters(code, parameters));
    }

    /// Moves every error of `other` into this payload.
    pub fn merge(&mut self, other: ErrorPayload) {
        for (name, messages) in other.fields {
            self.fields.entry(name).or_default().extend(messages);
        }
        self.globals.extend(other.globals);
    }

    /// Returns true when no error was recorded.
    pub fn is_empty(&self) -> bool {
        self.globals.is_empty() && self.fields.values().all(Vec::is_empty)
    }

    /// Returns true if any field or global error carries `code`.
    pub fn has_code(&self, code: &ErrorCode) -> bool {
        self.globals.iter().any(|m| &m.code == code)
            || self
                .fields
                .values()
                .flatten()
                .any(|m| &m.code == code)
    }

    /// Codes recorded for one field.
    pub fn field_codes(&self, name: &str) -> Vec<&ErrorCode> {
        self.fields
            .get(name)
            .map(|messages| messages.iter().map(|m| &m.code).collect())
            .unwrap_or_default()
    }

    /// The first code recorded, globals first.
    pub fn first_code(&self) -> Option<&ErrorCode> {
        self.globals
            .first()
            .or_else(|| self.fields.values().flatten().next())
            .map(|m| &m.code)
    }

    fn summary(&self) -> String {
        let mut parts: Vec<String> = self.globals.iter().map(|m| m.code.to_string()).collect();
        for (name, messages) in &self.fields {
            for m in messages {
                parts.push(format!("{name}: {}", m.code));
            }
        }
        if parts.is_empty() {
            "no errors".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

impl std::error::Error for ErrorPayload {}

impl From<ErrorCode> for ErrorPayload {
    fn from(code: ErrorCode) -> Self {
        ErrorPayload::global(code)
    }
}

impl WireEncode for ErrorPayload {
    fn to_value(&self) -> Value {
        let fields = self
            .fields
            .iter()
            .map(|(name, messages)| {
                (
                    Value::from(name.as_str()),
                    Value::Array(messages.iter().map(WireEncode::to_value).collect()),
                )
            })
            .collect();
        Value::text_map([
            ("Fields", Value::map(fields)),
            (
                "Globals",
                Value::Array(self.globals.iter().map(WireEncode::to_value).collect()),
            ),
        ])
    }
}

impl WireDecode for ErrorPayload {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let outer = Fields::new(value)?;
        let mut payload = ErrorPayload::new();
        if let Some(fields) = outer.get("Fields").filter(|v| !v.is_null()) {
            for (name, messages) in Fields::new(fields)?.entries() {
                let messages = messages
                    .as_array()
                    .ok_or_else(|| CodecError::wrong_type(name, "array"))?
                    .iter()
                    .map(ErrorMessage::from_value)
                    .collect::<CodecResult<Vec<_>>>()?;
                payload.fields.insert(name.to_string(), messages);
            }
        }
        if outer.get("Globals").is_some_and(|v| !v.is_null()) {
            payload.globals = outer
                .array("Globals")?
                .iter()
                .map(ErrorMessage::from_value)
                .collect::<CodecResult<Vec<_>>>()?;
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_parse_back() {
        for code in [
            ErrorCode::FieldBadFormat,
            ErrorCode::RecordDifferent,
            ErrorCode::OutOfMemory,
            ErrorCode::UnableSynchronization,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), code);
        }
        assert_eq!(
            ErrorCode::parse("ERR_CONTACT_EMAIL_TAKEN"),
            ErrorCode::Custom("ERR_CONTACT_EMAIL_TAKEN".into())
        );
    }

    #[test]
    fn session_fatal_codes() {
        assert!(ErrorCode::Connection.is_session_fatal());
        assert!(ErrorCode::UnableSynchronization.is_session_fatal());
        assert!(!ErrorCode::RecordDifferent.is_session_fatal());
    }

    #[test]
    fn payload_collects_and_reports() {
        let mut errors = ErrorPayload::new();
        assert!(errors.is_empty());
        errors.add_field("Email", ErrorCode::FieldUnique, vec![Value::from("a@b.c")]);
        errors.add_global(ErrorCode::OutOfMemory, Vec::new());

        assert!(!errors.is_empty());
        assert!(errors.has_code(&ErrorCode::FieldUnique));
        assert_eq!(errors.field_codes("Email"), vec![&ErrorCode::FieldUnique]);
        assert_eq!(errors.first_code(), Some(&ErrorCode::OutOfMemory));
        assert_eq!(errors.to_string(), "ERR_OUT_OF_MEMORY, Email: ERR_FIELD_UNIQUE");
    }

    #[test]
    fn payload_wire_shape() {
        let errors = ErrorPayload::field("Name", ErrorCode::FieldRequired);
        let value = errors.to_value();
        let name = value.get("Fields").unwrap().get("Name").unwrap();
        assert_eq!(
            name.as_array().unwrap()[0].get("Message"),
            Some(&Value::from("ERR_FIELD_REQUIRED"))
        );
        assert_eq!(ErrorPayload::decode(&errors.encode()).unwrap(), errors);
    }

    #[test]
    fn merge_keeps_both_sides() {
        let mut a = ErrorPayload::field("Name", ErrorCode::FieldRequired);
        a.merge(ErrorPayload::field("Name", ErrorCode::FieldBadFormat));
        assert_eq!(a.field_codes("Name").len(), 2);
    }
}
