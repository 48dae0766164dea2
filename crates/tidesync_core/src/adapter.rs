//! Conversion of client-supplied field values.
//!
//! The store never interprets column values itself. Every value a client
//! hands in goes through a [`FieldAdapter`], which either returns the form
//! to store or the error code to report against the field.

use tidesync_codec::Value;
use tidesync_protocol::{ColumnSchema, ColumnType, ErrorCode};

/// Converts and validates one field value.
pub trait FieldAdapter: Send {
    /// Returns the stored form of `value` for `column`.
    fn convert(&self, column: &ColumnSchema, value: &Value) -> Result<Value, ErrorCode>;
}

/// Default adapter driven by the declared column types.
///
/// - `Null` and empty text are rejected on non-nullable columns with
///   `ERR_FIELD_REQUIRED`, and stored as `Null` otherwise
/// - integer columns accept integers and decimal text
/// - boolean columns accept booleans and the texts `true` / `false`
/// - anything else of the wrong type is `ERR_FIELD_BADFORMAT`
#[derive(Debug, Clone, Copy, Default)]
pub struct TypedAdapter;

impl FieldAdapter for TypedAdapter {
    fn convert(&self, column: &ColumnSchema, value: &Value) -> Result<Value, ErrorCode> {
        let empty = match value {
            Value::Null => true,
            // Empty text is a value only in a nullable text column.
            Value::Text(text) if text.is_empty() => {
                column.ty != ColumnType::Text || !column.nullable
            }
            _ => false,
        };
        if empty {
            return if column.nullable {
                Ok(Value::Null)
            } else {
                Err(ErrorCode::FieldRequired)
            };
        }

        match (column.ty, value) {
            (ColumnType::Integer, Value::Integer(_))
            | (ColumnType::Text, Value::Text(_))
            | (ColumnType::Boolean, Value::Bool(_))
            | (ColumnType::Bytes, Value::Bytes(_)) => Ok(value.clone()),
            (ColumnType::Integer, Value::Text(text)) => text
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| ErrorCode::FieldBadFormat),
            (ColumnType::Boolean, Value::Text(text)) => match text.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(ErrorCode::FieldBadFormat),
            },
            _ => Err(ErrorCode::FieldBadFormat),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_fields() {
        let name = ColumnSchema::new("Name", ColumnType::Text);
        assert_eq!(TypedAdapter.convert(&name, &Value::Null), Err(ErrorCode::FieldRequired));
        assert_eq!(TypedAdapter.convert(&name, &Value::from("")), Err(ErrorCode::FieldRequired));

        let note = ColumnSchema::new("Note", ColumnType::Text).nullable();
        assert_eq!(TypedAdapter.convert(&note, &Value::Null), Ok(Value::Null));
        assert_eq!(TypedAdapter.convert(&note, &Value::from("")), Ok(Value::from("")));
    }

    #[test]
    fn integer_from_text() {
        let age = ColumnSchema::new("Age", ColumnType::Integer);
        assert_eq!(TypedAdapter.convert(&age, &Value::from(" 42 ")), Ok(Value::Integer(42)));
        assert_eq!(
            TypedAdapter.convert(&age, &Value::from("forty")),
            Err(ErrorCode::FieldBadFormat)
        );
        assert_eq!(
            TypedAdapter.convert(&age, &Value::Bool(true)),
            Err(ErrorCode::FieldBadFormat)
        );
    }

    #[test]
    fn booleans() {
        let active = ColumnSchema::new("Active", ColumnType::Boolean).nullable();
        assert_eq!(TypedAdapter.convert(&active, &Value::from("true")), Ok(Value::Bool(true)));
        assert_eq!(TypedAdapter.convert(&active, &Value::from("")), Ok(Value::Null));
    }
}
