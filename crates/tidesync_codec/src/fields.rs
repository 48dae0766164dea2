//! Typed access to the fields of a decoded map.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Borrowing reader over a map value with text keys.
///
/// ```
/// use tidesync_codec::{Fields, Value};
///
/// let v = Value::text_map([("table", Value::from("Contact")), ("tick", Value::from(3))]);
/// let fields = Fields::new(&v).unwrap();
/// assert_eq!(fields.text("table").unwrap(), "Contact");
/// assert_eq!(fields.integer("tick").unwrap(), 3);
/// assert_eq!(fields.opt_integer("requestId").unwrap(), None);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Fields<'a> {
    pairs: &'a [(Value, Value)],
}

impl<'a> Fields<'a> {
    /// Wraps a map value.
    ///
    /// # Errors
    ///
    /// Fails when `value` is not a map.
    pub fn new(value: &'a Value) -> CodecResult<Self> {
        value
            .as_map()
            .map(|pairs| Self { pairs })
            .ok_or_else(|| CodecError::invalid_structure(format!("expected map, got {}", value.type_name())))
    }

    /// Returns the raw field value, if present.
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.pairs
            .iter()
            .find(|(k, _)| k.as_text() == Some(name))
            .map(|(_, v)| v)
    }

    /// Returns a required field.
    pub fn require(&self, name: &str) -> CodecResult<&'a Value> {
        self.get(name).ok_or_else(|| CodecError::missing_field(name))
    }

    /// Returns a required integer field.
    pub fn integer(&self, name: &str) -> CodecResult<i64> {
        self.require(name)?
            .as_integer()
            .ok_or_else(|| CodecError::wrong_type(name, "integer"))
    }

    /// Returns an optional integer field; `null` counts as absent.
    pub fn opt_integer(&self, name: &str) -> CodecResult<Option<i64>> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_integer()
                .map(Some)
                .ok_or_else(|| CodecError::wrong_type(name, "integer")),
        }
    }

    /// Returns a required unsigned integer field.
    pub fn unsigned(&self, name: &str) -> CodecResult<u64> {
        let n = self.integer(name)?;
        u64::try_from(n).map_err(|_| CodecError::wrong_type(name, "unsigned integer"))
    }

    /// Returns a required text field.
    pub fn text(&self, name: &str) -> CodecResult<&'a str> {
        self.require(name)?
            .as_text()
            .ok_or_else(|| CodecError::wrong_type(name, "text"))
    }

    /// Returns an optional text field; `null` counts as absent.
    pub fn opt_text(&self, name: &str) -> CodecResult<Option<&'a str>> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_text()
                .map(Some)
                .ok_or_else(|| CodecError::wrong_type(name, "text")),
        }
    }

    /// Returns a required boolean field.
    pub fn boolean(&self, name: &str) -> CodecResult<bool> {
        self.require(name)?
            .as_bool()
            .ok_or_else(|| CodecError::wrong_type(name, "bool"))
    }

    /// Returns a required array field.
    pub fn array(&self, name: &str) -> CodecResult<&'a [Value]> {
        self.require(name)?
            .as_array()
            .ok_or_else(|| CodecError::wrong_type(name, "array"))
    }

    /// Returns a required nested map field.
    pub fn map(&self, name: &str) -> CodecResult<Fields<'a>> {
        let v = self.require(name)?;
        v.as_map()
            .map(|pairs| Fields { pairs })
            .ok_or_else(|| CodecError::wrong_type(name, "map"))
    }

    /// Iterates over the text-keyed entries.
    pub fn entries(&self) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
        self.pairs
            .iter()
            .filter_map(|(k, v)| k.as_text().map(|k| (k, v)))
    }
}
