//! Identifiers, records and identities.

use std::fmt;
use std::str::FromStr;
use tidesync_codec::{CodecError, CodecResult, Fields, Value, WireDecode, WireEncode};

/// Primary key assigned by the hub.
pub type ServerId = i64;

/// Key assigned by the local client, unique per table for a session.
pub type ClientId = u64;

/// Per-row revision counter assigned by the hub.
pub type Tick = u64;

/// Correlation id of a request or transaction sent to the hub.
pub type RequestId = u64;

/// Wire sentinel for a server id that is not known yet.
pub const UNKNOWN_SERVER_ID: i64 = -1;

/// Kind of mutation carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// A new row.
    Create,
    /// A change to an existing row.
    Update,
    /// A soft delete.
    Delete,
}

impl Action {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "Create",
            Action::Update => "Update",
            Action::Delete => "Delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Create" => Ok(Action::Create),
            "Update" => Ok(Action::Update),
            "Delete" => Ok(Action::Delete),
            other => Err(CodecError::invalid_structure(format!("unknown action `{other}`"))),
        }
    }
}

/// A row in server-id space.
///
/// Foreign-key columns hold the referenced row's server id, or `Null`
/// when it is not known yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Server primary key, `None` until the hub acknowledges the row.
    pub id: Option<ServerId>,
    /// Column values in schema order.
    pub values: Vec<Value>,
    /// Revision counter.
    pub tick: Tick,
    /// Soft-delete flag.
    pub deleted: bool,
}

impl Record {
    /// Creates a live record.
    pub fn new(id: Option<ServerId>, values: Vec<Value>, tick: Tick) -> Self {
        Self {
            id,
            values,
            tick,
            deleted: false,
        }
    }

    /// Returns the same record flagged as deleted.
    pub fn into_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }
}

impl WireEncode for Record {
    fn to_value(&self) -> Value {
        Value::text_map([
            ("id", Value::Integer(self.id.unwrap_or(UNKNOWN_SERVER_ID))),
            ("values", Value::Array(self.values.clone())),
            ("tick", Value::from(tick_to_wire(self.tick))),
            ("deleted", Value::Bool(self.deleted)),
        ])
    }
}

impl WireDecode for Record {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        Ok(Self {
            id: server_id_from_wire(fields.integer("id")?),
            values: fields.array("values")?.to_vec(),
            tick: fields.unsigned("tick")?,
            deleted: fields.boolean("deleted")?,
        })
    }
}

/// Client-side identity of a row.
///
/// `foreign` mirrors, in client-id space, each foreign-key column of the
/// row's table, in the order the columns are declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Position of the row in its table's storage.
    pub row_index: usize,
    /// Client key of the row.
    pub client_id: ClientId,
    /// Client keys of the referenced rows, one per foreign-key column.
    pub foreign: Vec<Option<ClientId>>,
}

impl Identity {
    /// Creates an identity.
    pub fn new(row_index: usize, client_id: ClientId, foreign: Vec<Option<ClientId>>) -> Self {
        Self {
            row_index,
            client_id,
            foreign,
        }
    }
}

impl WireEncode for Identity {
    fn to_value(&self) -> Value {
        Value::text_map([
            ("rowIndex", Value::Integer(self.row_index as i64)),
            ("clientKeyId", Value::Integer(self.client_id as i64)),
            (
                "foreign",
                Value::Array(self.foreign.iter().map(|f| client_id_to_wire(*f)).collect()),
            ),
        ])
    }
}

impl WireDecode for Identity {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        let foreign = fields
            .array("foreign")?
            .iter()
            .map(|v| client_id_from_wire("foreign", v))
            .collect::<CodecResult<Vec<_>>>()?;
        Ok(Self {
            row_index: usize::try_from(fields.unsigned("rowIndex")?)
                .map_err(|_| CodecError::wrong_type("rowIndex", "index"))?,
            client_id: fields.unsigned("clientKeyId")?,
            foreign,
        })
    }
}

/// Maps the wire sentinel to `None`.
pub fn server_id_from_wire(id: i64) -> Option<ServerId> {
    (id != UNKNOWN_SERVER_ID).then_some(id)
}

#[allow(clippy::cast_possible_wrap)]
pub(crate) fn tick_to_wire(tick: Tick) -> i64 {
    tick as i64
}

#[allow(clippy::cast_possible_wrap)]
pub(crate) fn client_id_to_wire(id: Option<ClientId>) -> Value {
    id.map_or(Value::Null, |id| Value::Integer(id as i64))
}

pub(crate) fn client_id_from_wire(field: &str, value: &Value) -> CodecResult<Option<ClientId>> {
    match value {
        Value::Null => Ok(None),
        Value::Integer(n) => u64::try_from(*n)
            .map(Some)
            .map_err(|_| CodecError::wrong_type(field, "client id")),
        _ => Err(CodecError::wrong_type(field, "client id")),
    }
}
