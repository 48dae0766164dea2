//! Mutations and single-request messages.

use crate::types::{tick_to_wire, Action, ClientId, Identity, Record, RequestId, Tick};
use tidesync_codec::{CodecResult, Fields, Value, WireDecode, WireEncode};

/// One mutation of one row, with the snapshots needed to verify and undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// A row created by the client.
    Create {
        /// The new row.
        record: Record,
        /// Its identity.
        identity: Identity,
    },
    /// A row modified by the client.
    Update {
        /// Row before the change.
        old: Record,
        /// Row after the change.
        new: Record,
        /// Identity before the change.
        old_identity: Identity,
        /// Identity after the change.
        new_identity: Identity,
    },
    /// A row deleted by the client.
    Delete {
        /// Row before deletion.
        record: Record,
        /// Its identity.
        identity: Identity,
    },
}

impl Change {
    /// The action tag of this change.
    pub fn action(&self) -> Action {
        match self {
            Change::Create { .. } => Action::Create,
            Change::Update { .. } => Action::Update,
            Change::Delete { .. } => Action::Delete,
        }
    }

    /// The record the hub should end up with.
    pub fn record(&self) -> &Record {
        match self {
            Change::Create { record, .. } | Change::Delete { record, .. } => record,
            Change::Update { new, .. } => new,
        }
    }

    /// The current identity of the row.
    pub fn identity(&self) -> &Identity {
        match self {
            Change::Create { identity, .. } | Change::Delete { identity, .. } => identity,
            Change::Update { new_identity, .. } => new_identity,
        }
    }

    /// Client key of the mutated row.
    pub fn client_id(&self) -> ClientId {
        self.identity().client_id
    }

    fn record_value(&self) -> Value {
        match self {
            Change::Create { record, .. } | Change::Delete { record, .. } => record.to_value(),
            Change::Update { old, new, .. } => {
                Value::text_map([("Old", old.to_value()), ("New", new.to_value())])
            }
        }
    }

    fn identity_value(&self) -> Value {
        match self {
            Change::Create { identity, .. } | Change::Delete { identity, .. } => {
                identity.to_value()
            }
            Change::Update {
                old_identity,
                new_identity,
                ..
            } => Value::text_map([
                ("Old", old_identity.to_value()),
                ("New", new_identity.to_value()),
            ]),
        }
    }

    fn from_parts(action: Action, record: &Value, identity: &Value) -> CodecResult<Self> {
        Ok(match action {
            Action::Create => Change::Create {
                record: Record::from_value(record)?,
                identity: Identity::from_value(identity)?,
            },
            Action::Delete => Change::Delete {
                record: Record::from_value(record)?,
                identity: Identity::from_value(identity)?,
            },
            Action::Update => {
                let records = Fields::new(record)?;
                let identities = Fields::new(identity)?;
                Change::Update {
                    old: Record::from_value(records.require("Old")?)?,
                    new: Record::from_value(records.require("New")?)?,
                    old_identity: Identity::from_value(identities.require("Old")?)?,
                    new_identity: Identity::from_value(identities.require("New")?)?,
                }
            }
        })
    }
}

/// A standalone request as sent through `executeRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessage {
    /// Target table name.
    pub table: String,
    /// The mutation.
    pub change: Change,
    /// Tick of the row when the mutation was queued.
    pub tick: Tick,
    /// Correlation id, assigned at commit.
    pub request_id: Option<RequestId>,
}

impl RequestMessage {
    /// Creates a request without a correlation id.
    pub fn new(table: impl Into<String>, change: Change, tick: Tick) -> Self {
        Self {
            table: table.into(),
            change,
            tick,
            request_id: None,
        }
    }

    /// The action of the carried change.
    pub fn action(&self) -> Action {
        self.change.action()
    }
}

impl WireEncode for RequestMessage {
    #[allow(clippy::cast_possible_wrap)]
    fn to_value(&self) -> Value {
        let mut pairs = vec![
            ("table", Value::from(self.table.as_str())),
            ("action", Value::from(self.change.action().as_str())),
            ("record", self.change.record_value()),
            ("identity", self.change.identity_value()),
            ("tick", Value::Integer(tick_to_wire(self.tick))),
        ];
        if let Some(id) = self.request_id {
            pairs.push(("requestId", Value::Integer(id as i64)));
        }
        Value::text_map(pairs)
    }
}

impl WireDecode for RequestMessage {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        let action: Action = fields.text("action")?.parse()?;
        let change = Change::from_parts(action, fields.require("record")?, fields.require("identity")?)?;
        Ok(Self {
            table: fields.text("table")?.to_string(),
            change,
            tick: fields.unsigned("tick")?,
            request_id: fields
                .opt_integer("requestId")?
                .and_then(|n| u64::try_from(n).ok()),
        })
    }
}
