//! Messages exchanged with the hub.
//!
//! ```text
//! Client                                Hub
//!   |------ initialize(area, module) ----->|
//!   |<----- InitializeResponse ------------|  schema, last sequence id, replies
//!   |------ load_table(name) ------------->|
//!   |<----- TableSnapshot -----------------|
//!   |------ RequestMessage --------------->|
//!   |------ TransactionMessage ----------->|
//!   |<----- HubEvent::Reply ---------------|  one per request id
//!   |<----- HubEvent::Notification --------|  changes made by other sessions
//! ```

use crate::change::RequestMessage;
use crate::error::ErrorPayload;
use crate::lot::CompressedRequest;
use crate::schema::Schema;
use crate::types::{Identity, Record, RequestId};
use tidesync_codec::{CodecError, CodecResult, Fields, Value, WireDecode, WireEncode};
use uuid::Uuid;

#[allow(clippy::cast_possible_wrap)]
fn request_id_to_wire(id: RequestId) -> Value {
    Value::Integer(id as i64)
}

fn decode_list<T: WireDecode>(values: &[Value]) -> CodecResult<Vec<T>> {
    values.iter().map(T::from_value).collect()
}

fn encode_list<T: WireEncode>(items: &[T]) -> Value {
    Value::Array(items.iter().map(WireEncode::to_value).collect())
}

/// A committed transaction, compressed into lots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMessage {
    /// Correlation id shared by every request of the transaction.
    pub request_id: RequestId,
    /// Label shown to the other sessions in notifications.
    pub label: Option<String>,
    /// Compressed requests.
    pub requests: Vec<CompressedRequest>,
    /// Whether other sessions should be notified.
    pub notify: bool,
}

impl WireEncode for TransactionMessage {
    fn to_value(&self) -> Value {
        Value::text_map([
            ("requestId", request_id_to_wire(self.request_id)),
            ("label", Value::from(self.label.clone())),
            ("transaction", encode_list(&self.requests)),
            ("notify", Value::Bool(self.notify)),
        ])
    }
}

impl WireDecode for TransactionMessage {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        Ok(Self {
            request_id: fields.unsigned("requestId")?,
            label: fields.opt_text("label")?.map(str::to_string),
            requests: decode_list(fields.array("transaction")?)?,
            notify: fields.boolean("notify")?,
        })
    }
}

/// Either a single request or a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// A standalone request; its `request_id` is always set.
    Request(RequestMessage),
    /// A transaction.
    Transaction(TransactionMessage),
}

impl Outgoing {
    /// Correlation id of the message.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Outgoing::Request(request) => request.request_id,
            Outgoing::Transaction(transaction) => Some(transaction.request_id),
        }
    }
}

/// A record as known to the hub, with the client identity it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    /// Table name.
    pub table: String,
    /// Authoritative record.
    pub record: Record,
    /// Identity of the client row this record confirms, when it answers a
    /// request of the receiving session.
    pub identity: Option<Identity>,
}

impl ServerRecord {
    /// A record without identity, as pushed in notifications and loads.
    pub fn new(table: impl Into<String>, record: Record) -> Self {
        Self {
            table: table.into(),
            record,
            identity: None,
        }
    }
}

impl WireEncode for ServerRecord {
    fn to_value(&self) -> Value {
        Value::text_map([
            ("table", Value::from(self.table.as_str())),
            ("record", self.record.to_value()),
            (
                "identity",
                self.identity.as_ref().map_or(Value::Null, WireEncode::to_value),
            ),
        ])
    }
}

impl WireDecode for ServerRecord {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        Ok(Self {
            table: fields.text("table")?.to_string(),
            record: Record::from_value(fields.require("record")?)?,
            identity: match fields.get("identity") {
                None | Some(Value::Null) => None,
                Some(identity) => Some(Identity::from_value(identity)?),
            },
        })
    }
}

/// The hub's answer to one request or transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Correlation id of the answered message.
    pub request_id: RequestId,
    /// Confirmed records, or the reason the whole message was refused.
    pub outcome: Result<Vec<ServerRecord>, ErrorPayload>,
}

impl Reply {
    /// A successful reply.
    pub fn success(request_id: RequestId, records: Vec<ServerRecord>) -> Self {
        Self {
            request_id,
            outcome: Ok(records),
        }
    }

    /// A failed reply.
    pub fn failure(request_id: RequestId, errors: ErrorPayload) -> Self {
        Self {
            request_id,
            outcome: Err(errors),
        }
    }

    /// Returns true for a successful reply.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

impl WireEncode for Reply {
    fn to_value(&self) -> Value {
        let (records, error) = match &self.outcome {
            Ok(records) => (encode_list(records), Value::Null),
            Err(errors) => (Value::Null, errors.to_value()),
        };
        Value::text_map([
            ("requestId", request_id_to_wire(self.request_id)),
            ("records", records),
            ("error", error),
        ])
    }
}

impl WireDecode for Reply {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        let outcome = match fields.get("error") {
            None | Some(Value::Null) => Ok(decode_list(fields.array("records")?)?),
            Some(error) => Err(ErrorPayload::from_value(error)?),
        };
        Ok(Self {
            request_id: fields.unsigned("requestId")?,
            outcome,
        })
    }
}

/// Changes made by another session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Label of the originating transaction.
    pub label: Option<String>,
    /// Changed records.
    pub records: Vec<ServerRecord>,
}

impl WireEncode for Notification {
    fn to_value(&self) -> Value {
        Value::text_map([
            ("label", Value::from(self.label.clone())),
            ("records", encode_list(&self.records)),
        ])
    }
}

impl WireDecode for Notification {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        Ok(Self {
            label: fields.opt_text("label")?.map(str::to_string),
            records: decode_list(fields.array("records")?)?,
        })
    }
}

/// Asynchronous message from the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// Answer to one of our messages.
    Reply(Reply),
    /// Changes made elsewhere.
    Notification(Notification),
}

impl WireEncode for HubEvent {
    fn to_value(&self) -> Value {
        let (kind, body) = match self {
            HubEvent::Reply(reply) => ("reply", reply.to_value()),
            HubEvent::Notification(notification) => ("notification", notification.to_value()),
        };
        Value::text_map([("kind", Value::from(kind)), ("body", body)])
    }
}

impl WireDecode for HubEvent {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        let body = fields.require("body")?;
        match fields.text("kind")? {
            "reply" => Ok(HubEvent::Reply(Reply::from_value(body)?)),
            "notification" => Ok(HubEvent::Notification(Notification::from_value(body)?)),
            other => Err(CodecError::invalid_structure(format!(
                "unknown hub event `{other}`"
            ))),
        }
    }
}

/// Handshake answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeResponse {
    /// Identifier of the new session.
    pub session_id: Uuid,
    /// Current schema.
    pub schema: Schema,
    /// Highest request id of this client the hub has processed.
    pub last_sequence_id: RequestId,
    /// Stored replies for processed requests the client may not have seen.
    pub replies: Vec<Reply>,
}

impl WireEncode for InitializeResponse {
    fn to_value(&self) -> Value {
        Value::text_map([
            ("sessionId", Value::Bytes(self.session_id.as_bytes().to_vec())),
            ("schema", self.schema.to_value()),
            ("lastSequenceId", request_id_to_wire(self.last_sequence_id)),
            ("replies", encode_list(&self.replies)),
        ])
    }
}

impl WireDecode for InitializeResponse {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        let session_id = fields
            .require("sessionId")?
            .as_bytes()
            .and_then(|b| Uuid::from_slice(b).ok())
            .ok_or_else(|| CodecError::wrong_type("sessionId", "uuid"))?;
        Ok(Self {
            session_id,
            schema: Schema::from_value(fields.require("schema")?)?,
            last_sequence_id: fields.unsigned("lastSequenceId")?,
            replies: decode_list(fields.array("replies")?)?,
        })
    }
}

/// Content of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSnapshot {
    /// Table name.
    pub table: String,
    /// Every record, deleted ones included.
    pub records: Vec<Record>,
    /// Highest request id of this client reflected in the snapshot.
    pub last_sequence_id: RequestId,
}

impl WireEncode for TableSnapshot {
    fn to_value(&self) -> Value {
        Value::text_map([
            ("table", Value::from(self.table.as_str())),
            ("records", encode_list(&self.records)),
            ("lastSequenceId", request_id_to_wire(self.last_sequence_id)),
        ])
    }
}

impl WireDecode for TableSnapshot {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let fields = Fields::new(value)?;
        Ok(Self {
            table: fields.text("table")?.to_string(),
            records: decode_list(fields.array("records")?)?,
            last_sequence_id: fields.unsigned("lastSequenceId")?,
        })
    }
}
