//! An in-memory authoritative hub.
//!
//! `MemoryHub` plays the server side of the protocol for any number of
//! named clients. It assigns server ids and ticks, verifies that updates
//! and deletes were made against the current row, enforces unique
//! constraints, executes transactions atomically and broadcasts
//! notifications.
//!
//! Each client keeps, across sessions, the highest request id processed
//! and a bounded history of replies; `initialize` returns both so a
//! reconnecting client can tell which of its requests already went
//! through. The translation of the client's row ids to server ids is per
//! session and starts empty at every `initialize`.
//!
//! Every message is encoded to CBOR and decoded again before it is
//! processed, so tests exercise the wire form.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tidesync_codec::{Value, WireDecode, WireEncode};
use tidesync_protocol::{
    uncompress, Change, ClientId, ErrorCode, ErrorPayload, HubEvent, Identity, InitializeResponse,
    Notification, Outgoing, Record, Reply, RequestId, RequestMessage, Schema, ServerId,
    ServerRecord, TableSnapshot, Tick, TransactionMessage,
};
use tracing::{debug, info};
use uuid::Uuid;

/// Configuration of a [`MemoryHub`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Number of replies kept per client for the handshake.
    pub reply_history: usize,
    /// First server id handed out.
    pub first_server_id: ServerId,
    /// Also notify the session that made a change, before its reply.
    pub echo_notifications: bool,
}

impl HubConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            reply_history: 64,
            first_server_id: 101,
            echo_notifications: false,
        }
    }

    /// Sets the reply history length.
    pub fn with_reply_history(mut self, reply_history: usize) -> Self {
        self.reply_history = reply_history;
        self
    }

    /// Sets the first server id.
    pub fn with_first_server_id(mut self, id: ServerId) -> Self {
        self.first_server_id = id;
        self
    }

    /// Enables notifications to the originating session.
    pub fn with_echo_notifications(mut self, echo: bool) -> Self {
        self.echo_notifications = echo;
        self
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Translation of one session's client ids, keyed by table position.
type IdMap = HashMap<(usize, ClientId), ServerId>;

#[derive(Debug, Clone)]
struct Rows {
    tables: Vec<BTreeMap<ServerId, Record>>,
    next_server_id: ServerId,
}

#[derive(Debug)]
struct ClientState {
    session_id: Option<Uuid>,
    connected: bool,
    ids: IdMap,
    last_sequence_id: RequestId,
    history: VecDeque<Reply>,
    inbox: Vec<HubEvent>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            session_id: None,
            connected: true,
            ids: HashMap::new(),
            last_sequence_id: 0,
            history: VecDeque::new(),
            inbox: Vec::new(),
        }
    }

    fn is_live(&self) -> bool {
        self.connected && self.session_id.is_some()
    }
}

#[derive(Debug)]
struct HubState {
    schema: Schema,
    config: HubConfig,
    rows: Rows,
    clients: HashMap<String, ClientState>,
}

/// Shared handle to an in-memory hub.
#[derive(Debug, Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Creates an empty hub serving `schema`.
    pub fn new(schema: Schema, config: HubConfig) -> Self {
        let rows = Rows {
            tables: vec![BTreeMap::new(); schema.tables.len()],
            next_server_id: config.first_server_id,
        };
        Self {
            state: Arc::new(Mutex::new(HubState {
                schema,
                config,
                rows,
                clients: HashMap::new(),
            })),
        }
    }

    /// Replaces the schema, as a hub upgrade would. Existing rows are kept
    /// only for tables that survive unchanged.
    pub fn set_schema(&self, schema: Schema) {
        let mut state = self.state.lock();
        let mut tables = vec![BTreeMap::new(); schema.tables.len()];
        for (i, table) in schema.tables.iter().enumerate() {
            if let Some(old) = state.schema.table_index(&table.name) {
                if state.schema.tables[old].compatible_with(table) {
                    tables[i] = std::mem::take(&mut state.rows.tables[old]);
                }
            }
        }
        state.rows.tables = tables;
        state.schema = schema;
    }

    // === Client side ===

    /// Opens a new session for `client`.
    ///
    /// # Errors
    ///
    /// Fails with `ERR_CONNECTION` while the client is disconnected.
    pub fn initialize(
        &self,
        client: &str,
        area: &str,
        module_id: &str,
    ) -> Result<InitializeResponse, ErrorPayload> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let entry = state
            .clients
            .entry(client.to_string())
            .or_insert_with(ClientState::new);
        if !entry.connected {
            return Err(ErrorPayload::global(ErrorCode::Connection));
        }
        let session_id = Uuid::new_v4();
        entry.session_id = Some(session_id);
        entry.ids.clear();
        entry.inbox.clear();
        info!(
            "hub session {} opened for {} ({}/{}), last sequence id {}",
            session_id, client, area, module_id, entry.last_sequence_id
        );
        Ok(InitializeResponse {
            session_id,
            schema: state.schema.clone(),
            last_sequence_id: entry.last_sequence_id,
            replies: entry.history.iter().cloned().collect(),
        })
    }

    /// Returns every record of a table, deleted ones included.
    ///
    /// # Errors
    ///
    /// Fails with `ERR_CONNECTION` without a live session, and with
    /// `ERR_EXCEPTION_UNEXPECTED` for an unknown table.
    pub fn load_table(&self, client: &str, table: &str) -> Result<TableSnapshot, ErrorPayload> {
        let state = self.state.lock();
        let entry = live_client(&state.clients, client)?;
        let t = state
            .schema
            .table_index(table)
            .ok_or_else(|| unexpected(format!("unknown table {table}")))?;
        Ok(TableSnapshot {
            table: table.to_string(),
            records: state.rows.tables[t].values().cloned().collect(),
            last_sequence_id: entry.last_sequence_id,
        })
    }

    /// Executes a request or transaction. The reply is queued for
    /// [`MemoryHub::poll_events`]. A request id already processed is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Fails with `ERR_CONNECTION` without a live session, and with
    /// `ERR_EXCEPTION_UNEXPECTED` for a message that does not decode or
    /// carries no request id.
    pub fn execute(&self, client: &str, message: &Outgoing) -> Result<(), ErrorPayload> {
        let message = through_wire(message)?;
        let request_id = message
            .request_id()
            .ok_or_else(|| unexpected("request without request id"))?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let entry = state
            .clients
            .get_mut(client)
            .filter(|c| c.is_live())
            .ok_or_else(|| ErrorPayload::global(ErrorCode::Connection))?;
        if request_id <= entry.last_sequence_id {
            debug!("{} request {} already processed", client, request_id);
            return Ok(());
        }

        let (requests, label, notify) = match &message {
            Outgoing::Request(request) => (vec![request.clone()], None, true),
            Outgoing::Transaction(transaction) => (
                uncompress(&transaction.requests, &state.schema)
                    .map_err(|e| unexpected(e.to_string()))?,
                transaction.label.clone(),
                transaction.notify,
            ),
        };

        let mut rows = state.rows.clone();
        let mut ids = entry.ids.clone();
        let outcome = requests
            .iter()
            .map(|request| apply(&state.schema, &mut rows, &mut ids, request))
            .collect::<Result<Vec<_>, _>>();
        let reply = match outcome {
            Ok(records) => {
                state.rows = rows;
                entry.ids = ids;
                Reply::success(request_id, records)
            }
            Err(errors) => {
                debug!("{} request {} refused: {}", client, request_id, errors);
                Reply::failure(request_id, errors)
            }
        };

        entry.last_sequence_id = request_id;
        entry.history.push_back(reply.clone());
        while entry.history.len() > state.config.reply_history {
            entry.history.pop_front();
        }

        if let (Ok(records), true) = (&reply.outcome, notify) {
            let pushed: Vec<ServerRecord> = records
                .iter()
                .map(|r| ServerRecord::new(r.table.clone(), r.record.clone()))
                .collect();
            let echo = state.config.echo_notifications;
            for (name, other) in state.clients.iter_mut() {
                if other.is_live() && (echo || name != client) {
                    other.inbox.push(HubEvent::Notification(Notification {
                        label: label.clone(),
                        records: pushed.clone(),
                    }));
                }
            }
        }
        if let Some(entry) = state.clients.get_mut(client) {
            entry.inbox.push(HubEvent::Reply(reply));
        }
        Ok(())
    }

    /// Takes the events queued for a client.
    ///
    /// # Errors
    ///
    /// Fails with `ERR_CONNECTION` without a live session.
    pub fn poll_events(&self, client: &str) -> Result<Vec<HubEvent>, ErrorPayload> {
        let mut state = self.state.lock();
        let entry = state
            .clients
            .get_mut(client)
            .filter(|c| c.is_live())
            .ok_or_else(|| ErrorPayload::global(ErrorCode::Connection))?;
        Ok(std::mem::take(&mut entry.inbox))
    }

    /// Cuts a client off: its session ends and undelivered events are lost.
    pub fn disconnect(&self, client: &str) {
        let mut state = self.state.lock();
        let entry = state
            .clients
            .entry(client.to_string())
            .or_insert_with(ClientState::new);
        entry.connected = false;
        entry.session_id = None;
        entry.inbox.clear();
        debug!("{} disconnected", client);
    }

    /// Lets a client connect again.
    pub fn reconnect(&self, client: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.clients.get_mut(client) {
            entry.connected = true;
        }
    }

    /// Whether a client can reach the hub.
    pub fn is_connected(&self, client: &str) -> bool {
        self.state
            .lock()
            .clients
            .get(client)
            .map_or(true, |c| c.connected)
    }

    /// Highest request id of a client processed so far.
    pub fn last_sequence_id(&self, client: &str) -> RequestId {
        self.state
            .lock()
            .clients
            .get(client)
            .map_or(0, |c| c.last_sequence_id)
    }

    // === Server side ===

    /// Inserts a row as another party would and notifies every session.
    /// Foreign keys are server ids. Returns `None` for an unknown table.
    pub fn insert(&self, table: &str, values: Vec<Value>) -> Option<ServerId> {
        let mut state = self.state.lock();
        let t = state.schema.table_index(table)?;
        let id = state.rows.next_server_id;
        state.rows.next_server_id += 1;
        let record = Record::new(Some(id), values, 1);
        state.rows.tables[t].insert(id, record.clone());
        broadcast(&mut state, ServerRecord::new(table, record));
        Some(id)
    }

    /// Replaces a row's values as another party would. Returns the new tick.
    pub fn update(&self, table: &str, id: ServerId, values: Vec<Value>) -> Option<Tick> {
        self.modify(table, id, |record| record.values = values)
    }

    /// Deletes a row as another party would. Returns the new tick.
    pub fn delete(&self, table: &str, id: ServerId) -> Option<Tick> {
        self.modify(table, id, |record| record.deleted = true)
    }

    fn modify(&self, table: &str, id: ServerId, change: impl FnOnce(&mut Record)) -> Option<Tick> {
        let mut state = self.state.lock();
        let t = state.schema.table_index(table)?;
        let record = state.rows.tables[t].get_mut(&id)?;
        change(record);
        record.tick += 1;
        let (tick, record) = (record.tick, record.clone());
        broadcast(&mut state, ServerRecord::new(table, record));
        Some(tick)
    }

    /// A stored record.
    pub fn record(&self, table: &str, id: ServerId) -> Option<Record> {
        let state = self.state.lock();
        let t = state.schema.table_index(table)?;
        state.rows.tables[t].get(&id).cloned()
    }

    /// Every stored record of a table, by server id.
    pub fn records(&self, table: &str) -> Vec<Record> {
        let state = self.state.lock();
        state
            .schema
            .table_index(table)
            .map(|t| state.rows.tables[t].values().cloned().collect())
            .unwrap_or_default()
    }

    /// Live records of a table, by server id.
    pub fn live_records(&self, table: &str) -> Vec<Record> {
        self.records(table).into_iter().filter(|r| !r.deleted).collect()
    }
}

fn unexpected(message: impl Into<String>) -> ErrorPayload {
    let mut errors = ErrorPayload::new();
    errors.add_global(ErrorCode::ExceptionUnexpected, vec![Value::from(message.into())]);
    errors
}

fn live_client<'a>(
    clients: &'a HashMap<String, ClientState>,
    client: &str,
) -> Result<&'a ClientState, ErrorPayload> {
    clients
        .get(client)
        .filter(|c| c.is_live())
        .ok_or_else(|| ErrorPayload::global(ErrorCode::Connection))
}

fn broadcast(state: &mut HubState, record: ServerRecord) {
    for client in state.clients.values_mut().filter(|c| c.is_live()) {
        client.inbox.push(HubEvent::Notification(Notification {
            label: None,
            records: vec![record.clone()],
        }));
    }
}

fn through_wire(message: &Outgoing) -> Result<Outgoing, ErrorPayload> {
    let decoded = match message {
        Outgoing::Request(request) => {
            RequestMessage::decode(&request.encode()).map(Outgoing::Request)
        }
        Outgoing::Transaction(transaction) => {
            TransactionMessage::decode(&transaction.encode()).map(Outgoing::Transaction)
        }
    };
    decoded.map_err(|e| unexpected(e.to_string()))
}

/// Applies one request to `rows`. Nothing is written unless every check
/// passes.
fn apply(
    schema: &Schema,
    rows: &mut Rows,
    ids: &mut IdMap,
    request: &RequestMessage,
) -> Result<ServerRecord, ErrorPayload> {
    let t = schema
        .table_index(&request.table)
        .ok_or_else(|| unexpected(format!("unknown table {}", request.table)))?;

    let (record, identity) = match &request.change {
        Change::Create { record, identity } => {
            let values = resolve(schema, t, ids, &record.values, &identity.foreign)?;
            check_references(schema, t, rows, &values)?;
            check_unique(schema, t, rows, &values, None)?;
            let id = rows.next_server_id;
            rows.next_server_id += 1;
            let stored = Record::new(Some(id), values, 1);
            rows.tables[t].insert(id, stored.clone());
            ids.insert((t, identity.client_id), id);
            (stored, identity)
        }
        Change::Update {
            old,
            new,
            old_identity,
            new_identity,
        } => {
            let id = locate(t, ids, old, old_identity)?;
            verify(schema, t, rows, ids, id, old, old_identity)?;
            let values = resolve(schema, t, ids, &new.values, &new_identity.foreign)?;
            check_references(schema, t, rows, &values)?;
            check_unique(schema, t, rows, &values, Some(id))?;
            let stored = rows.tables[t]
                .get_mut(&id)
                .ok_or_else(|| ErrorPayload::global(ErrorCode::RecordDifferent))?;
            stored.values = values;
            stored.tick += 1;
            (stored.clone(), new_identity)
        }
        Change::Delete { record, identity } => {
            let id = locate(t, ids, record, identity)?;
            verify(schema, t, rows, ids, id, record, identity)?;
            let stored = rows.tables[t]
                .get_mut(&id)
                .ok_or_else(|| ErrorPayload::global(ErrorCode::RecordDifferent))?;
            stored.deleted = true;
            stored.tick += 1;
            (stored.clone(), identity)
        }
    };

    Ok(ServerRecord {
        table: request.table.clone(),
        record,
        identity: Some(identity.clone()),
    })
}

fn locate(
    t: usize,
    ids: &IdMap,
    record: &Record,
    identity: &Identity,
) -> Result<ServerId, ErrorPayload> {
    record
        .id
        .or_else(|| ids.get(&(t, identity.client_id)).copied())
        .ok_or_else(|| ErrorPayload::global(ErrorCode::RecordDifferent))
}

/// Fills foreign keys the client could only express as client ids.
fn resolve(
    schema: &Schema,
    t: usize,
    ids: &IdMap,
    values: &[Value],
    foreign: &[Option<ClientId>],
) -> Result<Vec<Value>, ErrorPayload> {
    let table = &schema.tables[t];
    if values.len() != table.columns.len() {
        return Err(ErrorPayload::global(ErrorCode::FieldBadFormat));
    }
    let mut values = values.to_vec();
    for (slot, (column, target)) in table.foreign_keys().into_iter().enumerate() {
        if !values[column].is_null() {
            continue;
        }
        let Some(client_id) = foreign.get(slot).copied().flatten() else {
            continue;
        };
        let target = schema.table_index(target).unwrap_or(usize::MAX);
        let id = ids.get(&(target, client_id)).ok_or_else(|| {
            ErrorPayload::field(table.columns[column].name.clone(), ErrorCode::FieldBadFormat)
        })?;
        values[column] = Value::Integer(*id);
    }
    Ok(values)
}

/// The stored row must be live and hold what the client saw.
fn verify(
    schema: &Schema,
    t: usize,
    rows: &Rows,
    ids: &IdMap,
    id: ServerId,
    seen: &Record,
    identity: &Identity,
) -> Result<(), ErrorPayload> {
    let stored = rows.tables[t]
        .get(&id)
        .ok_or_else(|| ErrorPayload::global(ErrorCode::RecordDifferent))?;
    if stored.deleted {
        return Err(ErrorPayload::global(ErrorCode::RecordDeleted));
    }
    let seen = resolve(schema, t, ids, &seen.values, &identity.foreign)
        .map_err(|_| ErrorPayload::global(ErrorCode::RecordDifferent))?;
    if stored.values != seen {
        return Err(ErrorPayload::global(ErrorCode::RecordDifferent));
    }
    Ok(())
}

fn check_references(
    schema: &Schema,
    t: usize,
    rows: &Rows,
    values: &[Value],
) -> Result<(), ErrorPayload> {
    let table = &schema.tables[t];
    for (column, target) in table.foreign_keys() {
        let Value::Integer(id) = values[column] else {
            continue;
        };
        let live = schema
            .table_index(target)
            .and_then(|target| rows.tables[target].get(&id))
            .is_some_and(|row| !row.deleted);
        if !live {
            return Err(ErrorPayload::field(
                table.columns[column].name.clone(),
                ErrorCode::FieldBadFormat,
            ));
        }
    }
    Ok(())
}

fn check_unique(
    schema: &Schema,
    t: usize,
    rows: &Rows,
    values: &[Value],
    except: Option<ServerId>,
) -> Result<(), ErrorPayload> {
    let table = &schema.tables[t];
    let mut errors = ErrorPayload::new();
    for constraint in table.constraints.iter().filter(|c| c.unique) {
        let columns: Vec<usize> = constraint
            .columns
            .iter()
            .filter_map(|c| table.column_index(c))
            .collect();
        let key: Vec<&Value> = columns.iter().map(|&c| &values[c]).collect();
        if key.iter().any(|v| v.is_null()) {
            continue;
        }
        let taken = rows.tables[t].iter().any(|(id, row)| {
            Some(*id) != except
                && !row.deleted
                && columns.iter().zip(&key).all(|(&c, v)| &row.values[c] == *v)
        });
        if taken {
            let code = constraint
                .error
                .as_deref()
                .map_or(ErrorCode::FieldUnique, ErrorCode::parse);
            errors.add_field(
                constraint.columns[0].clone(),
                code,
                key.into_iter().cloned().collect(),
            );
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
