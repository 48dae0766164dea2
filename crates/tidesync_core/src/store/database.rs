//! The database context: every table of one session plus the machinery
//! that ties them together.
//!
//! Client operations (`*_from_client`) validate, apply optimistically and
//! hand a [`PendingRequest`] to a [`RequestSink`]. They are all-or-nothing:
//! a call that returns an error leaves no trace. Server operations
//! (`update_from_server`, `apply_notification`, `load_rows`) never fail
//! outward; input they cannot use is logged and dropped.
//!
//! Cross-table effects (server ids becoming known, duplicate rows being
//! merged) go through a signal queue that is drained before each public
//! call returns.

use crate::adapter::{FieldAdapter, TypedAdapter};
use crate::error::{CoreError, CoreResult};
use crate::pipeline::{PendingRequest, RequestSink};
use crate::store::deferred::{DeferredSlots, Slot, StoreSignal, TableId};
use crate::store::events::{ChangeEvent, EventFeed, EventFilter, Listener, ListenerId};
use crate::store::table::{ClientRecord, ForeignKey, Table};
use std::collections::{HashMap, VecDeque};
use tidesync_codec::Value;
use tidesync_protocol::{
    Change, ClientId, ErrorCode, ErrorPayload, Identity, Record, Schema, ServerId, ServerRecord,
};
use tracing::{debug, trace, warn};

/// Converted client values, ready to store.
struct Prepared {
    /// Values in server-id space.
    stored: Vec<Value>,
    /// Values in client-id space.
    client: Vec<Value>,
    foreign: Vec<Option<ClientId>>,
}

/// All tables of one session.
pub struct Database {
    schema: Schema,
    tables: Vec<Table>,
    names: HashMap<String, TableId>,
    /// For each table, the `(table, foreign slot)` pairs referencing it.
    referrers: Vec<Vec<(TableId, usize)>>,
    deferred: DeferredSlots,
    signals: VecDeque<StoreSignal>,
    events: EventFeed,
    adapter: Box<dyn FieldAdapter>,
}

impl Database {
    /// Builds empty tables for `schema` with the [`TypedAdapter`].
    ///
    /// # Errors
    ///
    /// Fails when the schema references unknown tables or columns.
    pub fn new(schema: Schema) -> CoreResult<Self> {
        Self::with_adapter(schema, Box::new(TypedAdapter))
    }

    /// Builds empty tables for `schema` with a custom adapter.
    ///
    /// # Errors
    ///
    /// Fails when the schema references unknown tables or columns.
    pub fn with_adapter(schema: Schema, adapter: Box<dyn FieldAdapter>) -> CoreResult<Self> {
        schema.validate().map_err(CoreError::invalid_schema)?;
        let names: HashMap<String, TableId> = schema
            .tables
            .iter()
            .enumerate()
            .map(|(id, t)| (t.name.clone(), id))
            .collect();

        let mut tables = Vec::with_capacity(schema.tables.len());
        let mut referrers = vec![Vec::new(); schema.tables.len()];
        for (id, table) in schema.tables.iter().enumerate() {
            let mut foreign = Vec::new();
            for (slot, (column, target)) in table.foreign_keys().into_iter().enumerate() {
                let target = names[target];
                referrers[target].push((id, slot));
                foreign.push(ForeignKey { column, target });
            }
            tables.push(Table::new(id, table.clone(), foreign)?);
        }

        Ok(Self {
            schema,
            tables,
            names,
            referrers,
            deferred: DeferredSlots::new(),
            signals: VecDeque::new(),
            events: EventFeed::new(),
            adapter,
        })
    }

    // === Accessors ===

    /// The schema the tables were built from.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Position of a table.
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.names.get(name).copied()
    }

    /// Looks up a table by name.
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.table_id(name).map(|id| &self.tables[id])
    }

    /// Every table, in schema order.
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// A row by client id, deleted or not.
    pub fn get_row_by_id(&self, table: &str, client_id: ClientId) -> Option<ClientRecord> {
        let table = self.get_table(table)?;
        table
            .find_client(client_id)
            .map(|i| table.client_record(i))
    }

    /// Live rows holding `key` in the named constraint index.
    pub fn get_index(&self, table: &str, constraint: &str, key: &[Value]) -> Vec<ClientRecord> {
        self.get_table(table)
            .and_then(|t| {
                t.index_lookup(constraint, key)
                    .map(|rows| rows.into_iter().map(|i| t.client_record(i)).collect())
            })
            .unwrap_or_default()
    }

    /// Values of one column over the live rows, in storage order.
    pub fn get_values(&self, table: &str, column: &str) -> Vec<Value> {
        let Some(table) = self.get_table(table) else {
            return Vec::new();
        };
        let Some(column) = table.schema().column_index(column) else {
            return Vec::new();
        };
        (0..table.len())
            .filter(|&i| table.row(i).is_some_and(|r| !r.deleted))
            .map(|i| table.client_values(i)[column].clone())
            .collect()
    }

    /// Live rows of a table, in storage order.
    pub fn live_rows(&self, table: &str) -> Vec<ClientRecord> {
        self.get_table(table)
            .map(|t| {
                (0..t.len())
                    .map(|i| t.client_record(i))
                    .filter(|r| !r.deleted)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Client id of the row carrying a server id.
    pub fn client_id_for_server_id(&self, table: &str, server_id: ServerId) -> Option<ClientId> {
        let table = self.get_table(table)?;
        table
            .find_server(server_id)
            .and_then(|i| table.identity(i))
            .map(|identity| identity.client_id)
    }

    /// Server id of a row, when the hub has acknowledged it.
    pub fn server_id_for_client_id(&self, table: &str, client_id: ClientId) -> Option<ServerId> {
        let table = self.get_table(table)?;
        table
            .find_client(client_id)
            .and_then(|i| table.row(i))
            .and_then(|row| row.id)
    }

    /// Number of foreign-key slots waiting for a server id.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    // === Events ===

    /// Registers a listener.
    pub fn add_event_listener(&mut self, filter: EventFilter, listener: Listener) -> ListenerId {
        self.events.subscribe(filter, listener)
    }

    /// Removes a listener.
    pub fn remove_event_listener(&mut self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Takes over the listeners of another database.
    pub fn adopt_listeners(&mut self, other: &mut Database) {
        self.events.adopt(&mut other.events);
    }

    /// The event feed.
    pub fn events(&self) -> &EventFeed {
        &self.events
    }

    /// Reports a failed mutation to listeners.
    pub fn emit_error(&mut self, table: Option<&str>, record: Option<ClientRecord>, errors: ErrorPayload) {
        self.events.emit(ChangeEvent::error(table, record, errors));
    }

    // === Client operations ===

    /// Creates a row.
    ///
    /// Foreign-key values are client ids of live rows of the referenced
    /// table. On success the row is live locally with an unknown server id
    /// and a create request has been handed to `sink`.
    pub fn add_from_client(
        &mut self,
        sink: &mut dyn RequestSink,
        table: &str,
        values: Vec<Value>,
    ) -> Result<ClientRecord, ErrorPayload> {
        let t = self.resolve_table(table)?;
        let prepared = self.prepare(t, values)?;
        let violations = self.tables[t].unique_violations(&prepared.client, None);
        if !violations.is_empty() {
            return Err(violations);
        }

        let record = Record::new(None, prepared.stored, 0);
        let foreign = prepared.foreign;
        let row_index = self.tables[t].push(record.clone(), foreign.clone());
        let identity = self.identity_of(t, row_index);
        let request = PendingRequest::new(
            t,
            table,
            Change::Create {
                record: record.clone(),
                identity,
            },
            0,
        );
        if let Err(code) = sink.send(request) {
            debug!("create on {} refused: {}", table, code);
            self.tables[t].replace(row_index, record.into_deleted(), foreign);
            return Err(ErrorPayload::global(code));
        }

        let created = self.tables[t].client_record(row_index);
        self.events.emit(ChangeEvent::create(table, created.clone()));
        self.drain_signals();
        Ok(created)
    }

    /// Changes a row.
    ///
    /// `old` must be the row exactly as currently stored, tick included.
    pub fn update_from_client(
        &mut self,
        sink: &mut dyn RequestSink,
        table: &str,
        old: &ClientRecord,
        values: Vec<Value>,
    ) -> Result<ClientRecord, ErrorPayload> {
        let t = self.resolve_table(table)?;
        let i = self.check_current(t, old)?;
        let prepared = self.prepare(t, values)?;
        let violations = self.tables[t].unique_violations(&prepared.client, Some(i));
        if !violations.is_empty() {
            return Err(violations);
        }

        let previous = self.tables[t].client_record(i);
        let old_record = self.row_of(t, i);
        let old_identity = self.identity_of(t, i);
        let new_record = Record {
            values: prepared.stored,
            ..old_record.clone()
        };
        self.tables[t].replace(i, new_record.clone(), prepared.foreign);
        let request = PendingRequest::new(
            t,
            table,
            Change::Update {
                old: old_record.clone(),
                new: new_record,
                old_identity: old_identity.clone(),
                new_identity: self.identity_of(t, i),
            },
            old_record.tick,
        );
        if let Err(code) = sink.send(request) {
            debug!("update on {} refused: {}", table, code);
            self.tables[t].replace(i, old_record, old_identity.foreign);
            return Err(ErrorPayload::global(code));
        }

        let current = self.tables[t].client_record(i);
        self.events
            .emit(ChangeEvent::update(table, previous, current.clone()));
        self.drain_signals();
        Ok(current)
    }

    /// Soft-deletes a row.
    ///
    /// `record` must be the row exactly as currently stored.
    pub fn delete_from_client(
        &mut self,
        sink: &mut dyn RequestSink,
        table: &str,
        record: &ClientRecord,
    ) -> Result<ClientRecord, ErrorPayload> {
        let t = self.resolve_table(table)?;
        let i = self.check_current(t, record)?;

        let old_record = self.row_of(t, i);
        let identity = self.identity_of(t, i);
        self.tables[t].replace(i, old_record.clone().into_deleted(), identity.foreign.clone());
        let request = PendingRequest::new(
            t,
            table,
            Change::Delete {
                record: old_record.clone(),
                identity: identity.clone(),
            },
            old_record.tick,
        );
        if let Err(code) = sink.send(request) {
            debug!("delete on {} refused: {}", table, code);
            self.tables[t].replace(i, old_record, identity.foreign);
            return Err(ErrorPayload::global(code));
        }

        let deleted = self.tables[t].client_record(i);
        self.events.emit(ChangeEvent::delete(table, deleted.clone()));
        self.drain_signals();
        Ok(deleted)
    }

    fn resolve_table(&self, name: &str) -> Result<TableId, ErrorPayload> {
        self.table_id(name)
            .ok_or_else(|| CoreError::table_not_found(name).to_payload())
    }

    fn check_current(&self, t: TableId, expected: &ClientRecord) -> Result<usize, ErrorPayload> {
        let table = &self.tables[t];
        let Some(i) = table.find_client(expected.id) else {
            return Err(ErrorPayload::global(ErrorCode::RecordDifferent));
        };
        let current = table.client_record(i);
        if current.deleted {
            Err(ErrorPayload::global(ErrorCode::RecordDeleted))
        } else if current != *expected {
            Err(ErrorPayload::global(ErrorCode::RecordDifferent))
        } else {
            Ok(i)
        }
    }

    /// Runs every value through the adapter and resolves foreign keys.
    fn prepare(&self, t: TableId, values: Vec<Value>) -> Result<Prepared, ErrorPayload> {
        let table = &self.tables[t];
        let columns = &table.schema().columns;
        if values.len() != columns.len() {
            let mut errors = ErrorPayload::new();
            errors.add_global(
                ErrorCode::FieldBadFormat,
                vec![Value::from(columns.len() as i64), Value::from(values.len() as i64)],
            );
            return Err(errors);
        }

        let mut errors = ErrorPayload::new();
        let mut client = Vec::with_capacity(values.len());
        for (column, value) in columns.iter().zip(&values) {
            match self.adapter.convert(column, value) {
                Ok(converted) => client.push(converted),
                Err(code) => {
                    errors.add_field(column.name.clone(), code, vec![value.clone()]);
                    client.push(Value::Null);
                }
            }
        }

        let mut stored = client.clone();
        let mut foreign = vec![None; table.foreign_keys().len()];
        for (slot, fk) in table.foreign_keys().iter().enumerate() {
            let resolved = match &client[fk.column] {
                Value::Null => continue,
                Value::Integer(n) => u64::try_from(*n).ok().and_then(|client_id| {
                    self.tables[fk.target]
                        .find_live(client_id)
                        .map(|target| (client_id, target))
                }),
                _ => None,
            };
            match resolved {
                Some((client_id, target)) => {
                    foreign[slot] = Some(client_id);
                    stored[fk.column] = self.server_value(fk.target, target);
                }
                None => errors.add_field(
                    columns[fk.column].name.clone(),
                    ErrorCode::FieldBadFormat,
                    vec![client[fk.column].clone()],
                ),
            }
        }

        if errors.is_empty() {
            Ok(Prepared {
                stored,
                client,
                foreign,
            })
        } else {
            Err(errors)
        }
    }

    // === Server operations ===

    /// Merges a record confirmed or pushed by the hub.
    ///
    /// `identity` is the client identity the record answers, when it
    /// answers one of this session's requests. Returns the client id of the
    /// row that now holds the record.
    pub fn update_from_server(
        &mut self,
        table: &str,
        record: Record,
        identity: Option<&Identity>,
    ) -> Option<ClientId> {
        let Some(t) = self.table_id(table) else {
            warn!("server record for unknown table {} dropped", table);
            return None;
        };
        if record.values.len() != self.tables[t].schema().columns.len() {
            warn!(
                "server record for {} has {} values, expected {}; dropped",
                table,
                record.values.len(),
                self.tables[t].schema().columns.len()
            );
            return None;
        }
        let Some(server_id) = record.id else {
            warn!("server record for {} without server id dropped", table);
            return None;
        };

        let by_server = self.tables[t].find_server(server_id);
        let by_client = identity.and_then(|identity| {
            let i = self.tables[t].find_client(identity.client_id)?;
            match self.tables[t].row(i).and_then(|row| row.id) {
                Some(bound) if bound != server_id => {
                    warn!(
                        "{} row {} is bound to {}, not {}; identity ignored",
                        table, identity.client_id, bound, server_id
                    );
                    None
                }
                _ => Some(i),
            }
        });

        let row_index = match (by_server, by_client) {
            (None, None) => {
                let client_id = self.insert_from_server(t, record);
                self.drain_signals();
                return Some(client_id);
            }
            (None, Some(i)) => {
                self.tables[t].bind_server_id(i, server_id);
                let client_id = self.tables[t].identity(i).map(|id| id.client_id)?;
                debug!("{} row {} bound to server id {}", table, client_id, server_id);
                self.signals.push_back(StoreSignal::ServerIdResolved {
                    table: t,
                    server_id,
                    client_id,
                });
                i
            }
            (Some(canonical), Some(obsolete)) if canonical != obsolete => {
                self.merge_duplicate(t, canonical, obsolete);
                canonical
            }
            (Some(i), _) => i,
        };

        self.apply_server(t, row_index, record);
        self.drain_signals();
        self.tables[t].identity(row_index).map(|id| id.client_id)
    }

    /// Merges every record of a reply.
    pub fn apply_reply(&mut self, records: Vec<ServerRecord>) -> Vec<Option<ClientId>> {
        records
            .into_iter()
            .map(|r| self.update_from_server(&r.table, r.record, r.identity.as_ref()))
            .collect()
    }

    /// Applies a batch of changes made by another session, framed by
    /// notification events.
    pub fn apply_notification(&mut self, label: Option<String>, records: Vec<ServerRecord>) {
        self.events
            .emit(ChangeEvent::notification(true, label.clone()));
        for r in records {
            self.update_from_server(&r.table, r.record, r.identity.as_ref());
        }
        self.events.emit(ChangeEvent::notification(false, label));
    }

    /// Loads rows without firing row events. Returns how many were used.
    pub fn load_rows(&mut self, table: &str, records: impl IntoIterator<Item = Record>) -> usize {
        self.events.set_muted(true);
        let applied = records
            .into_iter()
            .filter_map(|record| self.update_from_server(table, record, None))
            .count();
        self.events.set_muted(false);
        applied
    }

    /// Fires the load event of a table.
    pub fn mark_loaded(&mut self, table: &str) {
        self.events.emit(ChangeEvent::load(table));
    }

    fn insert_from_server(&mut self, t: TableId, record: Record) -> ClientId {
        let row_index = self.tables[t].len();
        let foreign = self.resolve_foreign(t, row_index, &record, None);
        let server_id = record.id;
        let live = !record.deleted;
        let row_index = self.tables[t].push(record, foreign);
        let client_id = self.tables[t]
            .identity(row_index)
            .map_or(0, |identity| identity.client_id);
        if let Some(server_id) = server_id {
            self.signals.push_back(StoreSignal::ServerIdResolved {
                table: t,
                server_id,
                client_id,
            });
        }
        if live {
            let created = self.tables[t].client_record(row_index);
            let name = self.tables[t].name().to_string();
            self.events.emit(ChangeEvent::create(&name, created));
        }
        client_id
    }

    /// Applies a record to an existing row if it is newer.
    fn apply_server(&mut self, t: TableId, i: usize, record: Record) {
        let stored_tick = self.tables[t].row(i).map_or(0, |row| row.tick);
        if record.tick <= stored_tick {
            trace!(
                "stale record for {} (tick {} <= {}) dropped",
                self.tables[t].name(),
                record.tick,
                stored_tick
            );
            return;
        }

        let previous = self.tables[t].client_record(i);
        let current_foreign = self.identity_of(t, i).foreign;
        let foreign = self.resolve_foreign(t, i, &record, Some(&current_foreign));
        self.tables[t].replace(i, record, foreign);
        let current = self.tables[t].client_record(i);

        let name = self.tables[t].name().to_string();
        match (previous.deleted, current.deleted) {
            (false, true) => self.events.emit(ChangeEvent::delete(&name, current)),
            (true, false) => self.events.emit(ChangeEvent::create(&name, current)),
            (false, false) => self
                .events
                .emit(ChangeEvent::update(&name, previous, current)),
            (true, true) => {}
        }
    }

    /// Maps the server-space foreign keys of `record` to client ids,
    /// parking those whose target is not known yet.
    ///
    /// A slot that cannot be resolved keeps its current client id when that
    /// id points at a row the hub has not acknowledged yet.
    fn resolve_foreign(
        &mut self,
        t: TableId,
        row_index: usize,
        record: &Record,
        current: Option<&[Option<ClientId>]>,
    ) -> Vec<Option<ClientId>> {
        let fks = self.tables[t].foreign_keys().to_vec();
        let mut foreign = Vec::with_capacity(fks.len());
        for (slot, fk) in fks.iter().enumerate() {
            let Value::Integer(server_id) = record.values[fk.column] else {
                foreign.push(None);
                continue;
            };
            let target = &self.tables[fk.target];
            if let Some(i) = target.find_server(server_id) {
                foreign.push(target.identity(i).map(|id| id.client_id));
                continue;
            }
            self.deferred.defer(
                fk.target,
                server_id,
                Slot {
                    table: t,
                    row_index,
                    foreign: slot,
                },
            );
            let kept = current
                .and_then(|c| c.get(slot).copied().flatten())
                .filter(|&client_id| {
                    target
                        .find_client(client_id)
                        .and_then(|i| target.row(i))
                        .is_some_and(|row| row.id.is_none())
                });
            foreign.push(kept);
        }
        foreign
    }

    /// Folds a client-created row into the row the hub already pushed for
    /// the same server id.
    fn merge_duplicate(&mut self, t: TableId, canonical: usize, obsolete: usize) {
        let name = self.tables[t].name().to_string();
        let canonical_id = self.identity_of(t, canonical).client_id;
        let canonical_server = self.tables[t].row(canonical).and_then(|row| row.id);
        let obsolete_identity = self.identity_of(t, obsolete);
        debug!(
            "{} row {} merged into {}",
            name, obsolete_identity.client_id, canonical_id
        );

        let row = self.row_of(t, obsolete);
        if !row.deleted {
            self.tables[t].replace(obsolete, row.into_deleted(), obsolete_identity.foreign.clone());
            let tombstone = self.tables[t].client_record(obsolete);
            self.events.emit(ChangeEvent::delete(&name, tombstone));
        }
        self.update_client_id(t, obsolete_identity.client_id, canonical_id, canonical_server);
    }

    /// Repoints every foreign key to `old` at `new`.
    fn update_client_id(
        &mut self,
        t: TableId,
        old: ClientId,
        new: ClientId,
        server_id: Option<ServerId>,
    ) {
        for (r, slot) in self.referrers[t].clone() {
            for j in self.tables[r].referencing(slot, old) {
                let previous = self.tables[r].client_record(j);
                let server_value = server_id.map_or(Value::Null, Value::Integer);
                self.tables[r].set_foreign(j, slot, Some(new), Some(server_value));
                if !previous.deleted {
                    let current = self.tables[r].client_record(j);
                    let name = self.tables[r].name().to_string();
                    self.events.emit(ChangeEvent::update(&name, previous, current));
                }
            }
        }
    }

    /// Fills in a newly known server id everywhere it is referenced.
    fn update_server_id(&mut self, t: TableId, server_id: ServerId, client_id: ClientId) {
        for (r, slot) in self.referrers[t].clone() {
            let column = self.tables[r].foreign_keys()[slot].column;
            for j in self.tables[r].referencing(slot, client_id) {
                if self.tables[r].row(j).is_some_and(|row| row.values[column].is_null()) {
                    self.tables[r]
                        .set_server_value(j, column, Value::Integer(server_id));
                }
            }
        }

        for slot in self.deferred.take(t, server_id) {
            let table = &self.tables[slot.table];
            let column = table.foreign_keys()[slot.foreign].column;
            let still_wanted = table
                .row(slot.row_index)
                .is_some_and(|row| row.values[column] == Value::Integer(server_id));
            let already = table
                .identity(slot.row_index)
                .is_some_and(|identity| identity.foreign[slot.foreign] == Some(client_id));
            if !still_wanted || already {
                continue;
            }
            let previous = table.client_record(slot.row_index);
            self.tables[slot.table].set_foreign(slot.row_index, slot.foreign, Some(client_id), None);
            trace!(
                "deferred reference from {} row {} resolved",
                self.tables[slot.table].name(),
                previous.id
            );
            if !previous.deleted {
                let current = self.tables[slot.table].client_record(slot.row_index);
                let name = self.tables[slot.table].name().to_string();
                self.events.emit(ChangeEvent::update(&name, previous, current));
            }
        }
    }

    fn drain_signals(&mut self) {
        while let Some(signal) = self.signals.pop_front() {
            match signal {
                StoreSignal::ServerIdResolved {
                    table,
                    server_id,
                    client_id,
                } => self.update_server_id(table, server_id, client_id),
            }
        }
    }

    // === Rollback ===

    /// Undoes a request's local effect.
    ///
    /// Nothing happens when the row moved on since the request was queued
    /// (its tick changed). Returns true when the row was restored.
    pub fn rollback(&mut self, request: &PendingRequest) -> bool {
        let t = request.table;
        if t >= self.tables.len() {
            warn!("rollback for unknown table {} ignored", request.table_name);
            return false;
        }
        let client_id = request.change.client_id();
        let Some(i) = self.tables[t].find_client(client_id) else {
            warn!("rollback for unknown {} row {} ignored", request.table_name, client_id);
            return false;
        };
        let row = self.row_of(t, i);
        if row.tick != request.tick {
            debug!(
                "rollback of {} row {} skipped: tick {} superseded by {}",
                request.table_name, client_id, request.tick, row.tick
            );
            return false;
        }

        let previous = self.tables[t].client_record(i);
        let (record, foreign) = match &request.change {
            Change::Create { .. } => {
                let foreign = self.identity_of(t, i).foreign;
                (row.into_deleted(), foreign)
            }
            Change::Update {
                old, old_identity, ..
            } => (self.restored(t, &row, old, &old_identity.foreign), old_identity.foreign.clone()),
            Change::Delete { record, identity } => {
                (self.restored(t, &row, record, &identity.foreign), identity.foreign.clone())
            }
        };
        self.tables[t].replace(i, record, foreign);
        let current = self.tables[t].client_record(i);

        let name = request.table_name.as_str();
        match (previous.deleted, current.deleted) {
            (false, true) => self.events.emit(ChangeEvent::delete(name, current)),
            (true, false) => self.events.emit(ChangeEvent::create(name, current)),
            (false, false) => self.events.emit(ChangeEvent::update(name, previous, current)),
            (true, true) => {}
        }
        self.drain_signals();
        true
    }

    /// The snapshot `old` as it should be stored now: server id and tick of
    /// the current row, foreign keys re-derived from the client slots.
    fn restored(
        &self,
        t: TableId,
        current: &Record,
        old: &Record,
        foreign: &[Option<ClientId>],
    ) -> Record {
        let mut values = old.values.clone();
        for (fk, client_id) in self.tables[t].foreign_keys().iter().zip(foreign) {
            if let Some(client_id) = client_id {
                if let Some(target) = self.tables[fk.target].find_client(*client_id) {
                    values[fk.column] = self.server_value(fk.target, target);
                }
            }
        }
        Record {
            id: current.id,
            values,
            tick: current.tick,
            deleted: old.deleted,
        }
    }

    // === Helpers ===

    fn server_value(&self, t: TableId, row_index: usize) -> Value {
        self.tables[t]
            .row(row_index)
            .and_then(|row| row.id)
            .map_or(Value::Null, Value::Integer)
    }

    fn row_of(&self, t: TableId, i: usize) -> Record {
        self.tables[t].row(i).cloned().unwrap_or_else(|| Record::new(None, Vec::new(), 0))
    }

    fn identity_of(&self, t: TableId, i: usize) -> Identity {
        self.tables[t]
            .identity(i)
            .cloned()
            .unwrap_or_else(|| Identity::new(i, 0, Vec::new()))
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("tables", &self.tables.len())
            .field("deferred", &self.deferred.len())
            .field("events", &self.events)
            .finish()
    }
}
