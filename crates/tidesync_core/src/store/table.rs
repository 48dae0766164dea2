//! Row storage and the dual identity index of one table.
//!
//! Rows are kept in server-id space (`Record`) in an append-only arena.
//! Each row has an [`Identity`] at the same position, which holds its
//! client id and its foreign keys in client-id space. The position is the
//! row's handle: `by_server` and `by_client` both map to it, so binding a
//! server id to a locally created row is a single insert.

use crate::error::{CoreError, CoreResult};
use crate::store::deferred::TableId;
use crate::store::index::ConstraintIndex;
use std::collections::HashMap;
use tidesync_codec::Value;
use tidesync_protocol::{ClientId, ErrorPayload, Identity, Record, ServerId, TableSchema, Tick};

/// A row as client code sees it.
///
/// Foreign-key columns hold the client id of the referenced row, or `Null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    /// Client id of the row.
    pub id: ClientId,
    /// Column values in schema order.
    pub values: Vec<Value>,
    /// Revision counter.
    pub tick: Tick,
    /// Soft-delete flag.
    pub deleted: bool,
}

/// A foreign-key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    /// Column position.
    pub column: usize,
    /// Referenced table.
    pub target: TableId,
}

/// Rows, identities and indices of one table.
#[derive(Debug)]
pub struct Table {
    id: TableId,
    schema: TableSchema,
    foreign: Vec<ForeignKey>,
    rows: Vec<Record>,
    identities: Vec<Identity>,
    by_server: HashMap<ServerId, usize>,
    by_client: HashMap<ClientId, usize>,
    indices: Vec<ConstraintIndex>,
    next_client_id: ClientId,
}

impl Table {
    /// Creates an empty table.
    ///
    /// # Errors
    ///
    /// Fails when a constraint names an unknown column.
    pub fn new(id: TableId, schema: TableSchema, foreign: Vec<ForeignKey>) -> CoreResult<Self> {
        let mut indices = Vec::with_capacity(schema.constraints.len());
        for constraint in &schema.constraints {
            let columns = constraint
                .columns
                .iter()
                .map(|name| {
                    schema.column_index(name).ok_or_else(|| {
                        CoreError::invalid_schema(format!(
                            "constraint `{}` names unknown column `{name}`",
                            constraint.name
                        ))
                    })
                })
                .collect::<CoreResult<Vec<_>>>()?;
            indices.push(ConstraintIndex::new(constraint.clone(), columns));
        }
        Ok(Self {
            id,
            schema,
            foreign,
            rows: Vec::new(),
            identities: Vec::new(),
            by_server: HashMap::new(),
            by_client: HashMap::new(),
            indices,
            next_client_id: 0,
        })
    }

    /// Position of the table in the database.
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Table schema.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Foreign-key columns in identity slot order.
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign
    }

    /// Number of stored rows, deleted ones included.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when no row was ever stored.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row at a position.
    pub fn row(&self, row_index: usize) -> Option<&Record> {
        self.rows.get(row_index)
    }

    /// Identity at a position.
    pub fn identity(&self, row_index: usize) -> Option<&Identity> {
        self.identities.get(row_index)
    }

    /// Every stored row with its identity.
    pub fn rows(&self) -> impl Iterator<Item = (&Record, &Identity)> {
        self.rows.iter().zip(&self.identities)
    }

    /// Position of the row with a client id.
    pub fn find_client(&self, client_id: ClientId) -> Option<usize> {
        self.by_client.get(&client_id).copied()
    }

    /// Position of the row with a server id.
    pub fn find_server(&self, server_id: ServerId) -> Option<usize> {
        self.by_server.get(&server_id).copied()
    }

    /// Position of a live row with a client id.
    pub fn find_live(&self, client_id: ClientId) -> Option<usize> {
        self.find_client(client_id)
            .filter(|&i| !self.rows[i].deleted)
    }

    /// Client id that the next new row will receive.
    pub fn peek_client_id(&self) -> ClientId {
        self.next_client_id + 1
    }

    fn next_sequence(&mut self) -> ClientId {
        self.next_client_id += 1;
        self.next_client_id
    }

    /// Values of a row in client-id space.
    pub fn client_values(&self, row_index: usize) -> Vec<Value> {
        let mut values = self.rows[row_index].values.clone();
        let identity = &self.identities[row_index];
        for (fk, client) in self.foreign.iter().zip(&identity.foreign) {
            values[fk.column] = client.map_or(Value::Null, client_id_value);
        }
        values
    }

    /// A row in client-id space.
    pub fn client_record(&self, row_index: usize) -> ClientRecord {
        let row = &self.rows[row_index];
        ClientRecord {
            id: self.identities[row_index].client_id,
            values: self.client_values(row_index),
            tick: row.tick,
            deleted: row.deleted,
        }
    }

    /// Appends a row under a fresh client id and indexes it if live.
    pub fn push(&mut self, record: Record, foreign: Vec<Option<ClientId>>) -> usize {
        let row_index = self.rows.len();
        let client_id = self.next_sequence();
        if let Some(server_id) = record.id {
            self.by_server.insert(server_id, row_index);
        }
        self.by_client.insert(client_id, row_index);
        let live = !record.deleted;
        self.rows.push(record);
        self.identities
            .push(Identity::new(row_index, client_id, foreign));
        if live {
            let values = self.client_values(row_index);
            for index in &mut self.indices {
                index.insert(&values, row_index);
            }
        }
        row_index
    }

    /// Records that a row carries `server_id`.
    pub fn bind_server_id(&mut self, row_index: usize, server_id: ServerId) {
        if let Some(previous) = self.rows[row_index].id.replace(server_id) {
            if previous != server_id {
                self.by_server.remove(&previous);
            }
        }
        self.by_server.insert(server_id, row_index);
    }

    /// Replaces a row's content and foreign slots, keeping the indices in
    /// step. Only indices whose key changes are touched.
    pub fn replace(&mut self, row_index: usize, record: Record, foreign: Vec<Option<ClientId>>) {
        let was_live = !self.rows[row_index].deleted;
        let before = self.client_values(row_index);

        let id = record.id.or(self.rows[row_index].id);
        self.rows[row_index] = Record { id, ..record };
        self.identities[row_index].foreign = foreign;

        let is_live = !self.rows[row_index].deleted;
        let after = self.client_values(row_index);
        for index in &mut self.indices {
            if was_live && is_live && !index.key_changed(&before, &after) {
                continue;
            }
            if was_live {
                index.remove(&before, row_index);
            }
            if is_live {
                index.insert(&after, row_index);
            }
        }
    }

    /// Sets one server-space column value without touching indices.
    pub(crate) fn set_server_value(&mut self, row_index: usize, column: usize, value: Value) {
        self.rows[row_index].values[column] = value;
    }

    /// Sets one foreign slot, and optionally its server-space column.
    pub(crate) fn set_foreign(
        &mut self,
        row_index: usize,
        slot: usize,
        client_id: Option<ClientId>,
        server_value: Option<Value>,
    ) {
        let mut record = self.rows[row_index].clone();
        if let Some(value) = server_value {
            record.values[self.foreign[slot].column] = value;
        }
        let mut foreign = self.identities[row_index].foreign.clone();
        foreign[slot] = client_id;
        self.replace(row_index, record, foreign);
    }

    /// Collects unique-constraint violations of client-space `values`,
    /// ignoring the row at `except`.
    pub fn unique_violations(&self, values: &[Value], except: Option<usize>) -> ErrorPayload {
        let mut errors = ErrorPayload::new();
        for index in self.indices.iter().filter(|i| i.is_unique()) {
            if index.conflicts(values, except) {
                let field = &self.schema.columns[index.columns()[0]].name;
                let parameters = index.key(values).unwrap_or_default();
                errors.add_field(field.clone(), index.error_code(), parameters);
            }
        }
        errors
    }

    /// Live rows holding a constraint key.
    pub fn index_lookup(&self, constraint: &str, key: &[Value]) -> Option<Vec<usize>> {
        self.indices
            .iter()
            .find(|i| i.name() == constraint)
            .map(|i| i.lookup(key))
    }

    /// Rows whose foreign slot `slot` holds `client_id`.
    pub(crate) fn referencing(&self, slot: usize, client_id: ClientId) -> Vec<usize> {
        self.identities
            .iter()
            .filter(|identity| identity.foreign.get(slot) == Some(&Some(client_id)))
            .map(|identity| identity.row_index)
            .collect()
    }
}

/// A client id as a foreign-key column value.
#[allow(clippy::cast_possible_wrap)]
pub fn client_id_value(client_id: ClientId) -> Value {
    Value::Integer(client_id as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_protocol::{ColumnSchema, ColumnType, ConstraintSchema};

    fn contacts() -> Table {
        let schema = TableSchema::new(
            "Contact",
            vec![
                ColumnSchema::new("Email", ColumnType::Text),
                ColumnSchema::reference("CompanyId", "Company").nullable(),
            ],
        )
        .with_constraint(ConstraintSchema::unique("ContactEmail", &["Email"]))
        .with_constraint(ConstraintSchema::index("ContactCompany", &["CompanyId"]));
        Table::new(1, schema, vec![ForeignKey { column: 1, target: 0 }]).unwrap()
    }

    fn row(email: &str, company: Option<i64>) -> Record {
        Record::new(None, vec![Value::from(email), Value::from(company)], 0)
    }

    #[test]
    fn client_ids_start_at_one_and_increase() {
        let mut table = contacts();
        assert_eq!(table.peek_client_id(), 1);
        let a = table.push(row("a@x", None), vec![None]);
        let b = table.push(row("b@x", None), vec![None]);
        assert_eq!(table.identity(a).unwrap().client_id, 1);
        assert_eq!(table.identity(b).unwrap().client_id, 2);
        assert_eq!(table.find_client(2), Some(b));
    }

    #[test]
    fn client_view_uses_foreign_slots() {
        let mut table = contacts();
        let i = table.push(row("a@x", Some(101)), vec![Some(7)]);
        let record = table.client_record(i);
        assert_eq!(record.values[1], Value::Integer(7));
        assert_eq!(table.row(i).unwrap().values[1], Value::Integer(101));
        assert_eq!(table.index_lookup("ContactCompany", &[Value::Integer(7)]), Some(vec![i]));
    }

    #[test]
    fn server_id_binding_is_visible_from_both_maps() {
        let mut table = contacts();
        let i = table.push(row("a@x", None), vec![None]);
        table.bind_server_id(i, 55);
        assert_eq!(table.find_server(55), table.find_client(1));
        assert_eq!(table.row(i).unwrap().id, Some(55));
    }

    #[test]
    fn replace_moves_index_entries() {
        let mut table = contacts();
        let i = table.push(row("a@x", None), vec![None]);
        assert!(!table.unique_violations(&[Value::from("a@x"), Value::Null], None).is_empty());

        table.replace(i, row("b@x", None), vec![None]);
        assert!(table.unique_violations(&[Value::from("a@x"), Value::Null], None).is_empty());
        assert!(table.unique_violations(&[Value::from("b@x"), Value::Null], Some(i)).is_empty());

        table.replace(i, row("b@x", None).into_deleted(), vec![None]);
        assert!(table.unique_violations(&[Value::from("b@x"), Value::Null], None).is_empty());
    }

    #[test]
    fn unknown_constraint_column_is_rejected() {
        let schema = TableSchema::new("T", vec![ColumnSchema::new("A", ColumnType::Text)])
            .with_constraint(ConstraintSchema::unique("TB", &["B"]));
        assert!(Table::new(0, schema, Vec::new()).is_err());
    }
}
