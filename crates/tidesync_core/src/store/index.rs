//! Constraint indices.

use std::collections::{BTreeSet, HashMap};
use tidesync_codec::Value;
use tidesync_protocol::{ConstraintSchema, ErrorCode};

/// Index over the live rows of one table for one declared constraint.
///
/// Keys are the constraint's column values in client-id space, so a
/// foreign key that is not yet known to the hub still has a stable key.
/// A key containing `Null` is never indexed and never conflicts.
#[derive(Debug, Clone)]
pub struct ConstraintIndex {
    /// Declared constraint.
    schema: ConstraintSchema,
    /// Positions of the indexed columns.
    columns: Vec<usize>,
    /// Key to row indexes.
    entries: HashMap<Vec<Value>, BTreeSet<usize>>,
}

impl ConstraintIndex {
    /// Creates an empty index over the given column positions.
    pub fn new(schema: ConstraintSchema, columns: Vec<usize>) -> Self {
        Self {
            schema,
            columns,
            entries: HashMap::new(),
        }
    }

    /// Constraint name.
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Whether the constraint is unique.
    pub fn is_unique(&self) -> bool {
        self.schema.unique
    }

    /// Positions of the indexed columns.
    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    /// Error code reported on violation.
    pub fn error_code(&self) -> ErrorCode {
        self.schema
            .error
            .as_deref()
            .map_or(ErrorCode::FieldUnique, ErrorCode::parse)
    }

    /// Extracts the key from a full row of client-space values.
    pub fn key(&self, values: &[Value]) -> Option<Vec<Value>> {
        let key: Vec<Value> = self
            .columns
            .iter()
            .map(|&c| values.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        (!key.iter().any(Value::is_null)).then_some(key)
    }

    /// Returns true when the index holds a row other than `except` for the
    /// key of `values`.
    pub fn conflicts(&self, values: &[Value], except: Option<usize>) -> bool {
        self.key(values)
            .and_then(|key| self.entries.get(&key))
            .is_some_and(|rows| rows.iter().any(|&r| Some(r) != except))
    }

    /// Adds a row.
    pub fn insert(&mut self, values: &[Value], row: usize) {
        if let Some(key) = self.key(values) {
            self.entries.entry(key).or_default().insert(row);
        }
    }

    /// Removes a row.
    pub fn remove(&mut self, values: &[Value], row: usize) {
        if let Some(key) = self.key(values) {
            if let Some(rows) = self.entries.get_mut(&key) {
                rows.remove(&row);
                if rows.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Rows holding `key`, in storage order.
    pub fn lookup(&self, key: &[Value]) -> Vec<usize> {
        self.entries
            .get(key)
            .map(|rows| rows.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns true when the key of the row changes between `before` and
    /// `after`.
    pub fn key_changed(&self, before: &[Value], after: &[Value]) -> bool {
        self.columns
            .iter()
            .any(|&c| before.get(c) != after.get(c))
    }

    /// Number of indexed rows.
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    /// Returns true when no row is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
