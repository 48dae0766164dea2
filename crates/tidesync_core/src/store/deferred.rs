//! Foreign keys waiting for a server id to become known.
//!
//! A row can reference a row of another table by server id before this
//! client knows which local row carries that server id, for example when
//! the referencing table loads first. The reference is parked here under
//! the referenced `(table, server id)`. When the store learns the server
//! id it queues a [`StoreSignal::ServerIdResolved`], and draining that
//! signal fills every parked slot at once.

use std::collections::HashMap;
use tidesync_protocol::{ClientId, ServerId};

/// Index of a table in the database.
pub type TableId = usize;

/// One foreign-key slot of one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    /// Referencing table.
    pub table: TableId,
    /// Referencing row.
    pub row_index: usize,
    /// Position in the row identity's foreign slots.
    pub foreign: usize,
}

/// Messages produced while mutating the store, processed before the
/// mutating call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSignal {
    /// A row of `table` now carries `server_id`.
    ServerIdResolved {
        /// Table of the row.
        table: TableId,
        /// The newly bound server id.
        server_id: ServerId,
        /// Client id of the row.
        client_id: ClientId,
    },
}

/// Parked foreign-key slots keyed by the referenced row.
#[derive(Debug, Default)]
pub struct DeferredSlots {
    waiting: HashMap<(TableId, ServerId), Vec<Slot>>,
}

impl DeferredSlots {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `slot` until `server_id` of `target` is known.
    pub fn defer(&mut self, target: TableId, server_id: ServerId, slot: Slot) {
        let slots = self.waiting.entry((target, server_id)).or_default();
        if !slots.contains(&slot) {
            slots.push(slot);
        }
    }

    /// Removes and returns the slots waiting on one row.
    pub fn take(&mut self, target: TableId, server_id: ServerId) -> Vec<Slot> {
        self.waiting.remove(&(target, server_id)).unwrap_or_default()
    }

    /// Number of rows still awaited.
    pub fn pending_targets(&self) -> usize {
        self.waiting.len()
    }

    /// Number of parked slots.
    pub fn len(&self) -> usize {
        self.waiting.values().map(Vec::len).sum()
    }

    /// Returns true when nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
