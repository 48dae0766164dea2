//! The request pipeline: open transaction, pending buffer and sent queue.
//!
//! ```text
//!  send ──► open transaction ──end──► pending ──commit──► sent ──ack──► gone
//!       └──────────────(no transaction)──┘                   └──fail──► rolled back
//! ```
//!
//! Every request is accounted by its encoded size from `send` until it is
//! acknowledged, failed or rolled back; a request that would push the total
//! over the configured bound is refused with `ERR_OUT_OF_MEMORY`.

use crate::error::{CoreError, CoreResult};
use crate::pipeline::config::PipelineConfig;
use crate::pipeline::request::{PendingRequest, RequestSink};
use crate::store::Database;
use std::collections::BTreeMap;
use tidesync_protocol::{
    compress, ErrorCode, ErrorPayload, LotPolicy, Outgoing, RequestId, RequestMessage,
    TransactionMessage,
};
use tracing::debug;

/// How a group of requests travels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKind {
    /// One request on its own.
    Single,
    /// A transaction.
    Transaction {
        /// Notification label.
        label: Option<String>,
        /// Whether other sessions are notified.
        notify: bool,
    },
}

/// Requests sharing one commit outcome.
#[derive(Debug)]
pub struct RequestGroup {
    /// How the group travels.
    pub kind: GroupKind,
    /// Requests in application order.
    pub requests: Vec<PendingRequest>,
    size: usize,
    transmitted: bool,
}

impl RequestGroup {
    /// Creates an untransmitted group accounted at `size` bytes.
    pub fn new(kind: GroupKind, requests: Vec<PendingRequest>, size: usize) -> Self {
        Self {
            kind,
            requests,
            size,
            transmitted: false,
        }
    }

    /// Accounted size of the group.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the group was handed to the transport.
    pub fn is_transmitted(&self) -> bool {
        self.transmitted
    }

    /// Whether the group is a transaction.
    pub fn is_transaction(&self) -> bool {
        matches!(self.kind, GroupKind::Transaction { .. })
    }

    /// Wire message of the group.
    ///
    /// # Errors
    ///
    /// Fails when the requests cannot be compressed.
    pub fn message(&self, request_id: RequestId, policy: &impl LotPolicy) -> CoreResult<Outgoing> {
        match &self.kind {
            GroupKind::Single => {
                let mut message = self
                    .requests
                    .first()
                    .map(PendingRequest::message)
                    .ok_or_else(|| CoreError::invalid_operation("empty request group"))?;
                message.request_id = Some(request_id);
                Ok(Outgoing::Request(message))
            }
            GroupKind::Transaction { label, notify } => {
                let messages: Vec<RequestMessage> =
                    self.requests.iter().map(PendingRequest::message).collect();
                Ok(Outgoing::Transaction(TransactionMessage {
                    request_id,
                    label: label.clone(),
                    requests: compress(&messages, policy)?,
                    notify: *notify,
                }))
            }
        }
    }

    /// Undoes every request in reverse order and calls the callbacks.
    fn unwind(&mut self, db: &mut Database, outcome: Option<&ErrorPayload>) {
        for request in self.requests.iter_mut().rev() {
            db.rollback(request);
            if let Some(errors) = outcome {
                request.complete(Err(errors.clone()));
            }
        }
    }
}

/// A transaction being built.
#[derive(Debug)]
pub struct OpenTransaction {
    /// Nesting depth.
    pub depth: usize,
    /// Label of the outermost `begin`.
    pub label: Option<String>,
    /// Whether other sessions are notified.
    pub notify: bool,
    /// Requests so far.
    pub requests: Vec<PendingRequest>,
    size: usize,
}

/// Everything a pipeline still owes the hub, in replay order.
#[derive(Debug, Default)]
pub struct PipelineBacklog {
    /// Committed groups by ascending request id.
    pub sent: Vec<(RequestId, RequestGroup)>,
    /// Groups not committed yet.
    pub pending: Vec<RequestGroup>,
    /// The transaction still open.
    pub open: Option<OpenTransaction>,
    /// Next request id the pipeline would have used.
    pub next_request_id: RequestId,
}

/// Buffers requests between the table store and the hub.
#[derive(Debug)]
pub struct RequestPipeline {
    config: PipelineConfig,
    open: Option<OpenTransaction>,
    pending: Vec<RequestGroup>,
    sent: BTreeMap<RequestId, RequestGroup>,
    size: usize,
    next_request_id: RequestId,
}

impl RequestPipeline {
    /// Creates an empty pipeline.
    pub fn new(config: PipelineConfig) -> Self {
        let next_request_id = config.first_request_id;
        Self {
            config,
            open: None,
            pending: Vec::new(),
            sent: BTreeMap::new(),
            size: 0,
            next_request_id,
        }
    }

    /// Pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Encoded size of every request not yet acknowledged.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of groups waiting for `commit`.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of committed groups waiting for a reply.
    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    /// Returns true when a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.open.is_some()
    }

    /// Returns true when nothing is buffered.
    pub fn is_idle(&self) -> bool {
        self.open.is_none() && self.pending.is_empty() && self.sent.is_empty()
    }

    /// Next request id to be assigned.
    pub fn next_request_id(&self) -> RequestId {
        self.next_request_id
    }

    /// Moves the request id counter forward to at least `id`.
    pub fn advance_request_id(&mut self, id: RequestId) {
        self.next_request_id = self.next_request_id.max(id);
    }

    // === Transactions ===

    /// Opens a transaction, or nests into the open one. Returns the depth.
    pub fn begin_transaction(&mut self, label: Option<String>, notify: bool) -> usize {
        let open = self.open.get_or_insert_with(|| OpenTransaction {
            depth: 0,
            label,
            notify,
            requests: Vec::new(),
            size: 0,
        });
        open.depth += 1;
        open.depth
    }

    /// Closes one nesting level. On the outermost level the transaction
    /// becomes one pending group; an empty one is dropped.
    ///
    /// # Errors
    ///
    /// Fails when no transaction is open.
    pub fn end_transaction(&mut self) -> CoreResult<usize> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("no open transaction"))?;
        open.depth -= 1;
        if open.depth > 0 {
            return Ok(open.depth);
        }
        if let Some(open) = self.open.take() {
            if !open.requests.is_empty() {
                debug!(
                    "transaction {:?} closed with {} requests",
                    open.label,
                    open.requests.len()
                );
                self.pending.push(RequestGroup::new(
                    GroupKind::Transaction {
                        label: open.label,
                        notify: open.notify,
                    },
                    open.requests,
                    open.size,
                ));
            }
        }
        Ok(0)
    }

    /// Rolls back the open transaction only, in reverse order. Returns the
    /// undone requests so their callbacks can be completed.
    pub fn abort_transaction(&mut self, db: &mut Database) -> Vec<PendingRequest> {
        let Some(mut open) = self.open.take() else {
            return Vec::new();
        };
        self.size -= open.size;
        open.requests.reverse();
        for request in &open.requests {
            db.rollback(request);
        }
        open.requests
    }

    // === Commit and acknowledgment ===

    /// Moves every pending group to the sent queue under fresh request ids.
    pub fn commit(&mut self) -> Vec<RequestId> {
        let mut ids = Vec::with_capacity(self.pending.len());
        for group in self.pending.drain(..) {
            let id = self.next_request_id;
            self.next_request_id += 1;
            self.sent.insert(id, group);
            ids.push(id);
        }
        if !ids.is_empty() {
            debug!("committed request ids {:?}", ids);
        }
        ids
    }

    /// Messages for the committed groups not handed to the transport yet,
    /// by ascending request id.
    ///
    /// # Errors
    ///
    /// Fails when a transaction cannot be compressed.
    pub fn untransmitted(&self, policy: &impl LotPolicy) -> CoreResult<Vec<Outgoing>> {
        self.sent
            .iter()
            .filter(|(_, group)| !group.transmitted)
            .map(|(&id, group)| group.message(id, policy))
            .collect()
    }

    /// Records that a committed group was handed to the transport.
    pub fn mark_transmitted(&mut self, id: RequestId) {
        if let Some(group) = self.sent.get_mut(&id) {
            group.transmitted = true;
        }
    }

    /// Removes a group the hub confirmed.
    pub fn acknowledge(&mut self, id: RequestId) -> Option<RequestGroup> {
        let group = self.sent.remove(&id)?;
        self.size -= group.size;
        Some(group)
    }

    /// Removes a group the hub refused: its requests are rolled back in
    /// reverse order, their callbacks receive `errors` and one error event
    /// is fired. Returns false for an unknown id.
    pub fn fail(&mut self, id: RequestId, errors: &ErrorPayload, db: &mut Database) -> bool {
        let Some(mut group) = self.sent.remove(&id) else {
            return false;
        };
        self.size -= group.size;
        debug!("request {} refused: {}", id, errors);
        group.unwind(db, Some(errors));
        let table = group.requests.first().map(|r| r.table_name.clone());
        db.emit_error(table.as_deref(), None, errors.clone());
        true
    }

    /// Undoes everything not committed yet, newest first, and clears it.
    /// Returns the number of requests undone.
    pub fn rollback(&mut self, db: &mut Database) -> usize {
        let mut undone = self.abort_transaction(db).len();
        while let Some(mut group) = self.pending.pop() {
            self.size -= group.size;
            undone += group.requests.len();
            group.unwind(db, None);
        }
        undone
    }

    /// Hands over everything the pipeline holds, leaving it empty.
    pub fn take_backlog(&mut self) -> PipelineBacklog {
        self.size = 0;
        PipelineBacklog {
            sent: std::mem::take(&mut self.sent).into_iter().collect(),
            pending: std::mem::take(&mut self.pending),
            open: self.open.take(),
            next_request_id: self.next_request_id,
        }
    }
}

impl RequestSink for RequestPipeline {
    fn send(&mut self, request: PendingRequest) -> Result<(), ErrorCode> {
        let size = request.size();
        if !self.config.admits(self.size, size) {
            debug!(
                "request of {} bytes refused, {} of {} in use",
                size, self.size, self.config.max_size
            );
            return Err(ErrorCode::OutOfMemory);
        }
        self.size += size;
        match &mut self.open {
            Some(open) => {
                open.size += size;
                open.requests.push(request);
            }
            None => self
                .pending
                .push(RequestGroup::new(GroupKind::Single, vec![request], size)),
        }
        Ok(())
    }
}
