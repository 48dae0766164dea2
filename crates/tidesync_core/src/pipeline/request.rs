//! Pending requests and the sink the table store emits them into.

use crate::store::TableId;
use std::fmt;
use tidesync_protocol::{Change, ErrorCode, ErrorPayload, RequestMessage, Tick};
use tidesync_codec::WireEncode;

/// Completion callback of a request: `Ok` once the hub confirmed it, or
/// the errors that made it roll back.
pub type DoneFn = Box<dyn FnOnce(Result<(), ErrorPayload>) + Send>;

/// A mutation applied locally and waiting for the hub.
pub struct PendingRequest {
    /// Table position in the database.
    pub table: TableId,
    /// Table name, as sent on the wire.
    pub table_name: String,
    /// The mutation with its undo snapshots.
    pub change: Change,
    /// Tick of the row when the mutation was applied.
    pub tick: Tick,
    /// Completion callback.
    pub done: Option<DoneFn>,
}

impl PendingRequest {
    /// Creates a request without callback.
    pub fn new(table: TableId, table_name: impl Into<String>, change: Change, tick: Tick) -> Self {
        Self {
            table,
            table_name: table_name.into(),
            change,
            tick,
            done: None,
        }
    }

    /// Wire form of the request.
    pub fn message(&self) -> RequestMessage {
        RequestMessage::new(self.table_name.clone(), self.change.clone(), self.tick)
    }

    /// Bytes the request accounts for in the buffer: the length of its
    /// canonical encoding.
    pub fn size(&self) -> usize {
        self.message().encoded_len()
    }

    /// Calls the completion callback, if any.
    pub fn complete(&mut self, outcome: Result<(), ErrorPayload>) {
        if let Some(done) = self.done.take() {
            done(outcome);
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("table", &self.table_name)
            .field("action", &self.change.action())
            .field("client_id", &self.change.client_id())
            .field("tick", &self.tick)
            .field("done", &self.done.is_some())
            .finish()
    }
}

/// Receiver of the requests produced by client operations.
pub trait RequestSink {
    /// Accepts a request, or refuses it with the code to report.
    fn send(&mut self, request: PendingRequest) -> Result<(), ErrorCode>;
}

/// A sink that attaches a completion callback to the request it forwards.
pub struct WithDone<'a> {
    inner: &'a mut dyn RequestSink,
    done: Option<DoneFn>,
}

impl<'a> WithDone<'a> {
    /// Wraps `inner`.
    pub fn new(inner: &'a mut dyn RequestSink, done: Option<DoneFn>) -> Self {
        Self { inner, done }
    }

    /// Returns the callback if no request took it.
    pub fn into_done(self) -> Option<DoneFn> {
        self.done
    }
}

impl RequestSink for WithDone<'_> {
    fn send(&mut self, mut request: PendingRequest) -> Result<(), ErrorCode> {
        if request.done.is_none() {
            request.done = self.done.take();
        }
        self.inner.send(request)
    }
}

/// A sink that keeps every request, for tests and tools.
#[derive(Debug, Default)]
pub struct CollectingSink {
    /// Collected requests.
    pub requests: Vec<PendingRequest>,
    /// When set, every request is refused with this code.
    pub refuse: Option<ErrorCode>,
}

impl RequestSink for CollectingSink {
    fn send(&mut self, request: PendingRequest) -> Result<(), ErrorCode> {
        if let Some(code) = &self.refuse {
            return Err(code.clone());
        }
        self.requests.push(request);
        Ok(())
    }
}
