//! Transport layer abstraction for the hub.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tidesync_protocol::{
    HubEvent, InitializeResponse, Outgoing, RequestMessage, TableSnapshot, TransactionMessage,
};

/// A hub transport carries the session to the hub and back.
///
/// Requests are fire-and-forget: the hub's answers arrive later through
/// [`poll_events`](HubTransport::poll_events), interleaved with
/// notifications in the order the hub produced them.
pub trait HubTransport: Send + Sync {
    /// Opens a new session.
    fn initialize(&self, area: &str, module_id: &str) -> SyncResult<InitializeResponse>;

    /// Fetches the full content of one table.
    fn load_table(&self, table: &str) -> SyncResult<TableSnapshot>;

    /// Sends a standalone request.
    fn execute_request(&self, request: &RequestMessage) -> SyncResult<()>;

    /// Sends a transaction.
    fn execute_transaction(&self, transaction: &TransactionMessage) -> SyncResult<()>;

    /// Takes every reply and notification received since the last call.
    fn poll_events(&self) -> SyncResult<Vec<HubEvent>>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> SyncResult<()>;
}

#[derive(Debug, Default)]
struct MockState {
    initialize: Option<InitializeResponse>,
    tables: HashMap<String, TableSnapshot>,
    events: VecDeque<HubEvent>,
    sent: Vec<Outgoing>,
}

/// A scripted transport for tests.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Creates a new, connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Sets the handshake response.
    pub fn set_initialize_response(&self, response: InitializeResponse) {
        self.state.lock().initialize = Some(response);
    }

    /// Sets the snapshot returned for a table.
    pub fn set_table(&self, snapshot: TableSnapshot) {
        self.state
            .lock()
            .tables
            .insert(snapshot.table.clone(), snapshot);
    }

    /// Queues an event for the next poll.
    pub fn push_event(&self, event: HubEvent) {
        self.state.lock().events.push_back(event);
    }

    /// Messages sent so far, oldest first.
    pub fn sent(&self) -> Vec<Outgoing> {
        self.state.lock().sent.clone()
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HubTransport for MockTransport {
    fn initialize(&self, _area: &str, _module_id: &str) -> SyncResult<InitializeResponse> {
        self.ensure_connected()?;
        self.state
            .lock()
            .initialize
            .clone()
            .ok_or_else(|| SyncError::Protocol("No mock initialize response set".into()))
    }

    fn load_table(&self, table: &str) -> SyncResult<TableSnapshot> {
        self.ensure_connected()?;
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| SyncError::Protocol(format!("No mock snapshot for table {table}")))
    }

    fn execute_request(&self, request: &RequestMessage) -> SyncResult<()> {
        self.ensure_connected()?;
        self.state
            .lock()
            .sent
            .push(Outgoing::Request(request.clone()));
        Ok(())
    }

    fn execute_transaction(&self, transaction: &TransactionMessage) -> SyncResult<()> {
        self.ensure_connected()?;
        self.state
            .lock()
            .sent
            .push(Outgoing::Transaction(transaction.clone()));
        Ok(())
    }

    fn poll_events(&self) -> SyncResult<Vec<HubEvent>> {
        self.ensure_connected()?;
        Ok(self.state.lock().events.drain(..).collect())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
