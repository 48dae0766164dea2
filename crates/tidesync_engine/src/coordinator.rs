//! The synchronization coordinator.
//!
//! A [`SyncCoordinator`] owns one live session (a [`Database`] and its
//! [`RequestPipeline`]) and drives it through the session state machine.
//! It is cooperative: nothing happens between calls. The host calls
//! [`poll`](SyncCoordinator::poll) to make progress and
//! [`heartbeat`](SyncCoordinator::heartbeat) to notice connection changes,
//! directly or through [`spawn_heartbeat`](crate::spawn_heartbeat).
//!
//! When the hub is lost the session keeps accepting mutations. Once the hub
//! is back a second session is built next to the current one, loaded, and
//! every buffered mutation is replayed onto it before it takes over.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::replay::Replay;
use crate::state::{SessionState, SyncStats};
use crate::transport::HubTransport;
use std::sync::Arc;
use std::time::Instant;
use tidesync_codec::Value;
use tidesync_core::store::{EventFilter, Listener, ListenerId};
use tidesync_core::{ClientRecord, Database, DoneFn, RequestPipeline, WithDone};
use tidesync_protocol::{
    ErrorPayload, HubEvent, InitializeResponse, Outgoing, Reply, RequestId, Schema,
    TableSnapshot,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Table-by-table load progress of a session.
#[derive(Debug)]
struct LoadCursor {
    tables: Vec<String>,
    next: usize,
    current: Option<(TableSnapshot, usize)>,
}

/// One session with the hub.
struct Session {
    id: Option<Uuid>,
    db: Database,
    pipeline: RequestPipeline,
    last_sequence_id: RequestId,
    replies: Vec<Reply>,
    load: Option<LoadCursor>,
}

impl Session {
    /// A session with no hub behind it, holding listeners until `start`.
    fn detached(config: &SyncConfig) -> SyncResult<Self> {
        Ok(Self {
            id: None,
            db: Database::new(Schema::default())?,
            pipeline: RequestPipeline::new(config.pipeline()),
            last_sequence_id: 0,
            replies: Vec::new(),
            load: None,
        })
    }

    fn open(response: InitializeResponse, config: &SyncConfig) -> SyncResult<Self> {
        let tables = response
            .schema
            .tables
            .iter()
            .map(|t| t.name.clone())
            .collect();
        let first_request_id = response.last_sequence_id + 1;
        Ok(Self {
            id: Some(response.session_id),
            db: Database::new(response.schema)?,
            pipeline: RequestPipeline::new(
                config.pipeline().with_first_request_id(first_request_id),
            ),
            last_sequence_id: response.last_sequence_id,
            replies: response.replies,
            load: Some(LoadCursor {
                tables,
                next: 0,
                current: None,
            }),
        })
    }

    /// Merges at most `budget` rows (0 means no limit). Returns whether
    /// every table is loaded, and the number of rows merged.
    fn load_step<T: HubTransport>(
        &mut self,
        transport: &T,
        budget: usize,
    ) -> SyncResult<(bool, usize)> {
        let Some(cursor) = self.load.as_mut() else {
            return Ok((true, 0));
        };
        let mut budget = if budget == 0 { usize::MAX } else { budget };
        let mut merged = 0;
        loop {
            if cursor.current.is_none() {
                let Some(table) = cursor.tables.get(cursor.next) else {
                    self.load = None;
                    return Ok((true, merged));
                };
                if budget == 0 {
                    return Ok((false, merged));
                }
                let snapshot = transport.load_table(table)?;
                debug!(
                    "loading {} rows of table {}",
                    snapshot.records.len(),
                    snapshot.table
                );
                cursor.next += 1;
                cursor.current = Some((snapshot, 0));
            }
            let Some((snapshot, offset)) = cursor.current.as_mut() else {
                continue;
            };
            let end = snapshot.records.len().min(offset.saturating_add(budget));
            let count = end - *offset;
            self.db
                .load_rows(&snapshot.table, snapshot.records[*offset..end].iter().cloned());
            *offset = end;
            budget -= count;
            merged += count;
            if end < snapshot.records.len() {
                return Ok((false, merged));
            }
            self.db.mark_loaded(&snapshot.table);
            self.last_sequence_id = self.last_sequence_id.max(snapshot.last_sequence_id);
            cursor.current = None;
        }
    }
}

/// Drives a local session against a hub.
pub struct SyncCoordinator<T: HubTransport> {
    config: SyncConfig,
    transport: Arc<T>,
    state: SessionState,
    session: Session,
    shadow: Option<Session>,
    stats: SyncStats,
    failures: u32,
    retry_at: Option<Instant>,
}

impl<T: HubTransport> SyncCoordinator<T> {
    /// Creates a coordinator. Nothing is sent until [`start`](Self::start).
    pub fn new(config: SyncConfig, transport: T) -> SyncResult<Self> {
        Self::with_shared_transport(config, Arc::new(transport))
    }

    /// Creates a coordinator over a transport the caller keeps a handle on.
    pub fn with_shared_transport(config: SyncConfig, transport: Arc<T>) -> SyncResult<Self> {
        let session = Session::detached(&config)?;
        Ok(Self {
            config,
            transport,
            state: SessionState::NotInitialized,
            session,
            shadow: None,
            stats: SyncStats::default(),
            failures: 0,
            retry_at: None,
        })
    }

    // === Accessors ===

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the statistics.
    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The local tables of the current session.
    pub fn database(&self) -> &Database {
        &self.session.db
    }

    /// The request buffer of the current session.
    pub fn pipeline(&self) -> &RequestPipeline {
        &self.session.pipeline
    }

    /// Identifier of the current hub session.
    pub fn session_id(&self) -> Option<Uuid> {
        self.session.id
    }

    /// Highest request id the hub has confirmed processing.
    pub fn last_sequence_id(&self) -> RequestId {
        self.session.last_sequence_id
    }

    /// Registers a listener. Listeners follow the coordinator across
    /// sessions.
    pub fn add_event_listener(&mut self, filter: EventFilter, listener: Listener) -> ListenerId {
        self.session.db.add_event_listener(filter, listener)
    }

    /// Removes a listener.
    pub fn remove_event_listener(&mut self, id: ListenerId) -> bool {
        self.session.db.remove_event_listener(id)
    }

    // === Lifecycle ===

    /// Opens the first session and starts loading it.
    ///
    /// # Errors
    ///
    /// Fails if a session is already open or the handshake fails. A
    /// retryable failure leaves the coordinator ready to start again.
    pub fn start(&mut self) -> SyncResult<()> {
        if !self.state.can_start() {
            return Err(SyncError::invalid_transition(self.state, "Initializing"));
        }
        self.set_state(SessionState::Initializing);
        let response = match self
            .transport
            .initialize(&self.config.area, &self.config.module_id)
        {
            Ok(response) => response,
            Err(error) => {
                self.stats.last_error = Some(error.to_string());
                let fallback = if error.is_retryable() {
                    SessionState::NotInitialized
                } else {
                    SessionState::Error
                };
                warn!("handshake failed: {}", error);
                self.set_state(fallback);
                return Err(error);
            }
        };

        let mut session = Session::open(response, &self.config)?;
        if !self.session.pipeline.is_idle() {
            warn!("discarding the buffer of a failed session");
        }
        session.db.adopt_listeners(&mut self.session.db);
        self.session = session;
        info!(
            "session {:?} opened for {}/{}",
            self.session.id, self.config.area, self.config.module_id
        );
        self.set_state(SessionState::Loading);
        Ok(())
    }

    /// Makes one bounded step of progress and returns the resulting state.
    ///
    /// While loading, at most `load_batch_rows` rows are merged. Once live,
    /// every event the transport received is handled and committed
    /// requests are sent. While resynchronizing, the new session is loaded
    /// and finally takes over.
    ///
    /// # Errors
    ///
    /// Fails on session-fatal errors; the state is then `Error`. Losing the
    /// hub is not an error: the state becomes `ReadyToSynchronize`.
    pub fn poll(&mut self) -> SyncResult<SessionState> {
        match self.state {
            SessionState::Loading => self.poll_load()?,
            SessionState::Loaded => {
                self.set_state(SessionState::Running);
                self.poll_running()?;
            }
            SessionState::Running => self.poll_running()?,
            SessionState::Synchronizing => self.poll_shadow()?,
            _ => {}
        }
        Ok(self.state)
    }

    /// Checks the connection; see [`heartbeat_at`](Self::heartbeat_at).
    pub fn heartbeat(&mut self) -> SyncResult<()> {
        self.heartbeat_at(Instant::now())
    }

    /// Checks the connection. A lost hub moves a live or loading session
    /// to `ReadyToSynchronize`; a hub that is back starts a
    /// resynchronization when `auto_reconnect` is set and the backoff
    /// delay has passed.
    ///
    /// # Errors
    ///
    /// Fails when a resynchronization attempt fails for good.
    pub fn heartbeat_at(&mut self, now: Instant) -> SyncResult<()> {
        let connected = self.transport.is_connected();
        match self.state {
            SessionState::Loading
            | SessionState::Loaded
            | SessionState::Running
            | SessionState::Synchronizing
                if !connected =>
            {
                warn!("hub connection lost while {}", self.state);
                self.shadow = None;
                self.set_state(SessionState::ReadyToSynchronize);
            }
            SessionState::ReadyToSynchronize if connected && self.config.auto_reconnect => {
                if self.retry_at.is_some_and(|at| now < at) {
                    return Ok(());
                }
                match self.synchronize() {
                    Err(error) if !error.is_retryable() => return Err(error),
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Starts building a fresh session next to the current one.
    ///
    /// The new session is loaded by subsequent polls; buffered mutations
    /// are then replayed onto it and it replaces the current session.
    ///
    /// # Errors
    ///
    /// Fails if the coordinator is not live or offline, if the handshake
    /// fails, or with [`SyncError::SchemaMismatch`] when the hub's schema
    /// changed. A schema change is session-fatal.
    pub fn synchronize(&mut self) -> SyncResult<()> {
        if !self.state.can_synchronize() {
            return Err(SyncError::invalid_transition(self.state, "Synchronizing"));
        }
        self.set_state(SessionState::Synchronizing);
        match self.open_shadow() {
            Ok(()) => Ok(()),
            Err(error) => Err(self.synchronization_failed(error)),
        }
    }

    /// Closes the transport. Mutations keep buffering until the next
    /// resynchronization.
    pub fn close(&mut self) -> SyncResult<()> {
        self.transport.close()?;
        self.shadow = None;
        if self.state.is_loaded() {
            self.set_state(SessionState::ReadyToSynchronize);
        }
        Ok(())
    }

    // === Client operations ===

    /// Creates a row. `done` is called once the hub confirms or refuses
    /// the request, or the request is discarded by a resynchronization.
    pub fn add(
        &mut self,
        table: &str,
        values: Vec<Value>,
        done: Option<DoneFn>,
    ) -> Result<ClientRecord, ErrorPayload> {
        self.ensure_loaded()?;
        let session = &mut self.session;
        let mut sink = WithDone::new(&mut session.pipeline, done);
        session.db.add_from_client(&mut sink, table, values)
    }

    /// Changes a row. `old` must be the row as currently stored.
    pub fn update(
        &mut self,
        table: &str,
        old: &ClientRecord,
        values: Vec<Value>,
        done: Option<DoneFn>,
    ) -> Result<ClientRecord, ErrorPayload> {
        self.ensure_loaded()?;
        let session = &mut self.session;
        let mut sink = WithDone::new(&mut session.pipeline, done);
        session.db.update_from_client(&mut sink, table, old, values)
    }

    /// Soft-deletes a row. `record` must be the row as currently stored.
    pub fn delete(
        &mut self,
        table: &str,
        record: &ClientRecord,
        done: Option<DoneFn>,
    ) -> Result<ClientRecord, ErrorPayload> {
        self.ensure_loaded()?;
        let session = &mut self.session;
        let mut sink = WithDone::new(&mut session.pipeline, done);
        session.db.delete_from_client(&mut sink, table, record)
    }

    /// Opens a transaction, or nests into the open one. Returns the depth.
    pub fn begin_transaction(&mut self, label: Option<String>, notify: bool) -> usize {
        self.session.pipeline.begin_transaction(label, notify)
    }

    /// Closes one nesting level of the open transaction.
    pub fn end_transaction(&mut self) -> SyncResult<usize> {
        Ok(self.session.pipeline.end_transaction()?)
    }

    /// Commits the buffered groups and, when live, sends them.
    pub fn commit(&mut self) -> SyncResult<Vec<RequestId>> {
        let ids = self.session.pipeline.commit();
        if self.state == SessionState::Running {
            if let Err(error) = self.flush() {
                self.on_error(error)?;
            }
        }
        Ok(ids)
    }

    /// Undoes every uncommitted mutation, newest first. Returns the number
    /// of requests undone.
    pub fn rollback(&mut self) -> usize {
        let session = &mut self.session;
        let undone = session.pipeline.rollback(&mut session.db);
        self.stats.requests_rolled_back += undone as u64;
        undone
    }

    // === Internals ===

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("session state {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn ensure_loaded(&self) -> Result<(), ErrorPayload> {
        if self.state.is_loaded() {
            Ok(())
        } else {
            Err(SyncError::invalid_transition(self.state, "mutation").to_payload())
        }
    }

    /// Routes a failure of the live session: losing the hub is recoverable,
    /// anything else is fatal.
    fn on_error(&mut self, error: SyncError) -> SyncResult<()> {
        self.stats.last_error = Some(error.to_string());
        self.shadow = None;
        if error.is_retryable() {
            warn!("hub unreachable: {}", error);
            self.set_state(SessionState::ReadyToSynchronize);
            Ok(())
        } else {
            error!("session failed: {}", error);
            self.session.db.emit_error(None, None, error.to_payload());
            self.set_state(SessionState::Error);
            Err(error)
        }
    }

    fn poll_load(&mut self) -> SyncResult<()> {
        let step = self
            .session
            .load_step(self.transport.as_ref(), self.config.load_batch_rows);
        match step {
            Ok((done, rows)) => {
                self.stats.rows_loaded += rows as u64;
                if done {
                    info!("session {:?} loaded", self.session.id);
                    self.stats.last_sync_time = Some(Instant::now());
                    self.set_state(SessionState::Loaded);
                }
                Ok(())
            }
            Err(error) => self.on_error(error),
        }
    }

    fn poll_running(&mut self) -> SyncResult<()> {
        let events = match self.transport.poll_events() {
            Ok(events) => events,
            Err(error) => return self.on_error(error),
        };
        if !events.is_empty() {
            self.stats.last_sync_time = Some(Instant::now());
        }
        for event in events {
            self.handle_event(event);
        }
        match self.flush() {
            Ok(_) => Ok(()),
            Err(error) => self.on_error(error),
        }
    }

    fn handle_event(&mut self, event: HubEvent) {
        let session = &mut self.session;
        match event {
            HubEvent::Reply(reply) => {
                let id = reply.request_id;
                session.last_sequence_id = session.last_sequence_id.max(id);
                match reply.outcome {
                    Ok(records) => match session.pipeline.acknowledge(id) {
                        Some(mut group) => {
                            session.db.apply_reply(records);
                            for request in &mut group.requests {
                                request.complete(Ok(()));
                            }
                            self.stats.groups_acknowledged += 1;
                        }
                        None => warn!("reply for unknown request {} dropped", id),
                    },
                    Err(errors) => {
                        if session.pipeline.fail(id, &errors, &mut session.db) {
                            self.stats.groups_failed += 1;
                        } else {
                            warn!("failure for unknown request {} dropped: {}", id, errors);
                        }
                    }
                }
            }
            HubEvent::Notification(notification) => {
                session
                    .db
                    .apply_notification(notification.label, notification.records);
                self.stats.notifications += 1;
            }
        }
    }

    /// Hands every committed, untransmitted group to the transport.
    fn flush(&mut self) -> SyncResult<usize> {
        let messages = self
            .session
            .pipeline
            .untransmitted(self.session.db.schema())?;
        let count = messages.len();
        for message in messages {
            match &message {
                Outgoing::Request(request) => self.transport.execute_request(request)?,
                Outgoing::Transaction(transaction) => {
                    self.transport.execute_transaction(transaction)?
                }
            }
            if let Some(id) = message.request_id() {
                self.session.pipeline.mark_transmitted(id);
            }
            self.stats.groups_sent += 1;
        }
        Ok(count)
    }

    fn open_shadow(&mut self) -> SyncResult<()> {
        let response = self
            .transport
            .initialize(&self.config.area, &self.config.module_id)?;
        if !self.session.db.schema().compatible_with(&response.schema) {
            return Err(SyncError::SchemaMismatch);
        }
        let mut shadow = Session::open(response, &self.config)?;
        shadow
            .pipeline
            .advance_request_id(self.session.pipeline.next_request_id());
        debug!(
            "resynchronizing into session {:?}, hub processed up to {}",
            shadow.id, shadow.last_sequence_id
        );
        self.shadow = Some(shadow);
        Ok(())
    }

    /// Abandons a resynchronization attempt. Retryable failures back off
    /// until the retry budget is spent.
    fn synchronization_failed(&mut self, error: SyncError) -> SyncError {
        self.shadow = None;
        self.stats.last_error = Some(error.to_string());
        if error.is_retryable() {
            self.failures += 1;
            if !self.config.retry.exhausted(self.failures) {
                let delay = self.config.retry.delay_for_attempt(self.failures);
                warn!(
                    "resynchronization attempt {} failed, next in {:?}: {}",
                    self.failures, delay, error
                );
                self.retry_at = Some(Instant::now() + delay);
                self.set_state(SessionState::ReadyToSynchronize);
                return error;
            }
            error!("giving up after {} resynchronization attempts", self.failures);
        } else {
            error!("resynchronization failed: {}", error);
        }
        self.session.db.emit_error(None, None, error.to_payload());
        self.set_state(SessionState::Error);
        error
    }

    fn poll_shadow(&mut self) -> SyncResult<()> {
        let Some(shadow) = self.shadow.as_mut() else {
            self.set_state(SessionState::ReadyToSynchronize);
            return Ok(());
        };
        match shadow.load_step(self.transport.as_ref(), self.config.load_batch_rows) {
            Ok((done, rows)) => {
                self.stats.rows_loaded += rows as u64;
                if done {
                    self.swap();
                    return self.poll_running();
                }
                Ok(())
            }
            Err(error) => {
                let error = self.synchronization_failed(error);
                if error.is_retryable() {
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }
    }

    /// Replays the buffer onto the loaded shadow session and lets it take
    /// over.
    fn swap(&mut self) {
        let Some(mut shadow) = self.shadow.take() else {
            return;
        };
        let backlog = self.session.pipeline.take_backlog();
        shadow.pipeline.advance_request_id(backlog.next_request_id);
        let processed = shadow.last_sequence_id;
        let replies = std::mem::take(&mut shadow.replies);

        let (replayed, discarded) = {
            let mut replay = Replay::new(&mut self.session.db, &mut shadow.db, &mut shadow.pipeline);
            let mut skipped = 0;
            for (id, group) in backlog.sent {
                if id <= processed {
                    replay.skip(id, group, &replies);
                    skipped += 1;
                } else {
                    replay.group(group);
                }
            }
            if skipped > 0 {
                debug!("{} request groups were processed before the session was lost", skipped);
            }
            replay.commit();
            for group in backlog.pending {
                replay.group(group);
            }
            if let Some(open) = backlog.open {
                replay.open(open);
            }
            replay.finish()
        };

        shadow.db.adopt_listeners(&mut self.session.db);
        let tables: Vec<String> = shadow
            .db
            .tables()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        for table in &tables {
            shadow.db.mark_loaded(table);
        }
        self.session = shadow;

        self.stats.groups_replayed += replayed;
        self.stats.groups_failed += discarded;
        self.stats.resynchronizations += 1;
        self.stats.last_sync_time = Some(Instant::now());
        self.failures = 0;
        self.retry_at = None;
        info!(
            "session {:?} took over: {} groups replayed, {} discarded",
            self.session.id, replayed, discarded
        );
        self.set_state(SessionState::Running);
    }
}

impl<T: HubTransport> std::fmt::Debug for SyncCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("state", &self.state)
            .field("session_id", &self.session.id)
            .field("last_sequence_id", &self.session.last_sequence_id)
            .field("synchronizing", &self.shadow.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use tidesync_protocol::{Record, ServerRecord};
    use tidesync_testkit::{company, crm_schema, init_tracing};

    fn scripted(last_sequence_id: RequestId) -> MockTransport {
        init_tracing();
        let transport = MockTransport::new();
        transport.set_initialize_response(InitializeResponse {
            session_id: Uuid::new_v4(),
            schema: crm_schema(),
            last_sequence_id,
            replies: Vec::new(),
        });
        let companies = (1..=5)
            .map(|i| Record::new(Some(i), company(&format!("Company {i}"), None), 1))
            .collect();
        let tables = [("Company", companies), ("Contact", Vec::new()), ("Note", Vec::new())];
        for (table, records) in tables {
            transport.set_table(TableSnapshot {
                table: table.to_string(),
                records,
                last_sequence_id,
            });
        }
        transport
    }

    fn coordinator(batch: usize) -> SyncCoordinator<MockTransport> {
        let config = SyncConfig::new("crm", "contacts").with_load_batch_rows(batch);
        SyncCoordinator::new(config, scripted(0)).unwrap()
    }

    fn run_until_live(coordinator: &mut SyncCoordinator<MockTransport>) -> usize {
        let mut polls = 0;
        while coordinator.poll().unwrap() != SessionState::Running {
            polls += 1;
            assert!(polls < 100, "session never went live");
        }
        polls
    }

    #[test]
    fn load_is_batched() {
        let mut coordinator = coordinator(2);
        coordinator.start().unwrap();
        assert_eq!(coordinator.state(), SessionState::Loading);

        assert_eq!(coordinator.poll().unwrap(), SessionState::Loading);
        assert_eq!(coordinator.database().live_rows("Company").len(), 2);
        run_until_live(&mut coordinator);
        assert_eq!(coordinator.database().live_rows("Company").len(), 5);
        assert_eq!(coordinator.stats().rows_loaded, 5);
    }

    #[test]
    fn mutations_wait_for_the_load() {
        let mut coordinator = coordinator(0);
        assert!(coordinator.add("Company", company("Early", None), None).is_err());
        coordinator.start().unwrap();
        assert!(coordinator.add("Company", company("Early", None), None).is_err());
        run_until_live(&mut coordinator);
        coordinator.add("Company", company("Late", None), None).unwrap();
    }

    #[test]
    fn committed_requests_continue_after_processed_ids() {
        let config = SyncConfig::new("crm", "contacts");
        let mut coordinator = SyncCoordinator::new(config, scripted(41)).unwrap();
        coordinator.start().unwrap();
        run_until_live(&mut coordinator);

        coordinator.add("Company", company("Acme", None), None).unwrap();
        assert_eq!(coordinator.commit().unwrap(), vec![42]);
        assert_eq!(coordinator.transport().sent().len(), 1);
        assert_eq!(coordinator.stats().groups_sent, 1);

        assert_eq!(coordinator.database().live_rows("Company").len(), 6);
    }

    #[test]
    fn reply_acknowledges_and_binds() {
        let mut coordinator = coordinator(0);
        coordinator.start().unwrap();
        run_until_live(&mut coordinator);

        let acme = coordinator.add("Company", company("Acme", None), None).unwrap();
        let ids = coordinator.commit().unwrap();
        let Outgoing::Request(sent) = &coordinator.transport().sent()[0] else {
            panic!("expected a single request");
        };
        let mut confirmed =
            ServerRecord::new("Company", Record::new(Some(77), company("Acme", None), 1));
        confirmed.identity = Some(sent.change.identity().clone());
        coordinator
            .transport()
            .push_event(HubEvent::Reply(Reply::success(ids[0], vec![confirmed])));
        coordinator.poll().unwrap();

        assert!(coordinator.pipeline().is_idle());
        assert_eq!(
            coordinator.database().server_id_for_client_id("Company", acme.id),
            Some(77)
        );
        assert_eq!(coordinator.last_sequence_id(), ids[0]);
        assert_eq!(coordinator.stats().groups_acknowledged, 1);
    }

    #[test]
    fn lost_hub_buffers_until_heartbeat_resynchronizes() {
        let mut coordinator = coordinator(0);
        coordinator.start().unwrap();
        run_until_live(&mut coordinator);

        coordinator.transport().set_connected(false);
        coordinator.heartbeat().unwrap();
        assert_eq!(coordinator.state(), SessionState::ReadyToSynchronize);

        coordinator.add("Company", company("Offline", None), None).unwrap();
        coordinator.commit().unwrap();
        assert!(coordinator.transport().sent().is_empty());

        coordinator.transport().set_connected(true);
        coordinator.heartbeat().unwrap();
        assert_eq!(coordinator.state(), SessionState::Synchronizing);
        run_until_live(&mut coordinator);

        assert_eq!(coordinator.stats().resynchronizations, 1);
        assert_eq!(coordinator.transport().sent().len(), 1);
        assert_eq!(coordinator.database().live_rows("Company").len(), 6);
    }

    #[test]
    fn schema_change_is_fatal() {
        let mut coordinator = coordinator(0);
        coordinator.start().unwrap();
        run_until_live(&mut coordinator);

        let mut schema = crm_schema();
        schema.tables.pop();
        coordinator.transport().set_initialize_response(InitializeResponse {
            session_id: Uuid::new_v4(),
            schema,
            last_sequence_id: 0,
            replies: Vec::new(),
        });
        let error = coordinator.synchronize().unwrap_err();
        assert!(matches!(error, SyncError::SchemaMismatch));
        assert_eq!(coordinator.state(), SessionState::Error);
    }

    #[test]
    fn start_twice_is_refused() {
        let mut coordinator = coordinator(0);
        coordinator.start().unwrap();
        assert!(matches!(
            coordinator.start(),
            Err(SyncError::InvalidStateTransition { .. })
        ));
    }
}
