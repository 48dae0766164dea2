//! Replay of buffered mutations onto a freshly loaded session.
//!
//! Client ids are local to a session. Every id a buffered request names is
//! translated through its server id, or through the creations replayed
//! earlier in the same pass, before the request is re-run through the new
//! session's client operations. The fresh snapshot is authoritative: a
//! request whose row vanished or changed since it was made is discarded.

use std::collections::HashMap;
use tidesync_codec::Value;
use tidesync_core::pipeline::{GroupKind, OpenTransaction};
use tidesync_core::store::{client_id_value, TableId};
use tidesync_core::{
    ClientRecord, Database, DoneFn, PendingRequest, RequestGroup, RequestPipeline, RequestSink,
    WithDone,
};
use tidesync_protocol::{
    Change, ClientId, ErrorCode, ErrorPayload, Identity, Record, Reply, RequestId,
};
use tracing::{debug, warn};

/// Old client id to new client id, for rows created during the replay.
type Created = HashMap<(TableId, ClientId), ClientId>;

/// One replay pass from the session being replaced into its successor.
pub(crate) struct Replay<'a> {
    old: &'a mut Database,
    db: &'a mut Database,
    pipeline: &'a mut RequestPipeline,
    created: Created,
    replayed: u64,
    discarded: u64,
}

impl<'a> Replay<'a> {
    pub(crate) fn new(
        old: &'a mut Database,
        db: &'a mut Database,
        pipeline: &'a mut RequestPipeline,
    ) -> Self {
        Self {
            old,
            db,
            pipeline,
            created: HashMap::new(),
            replayed: 0,
            discarded: 0,
        }
    }

    /// Settles a group the hub processed before the old session was lost.
    ///
    /// A stored reply teaches the old session the server ids of the rows
    /// the group created, so later requests naming them still translate.
    pub(crate) fn skip(&mut self, id: RequestId, mut group: RequestGroup, replies: &[Reply]) {
        let outcome = match replies.iter().find(|reply| reply.request_id == id) {
            Some(Reply {
                outcome: Ok(records),
                ..
            }) => {
                self.old.apply_reply(records.clone());
                Ok(())
            }
            Some(Reply {
                outcome: Err(errors),
                ..
            }) => {
                let table = group.requests.first().map(|r| r.table_name.clone());
                self.old.emit_error(table.as_deref(), None, errors.clone());
                Err(errors.clone())
            }
            None => {
                debug!("request {} processed, reply no longer stored", id);
                Ok(())
            }
        };
        for request in &mut group.requests {
            request.complete(outcome.clone());
        }
    }

    /// Replays a committed or pending group as a new pending group.
    pub(crate) fn group(&mut self, group: RequestGroup) {
        let requests = group.requests;
        let kept = match group.kind {
            GroupKind::Single => {
                let mut kept = true;
                for request in requests {
                    let table = request.table_name.clone();
                    if let Err((errors, done)) = self.request(request) {
                        self.discard(&table, errors, done.into_iter().collect());
                        kept = false;
                    }
                }
                kept
            }
            GroupKind::Transaction { label, notify } => {
                self.pipeline.begin_transaction(label, notify);
                let kept = self.transaction(requests).is_ok();
                if kept {
                    if let Err(error) = self.pipeline.end_transaction() {
                        warn!("replayed transaction could not be closed: {}", error);
                    }
                }
                kept
            }
        };
        self.count(kept);
    }

    /// Moves the replayed groups to the sent queue.
    pub(crate) fn commit(&mut self) -> Vec<RequestId> {
        self.pipeline.commit()
    }

    /// Replays the transaction the application still has open, at the same
    /// nesting depth. It stays open even when its requests are discarded.
    pub(crate) fn open(&mut self, open: OpenTransaction) {
        for _ in 0..open.depth {
            self.pipeline
                .begin_transaction(open.label.clone(), open.notify);
        }
        let kept = self.transaction(open.requests).is_ok();
        if !kept {
            for _ in 0..open.depth {
                self.pipeline
                    .begin_transaction(open.label.clone(), open.notify);
            }
        }
        self.count(kept);
    }

    /// Groups replayed and groups discarded.
    pub(crate) fn finish(self) -> (u64, u64) {
        (self.replayed, self.discarded)
    }

    fn count(&mut self, kept: bool) {
        if kept {
            self.replayed += 1;
        } else {
            self.discarded += 1;
        }
    }

    /// Replays requests into the open transaction. On the first failure
    /// everything replayed so far is undone and every callback of the
    /// group receives the error.
    fn transaction(&mut self, requests: Vec<PendingRequest>) -> Result<(), ErrorPayload> {
        let mut requests = requests.into_iter();
        while let Some(request) = requests.next() {
            let table = request.table_name.clone();
            if let Err((errors, done)) = self.request(request) {
                let mut callbacks: Vec<DoneFn> = self
                    .pipeline
                    .abort_transaction(self.db)
                    .into_iter()
                    .filter_map(|mut r| r.done.take())
                    .collect();
                callbacks.extend(done);
                callbacks.extend(requests.filter_map(|mut r| r.done.take()));
                self.discard(&table, errors.clone(), callbacks);
                return Err(errors);
            }
        }
        Ok(())
    }

    fn request(
        &mut self,
        mut request: PendingRequest,
    ) -> Result<(), (ErrorPayload, Option<DoneFn>)> {
        let done = request.done.take();
        let mut sink = WithDone::new(&mut *self.pipeline, done);
        let outcome = replay_change(self.old, self.db, &mut self.created, &mut sink, &request);
        let done = sink.into_done();
        outcome.map_err(|errors| (errors, done))
    }

    fn discard(&mut self, table: &str, errors: ErrorPayload, callbacks: Vec<DoneFn>) {
        debug!("replayed request on {} discarded: {}", table, errors);
        for done in callbacks {
            done(Err(errors.clone()));
        }
        self.old.emit_error(Some(table), None, errors);
    }
}

fn replay_change(
    old: &Database,
    db: &mut Database,
    created: &mut Created,
    sink: &mut dyn RequestSink,
    request: &PendingRequest,
) -> Result<(), ErrorPayload> {
    let table = request.table_name.as_str();
    let t = db
        .table_id(table)
        .ok_or_else(|| ErrorPayload::global(ErrorCode::UnableSynchronization))?;
    match &request.change {
        Change::Create { record, identity } => {
            let values = client_values(old, db, created, t, record, identity)?;
            let row = db.add_from_client(sink, table, values)?;
            created.insert((t, identity.client_id), row.id);
        }
        Change::Update {
            old: before,
            new,
            old_identity,
            new_identity,
        } => {
            let current = current_row(old, db, created, t, before, old_identity)?;
            let values = client_values(old, db, created, t, new, new_identity)?;
            db.update_from_client(sink, table, &current, values)?;
        }
        Change::Delete { record, identity } => {
            let current = current_row(old, db, created, t, record, identity)?;
            db.delete_from_client(sink, table, &current)?;
        }
    }
    Ok(())
}

/// Maps a client id of the old session to the new session.
fn translate(
    old: &Database,
    db: &Database,
    created: &Created,
    t: TableId,
    client_id: ClientId,
) -> Option<ClientId> {
    let table = db.tables()[t].name();
    old.server_id_for_client_id(table, client_id)
        .and_then(|server_id| db.client_id_for_server_id(table, server_id))
        .or_else(|| created.get(&(t, client_id)).copied())
}

/// Values of a buffered record in the new session's client-id space.
fn client_values(
    old: &Database,
    db: &Database,
    created: &Created,
    t: TableId,
    record: &Record,
    identity: &Identity,
) -> Result<Vec<Value>, ErrorPayload> {
    let table = &db.tables()[t];
    let mut values = record.values.clone();
    for (slot, fk) in table.foreign_keys().iter().enumerate() {
        let target = db.tables()[fk.target].name();
        let translated = match identity.foreign.get(slot).copied().flatten() {
            Some(client_id) => translate(old, db, created, fk.target, client_id),
            None => match values.get(fk.column) {
                Some(Value::Integer(server_id)) => db.client_id_for_server_id(target, *server_id),
                _ => continue,
            },
        };
        match translated {
            Some(client_id) => values[fk.column] = client_id_value(client_id),
            None => {
                let column = &table.schema().columns[fk.column].name;
                return Err(ErrorPayload::field(column.clone(), ErrorCode::FieldBadFormat));
            }
        }
    }
    Ok(values)
}

/// The new session's row a buffered update or delete was based on. It must
/// be live and hold the values the request saw.
fn current_row(
    old: &Database,
    db: &Database,
    created: &Created,
    t: TableId,
    based_on: &Record,
    identity: &Identity,
) -> Result<ClientRecord, ErrorPayload> {
    let table = db.tables()[t].name();
    let current = translate(old, db, created, t, identity.client_id)
        .and_then(|client_id| db.get_row_by_id(table, client_id))
        .ok_or_else(|| ErrorPayload::global(ErrorCode::RecordDeleted))?;
    if current.deleted {
        return Err(ErrorPayload::global(ErrorCode::RecordDeleted));
    }
    let expected = client_values(old, db, created, t, based_on, identity)
        .map_err(|_| ErrorPayload::global(ErrorCode::RecordDifferent))?;
    if current.values != expected {
        return Err(ErrorPayload::global(ErrorCode::RecordDifferent));
    }
    Ok(current)
}
