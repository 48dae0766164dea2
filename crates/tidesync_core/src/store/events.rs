//! Change events for observing the table store.
//!
//! Every visible change of a row fires one event after the change is
//! applied. Listeners subscribe with optional filters on table and client
//! id and are called synchronously, in registration order.
//!
//! # Usage
//!
//! ```rust,ignore
//! let id = db.add_event_listener(
//!     EventFilter::new(EventKind::Update).table("Contact"),
//!     Box::new(|event| println!("{:?}", event.record)),
//! );
//! db.remove_event_listener(id);
//! ```

use crate::store::table::ClientRecord;
use tidesync_protocol::{ClientId, ErrorPayload};

/// Kind of change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A row became live.
    Create,
    /// A live row changed.
    Update,
    /// A row was deleted.
    Delete,
    /// A table finished loading.
    Load,
    /// A batch of changes from another session starts.
    BeginNotification,
    /// A batch of changes from another session ends.
    EndNotification,
    /// A queued mutation was refused or could not be replayed.
    Error,
}

/// A single change event.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Type of event.
    pub kind: EventKind,
    /// Table concerned, if any.
    pub table: Option<String>,
    /// Row after the change.
    pub record: Option<ClientRecord>,
    /// Row before the change, for updates.
    pub previous: Option<ClientRecord>,
    /// Notification label.
    pub label: Option<String>,
    /// Errors, for `Error` events.
    pub errors: Option<ErrorPayload>,
}

impl ChangeEvent {
    fn new(kind: EventKind, table: Option<&str>) -> Self {
        Self {
            kind,
            table: table.map(str::to_string),
            record: None,
            previous: None,
            label: None,
            errors: None,
        }
    }

    /// Creates a create event.
    pub fn create(table: &str, record: ClientRecord) -> Self {
        Self {
            record: Some(record),
            ..Self::new(EventKind::Create, Some(table))
        }
    }

    /// Creates an update event.
    pub fn update(table: &str, previous: ClientRecord, record: ClientRecord) -> Self {
        Self {
            record: Some(record),
            previous: Some(previous),
            ..Self::new(EventKind::Update, Some(table))
        }
    }

    /// Creates a delete event.
    pub fn delete(table: &str, record: ClientRecord) -> Self {
        Self {
            record: Some(record),
            ..Self::new(EventKind::Delete, Some(table))
        }
    }

    /// Creates a load event.
    pub fn load(table: &str) -> Self {
        Self::new(EventKind::Load, Some(table))
    }

    /// Creates a notification boundary event.
    pub fn notification(begin: bool, label: Option<String>) -> Self {
        let kind = if begin {
            EventKind::BeginNotification
        } else {
            EventKind::EndNotification
        };
        Self {
            label,
            ..Self::new(kind, None)
        }
    }

    /// Creates an error event.
    pub fn error(table: Option<&str>, record: Option<ClientRecord>, errors: ErrorPayload) -> Self {
        Self {
            record,
            errors: Some(errors),
            ..Self::new(EventKind::Error, table)
        }
    }

    fn client_id(&self) -> Option<ClientId> {
        self.record.as_ref().map(|r| r.id)
    }
}

/// Which events a listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    kind: EventKind,
    table: Option<String>,
    client_id: Option<ClientId>,
}

impl EventFilter {
    /// Every event of one kind.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            table: None,
            client_id: None,
        }
    }

    /// Restricts to one table.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Restricts to one row.
    pub fn client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    fn matches(&self, event: &ChangeEvent) -> bool {
        self.kind == event.kind
            && self
                .table
                .as_deref()
                .map_or(true, |t| event.table.as_deref() == Some(t))
            && self
                .client_id
                .map_or(true, |id| event.client_id() == Some(id))
    }
}

/// Identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Callback invoked for matching events.
pub type Listener = Box<dyn FnMut(&ChangeEvent) + Send>;

/// Distributes change events to listeners.
#[derive(Default)]
pub struct EventFeed {
    listeners: Vec<(ListenerId, EventFilter, Listener)>,
    next_id: u64,
    muted: bool,
    emitted: u64,
}

impl EventFeed {
    /// Creates an empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn subscribe(&mut self, filter: EventFilter, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push((id, filter, listener));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _, _)| *l != id);
        self.listeners.len() != before
    }

    /// Emits an event to every matching listener.
    pub fn emit(&mut self, event: ChangeEvent) {
        if self.muted {
            return;
        }
        self.emitted += 1;
        for (_, filter, listener) in &mut self.listeners {
            if filter.matches(&event) {
                listener(&event);
            }
        }
    }

    /// Suppresses row events, used while a table loads.
    pub(crate) fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Moves every listener of `other` into this feed.
    pub fn adopt(&mut self, other: &mut EventFeed) {
        self.next_id = self.next_id.max(other.next_id);
        self.listeners.append(&mut other.listeners);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

impl std::fmt::Debug for EventFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFeed")
            .field("listeners", &self.listeners.len())
            .field("muted", &self.muted)
            .field("emitted", &self.emitted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tidesync_codec::Value;

    fn record(id: ClientId) -> ClientRecord {
        ClientRecord {
            id,
            values: vec![Value::from("x")],
            tick: 1,
            deleted: false,
        }
    }

    #[test]
    fn filters_by_kind_table_and_row() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut feed = EventFeed::new();
        let sink = Arc::clone(&seen);
        feed.subscribe(
            EventFilter::new(EventKind::Create).table("Contact").client_id(2),
            Box::new(move |e| sink.lock().unwrap().push(e.client_id())),
        );

        feed.emit(ChangeEvent::create("Contact", record(1)));
        feed.emit(ChangeEvent::create("Company", record(2)));
        feed.emit(ChangeEvent::delete("Contact", record(2)));
        feed.emit(ChangeEvent::create("Contact", record(2)));

        assert_eq!(*seen.lock().unwrap(), vec![Some(2)]);
        assert_eq!(feed.emitted(), 4);
    }

    #[test]
    fn unsubscribe_and_mute() {
        let count = Arc::new(Mutex::new(0));
        let mut feed = EventFeed::new();
        let sink = Arc::clone(&count);
        let id = feed.subscribe(
            EventFilter::new(EventKind::Load),
            Box::new(move |_| *sink.lock().unwrap() += 1),
        );

        feed.set_muted(true);
        feed.emit(ChangeEvent::load("Contact"));
        feed.set_muted(false);
        feed.emit(ChangeEvent::load("Contact"));
        assert!(feed.unsubscribe(id));
        assert!(!feed.unsubscribe(id));
        feed.emit(ChangeEvent::load("Contact"));

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn adopt_moves_listeners() {
        let mut old = EventFeed::new();
        old.subscribe(EventFilter::new(EventKind::Error), Box::new(|_| {}));
        let mut fresh = EventFeed::new();
        fresh.adopt(&mut old);
        assert_eq!(fresh.listener_count(), 1);
        assert_eq!(old.listener_count(), 0);
    }
}
