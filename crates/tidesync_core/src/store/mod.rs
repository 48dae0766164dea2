//! The table store.

mod database;
mod deferred;
mod events;
mod index;
mod table;

pub use database::Database;
pub use deferred::{DeferredSlots, Slot, StoreSignal, TableId};
pub use events::{ChangeEvent, EventFeed, EventFilter, EventKind, Listener, ListenerId};
pub use index::ConstraintIndex;
pub use table::{client_id_value, ClientRecord, ForeignKey, Table};
