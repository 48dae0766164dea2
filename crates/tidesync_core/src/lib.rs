//! # tidesync core
//!
//! Client-side state of the tidesync offline sync engine.
//!
//! This crate provides:
//! - the table store, with a client id and a server id for every row
//! - field adapters converting user input to column values
//! - constraint indices and unique-constraint enforcement
//! - change events
//! - the request pipeline with transactions and a bounded offline buffer
//!
//! ## Key Invariants
//!
//! - A client id never changes while the session lives
//! - A server record is applied only when its tick is newer than the stored one
//! - A client operation that fails leaves no trace
//! - Rolling back a request restores the row exactly as it was before
//!
//! The crate performs no I/O: the sync engine feeds server records in and
//! takes requests out.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod error;
pub mod pipeline;
pub mod store;

pub use adapter::{FieldAdapter, TypedAdapter};
pub use error::{CoreError, CoreResult};
pub use pipeline::{
    CollectingSink, DoneFn, PendingRequest, PipelineBacklog, PipelineConfig, RequestGroup,
    RequestPipeline, RequestSink, WithDone, DEFAULT_MAX_SIZE,
};
pub use store::{ChangeEvent, ClientRecord, Database, EventFilter, EventKind, ListenerId, Table};
