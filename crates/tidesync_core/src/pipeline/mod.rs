//! The request pipeline between the table store and the hub.
//!
//! Client operations hand [`PendingRequest`]s to a [`RequestSink`]; the
//! [`RequestPipeline`] groups them into transactions, bounds their total
//! size and keeps them until the hub answers.

mod buffer;
mod config;
mod request;

pub use buffer::{GroupKind, OpenTransaction, PipelineBacklog, RequestGroup, RequestPipeline};
pub use config::{PipelineConfig, DEFAULT_MAX_SIZE};
pub use request::{CollectingSink, DoneFn, PendingRequest, RequestSink, WithDone};
