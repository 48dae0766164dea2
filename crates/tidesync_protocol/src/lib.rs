//! # tidesync protocol
//!
//! Wire types and CBOR codecs for the tidesync hub protocol.
//!
//! This crate provides:
//! - `Record` and `Identity`, the two halves of a row as the client sees it
//! - `Change` and `RequestMessage` for single mutations
//! - lot compression of transactions (`compress` / `uncompress`)
//! - `ErrorCode` and `ErrorPayload`
//! - handshake, load, reply and notification messages
//! - the `Schema` description
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod error;
mod lot;
mod messages;
mod schema;
mod types;

pub use change::{Change, RequestMessage};
pub use error::{ErrorCode, ErrorMessage, ErrorPayload};
pub use lot::{compress, uncompress, ColumnBlock, CompressedRequest, IdentityBlock, LotPolicy};
pub use messages::{
    HubEvent, InitializeResponse, Notification, Outgoing, Reply, ServerRecord, TableSnapshot,
    TransactionMessage,
};
pub use schema::{ColumnSchema, ColumnType, ConstraintSchema, Schema, TableSchema};
pub use types::{
    server_id_from_wire, Action, ClientId, Identity, Record, RequestId, ServerId, Tick,
    UNKNOWN_SERVER_ID,
};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;
