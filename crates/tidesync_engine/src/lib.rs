//! # tidesync Engine
//!
//! Session coordinator for tidesync clients.
//!
//! This crate provides:
//! - Session state machine (handshake → load → running → resynchronize)
//! - Batched table loading
//! - Reply and notification dispatch
//! - Resynchronization with replay of buffered mutations
//! - Reconnect backoff
//! - Hub transport abstraction
//! - Background heartbeat on tokio
//!
//! ## Architecture
//!
//! The engine sits between the application and the hub:
//! 1. Client operations apply locally at once and buffer a request
//! 2. Committed requests are sent; replies confirm or roll them back
//! 3. Changes made by other sessions arrive as notifications
//!
//! While the hub is unreachable nothing is sent and mutations keep
//! buffering. When it comes back a fresh session is loaded next to the
//! current one, the buffer is replayed onto it, and it takes over.
//!
//! ## Key Invariants
//!
//! - The hub is authoritative
//! - Requests the hub already processed are never sent twice
//! - Request ids keep increasing across sessions
//! - A replayed group lands whole or not at all
//! - Listeners survive a session swap

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod error;
mod heartbeat;
mod replay;
mod state;
mod transport;

pub use config::{RetryConfig, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use error::{SyncError, SyncResult};
pub use heartbeat::spawn_heartbeat;
pub use state::{SessionState, SyncStats};
pub use transport::{HubTransport, MockTransport};
