//! Session state machine and statistics.

use std::fmt;
use std::time::Instant;

/// The state of a synchronization session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No handshake has been made.
    NotInitialized,
    /// Handshake in progress.
    Initializing,
    /// Tables are being loaded.
    Loading,
    /// Every table is loaded; the session goes live on the next poll.
    Loaded,
    /// Live: replies and notifications flow, committed requests are sent.
    Running,
    /// The hub is unreachable; mutations keep buffering.
    ReadyToSynchronize,
    /// A fresh session is being built next to the current one.
    Synchronizing,
    /// A session-fatal error occurred.
    Error,
}

impl SessionState {
    /// Returns true if the local tables are fully loaded and accept
    /// client operations.
    pub fn is_loaded(&self) -> bool {
        matches!(
            self,
            SessionState::Loaded
                | SessionState::Running
                | SessionState::ReadyToSynchronize
                | SessionState::Synchronizing
        )
    }

    /// Returns true if a handshake may be started from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::NotInitialized | SessionState::Error)
    }

    /// Returns true if a resynchronization may be started from this state.
    pub fn can_synchronize(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::ReadyToSynchronize)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Statistics about a coordinator's sessions.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Request groups handed to the transport.
    pub groups_sent: u64,
    /// Request groups the hub confirmed.
    pub groups_acknowledged: u64,
    /// Request groups the hub refused or replay discarded.
    pub groups_failed: u64,
    /// Requests undone by an explicit rollback.
    pub requests_rolled_back: u64,
    /// Notifications merged.
    pub notifications: u64,
    /// Request groups replayed onto a fresh session.
    pub groups_replayed: u64,
    /// Completed resynchronizations.
    pub resynchronizations: u64,
    /// Rows merged while loading.
    pub rows_loaded: u64,
    /// Last successful round with the hub.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}
