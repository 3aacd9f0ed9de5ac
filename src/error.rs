//! Error taxonomy for the realtime subsystem.
//!
//! Two families:
//! - [`RealtimeError`] — protocol/connection-level failures. Some of these
//!   are terminal for the connection (auth, permission, limits), some are
//!   recovered in place (a single malformed update).
//! - [`SnapshotError`] — persistence failures. Always non-fatal: the caller
//!   logs a warning and moves on. A snapshot failure must never prevent a
//!   disconnect from completing.

use thiserror::Error;

/// Connection- and room-level errors.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Missing, invalid, or expired bearer token.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Caller lacks view access to the target record.
    ///
    /// A missing record deliberately maps here too (reason
    /// `record_not_found`), so unauthorized callers cannot probe for
    /// record existence.
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// Per-IP or per-user connection cap reached.
    #[error("connection limit exceeded: {0}")]
    ConnectionLimitExceeded(String),

    /// No room exists under the given id.
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// No factory is registered for the requested room type.
    #[error("unknown room type: {0}")]
    RoomTypeNotFound(String),

    /// The server-wide room cap is reached; no new rooms until a sweep.
    #[error("room limit reached ({0} rooms)")]
    RoomLimitReached(usize),

    /// Malformed CRDT update payload. Recoverable: only the offending
    /// message is rejected, the room and its other clients are unaffected.
    #[error("invalid document update: {0}")]
    InvalidUpdate(String),

    /// Malformed URL path or handshake.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RealtimeError {
    /// Stable wire code for the `control/error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::AuthenticationFailed(_) => "AUTH_FAILED",
            RealtimeError::PermissionDenied { .. } => "PERMISSION_DENIED",
            RealtimeError::ConnectionLimitExceeded(_) => "CONNECTION_LIMIT",
            RealtimeError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            RealtimeError::RoomTypeNotFound(_) => "ROOM_TYPE_NOT_FOUND",
            RealtimeError::RoomLimitReached(_) => "ROOM_LIMIT",
            RealtimeError::InvalidUpdate(_) => "INVALID_UPDATE",
            RealtimeError::Protocol(_) => "PROTOCOL_ERROR",
        }
    }

    /// Whether this error closes the connection.
    ///
    /// A malformed update from an already-joined client is dropped without
    /// closing; everything else that reaches the error path is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RealtimeError::InvalidUpdate(_))
    }

    pub fn permission_denied(reason: impl Into<String>) -> Self {
        RealtimeError::PermissionDenied { reason: reason.into() }
    }
}

/// Snapshot persistence errors. Logged as warnings, never propagated into
/// connection handling.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot database error: {0}")]
    Database(String),

    #[error("snapshot i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Serialization(String),

    /// The backend disabled itself (e.g. table creation failed at startup).
    #[error("snapshot storage is disabled")]
    Disabled,
}

impl From<rusqlite::Error> for SnapshotError {
    fn from(e: rusqlite::Error) -> Self {
        SnapshotError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(e: serde_json::Error) -> Self {
        SnapshotError::Serialization(e.to_string())
    }
}
