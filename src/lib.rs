//! # collabd — realtime collaborative editing server
//!
//! WebSocket-based multiplayer editing over CRDT synchronization, with
//! room-scoped fan-out, bearer-token auth against a pluggable host, and
//! durable room snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   WebSocket (JSON)   ┌──────────────────┐
//! │  Client    │ ◄──────────────────► │  RealtimeServer  │
//! │ (browser)  │   base64 CRDT sync   └────────┬─────────┘
//! └────────────┘                               │
//!                         ┌────────────────────┼────────────────────┐
//!                         ▼                    ▼                    ▼
//!                 ┌──────────────┐    ┌────────────────┐   ┌────────────────┐
//!                 │ConnectionGtwy│    │  RoomManager   │   │PresenceTracker │
//!                 │ (auth seams) │    │ id → Room      │   │ (ephemeral)    │
//!                 └──────────────┘    └───────┬────────┘   └────────────────┘
//!                                             │
//!                                     ┌───────┴────────┐
//!                                     │ Room           │
//!                                     │  CollabDocument│──► SnapshotManager
//!                                     │  broadcast     │    (SQLite | files)
//!                                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope (ping/sync/presence/control)
//! - [`document`] — CRDT document engine over a Yrs text root
//! - [`room`] — room state machine, membership, broadcast fan-out
//! - [`manager`] — room registry with factories and idle cleanup
//! - [`presence`] — who is in a room and where their cursor is
//! - [`auth`] — bearer-token gateway and host-side trait seams
//! - [`snapshot`] — durable snapshots (database or filesystem backend)
//! - [`server`] — accept loop, session lifecycle, background sweeps
//! - [`hooks`] — lifecycle events for host integration
//! - [`config`] — `realtime.yml` loading with full defaults

pub mod auth;
pub mod config;
pub mod document;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod snapshot;

// Re-exports for convenience
pub use auth::{
    AccessError, AuthService, AuthUser, ConnectionGateway, ExtractedToken, Permissions,
    Record, RecordStore, TokenMethod,
};
pub use config::{RealtimeConfig, SnapshotStorageKind};
pub use document::CollabDocument;
pub use error::{RealtimeError, SnapshotError};
pub use hooks::{HookEmitter, HookEvent};
pub use manager::{RecordRoomFactory, RoomFactory, RoomManager, SharedRoom};
pub use presence::{PresenceState, PresenceTracker};
pub use protocol::{ClientMessage, PresenceEvent, ServerMessage};
pub use room::{ClientConnection, Room, RoomFrame, RoomLifecycle};
pub use server::{RealtimeServer, ServerStats};
pub use snapshot::{
    DatabaseSnapshotStore, FilesystemSnapshotStore, Snapshot, SnapshotManager, SnapshotStore,
};
