//! Room: the server-side unit of collaboration.
//!
//! A room exclusively owns one CRDT document, the set of connected clients,
//! and the version/update counters that drive snapshot scheduling. Fan-out
//! to room members goes through a tokio broadcast channel: every client gets
//! an independent receiver at join time, and the connection task filters out
//! frames it produced itself (origin-tag suppression).
//!
//! State machine:
//! ```text
//! EMPTY ──first join──► ACTIVE ──last leave──► IDLE ──sweep──► DESTROYED
//!                          ▲                     │
//!                          └───────rejoin────────┘
//! ```
//!
//! Rooms are never mutated concurrently: the server wraps each room in its
//! own mutex and holds it only across membership changes and
//! `apply_remote_update`. Everything in this module is therefore plain
//! single-writer code.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::Permissions;
use crate::document::CollabDocument;
use crate::error::RealtimeError;
use crate::presence::color_for_user;
use crate::protocol::ParticipantView;
use crate::snapshot::Snapshot;

/// Messages buffered per room member before a lagging receiver drops frames.
const BROADCAST_CAPACITY: usize = 256;

/// One frame fanned out to room members.
///
/// `from` carries the producing connection so receivers can suppress the
/// echo back to the sender.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    pub from: Uuid,
    pub payload: String,
}

/// A connected, authenticated client. Created at successful authentication,
/// destroyed at socket close, never persisted.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub client_id: Uuid,
    pub user_id: String,
    pub username: String,
    pub role: String,
    /// Computed once at join time and never re-checked mid-session.
    pub permissions: Permissions,
    pub room_id: String,
    pub connected_at: SystemTime,
    pub last_activity: Instant,
}

impl ClientConnection {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        role: impl Into<String>,
        permissions: Permissions,
        room_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            user_id: user_id.into(),
            username: username.into(),
            role: role.into(),
            permissions,
            room_id: room_id.into(),
            connected_at: SystemTime::now(),
            last_activity: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomLifecycle {
    Empty,
    Active,
    Idle,
    Destroyed,
}

/// Immutable view of a room, used both for late-joiner bootstrap and for
/// building a persisted snapshot.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: String,
    pub participants: Vec<ParticipantView>,
    /// Full encoded CRDT state.
    pub state: Vec<u8>,
    pub version: u64,
}

pub struct Room {
    room_id: String,
    room_type: String,
    document: CollabDocument,
    clients: HashMap<Uuid, ClientConnection>,
    version: u64,
    /// Updates accepted since the last successful snapshot.
    update_count: u64,
    created_at: SystemTime,
    last_activity: Instant,
    lifecycle: RoomLifecycle,
    initialized: bool,
    broadcast: broadcast::Sender<Arc<RoomFrame>>,
}

// Manual impl: `CollabDocument` holds a boxed observer closure, so `Debug`
// cannot be derived.
impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("room_id", &self.room_id)
            .field("room_type", &self.room_type)
            .field("clients", &self.clients)
            .field("version", &self.version)
            .field("update_count", &self.update_count)
            .field("created_at", &self.created_at)
            .field("last_activity", &self.last_activity)
            .field("lifecycle", &self.lifecycle)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl Room {
    pub fn new(room_id: impl Into<String>, room_type: impl Into<String>) -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            room_id: room_id.into(),
            room_type: room_type.into(),
            document: CollabDocument::new(),
            clients: HashMap::new(),
            version: 0,
            update_count: 0,
            created_at: SystemTime::now(),
            last_activity: Instant::now(),
            lifecycle: RoomLifecycle::Empty,
            initialized: false,
            broadcast,
        }
    }

    /// Seed the document from plain source text (or leave it empty).
    ///
    /// Idempotent: once a room is initialized, further calls are no-ops.
    pub fn initialize(&mut self, source_text: Option<&str>) {
        if self.initialized {
            return;
        }
        if let Some(text) = source_text {
            self.document.load_from_text(text);
        }
        self.initialized = true;
    }

    /// Restore the document and version from a persisted snapshot.
    ///
    /// Same idempotence contract as [`Room::initialize`].
    pub fn initialize_from_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), RealtimeError> {
        if self.initialized {
            return Ok(());
        }
        self.document.apply_update(&snapshot.snapshot_data, "snapshot")?;
        self.version = snapshot.version;
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Register a client; returns their broadcast receiver.
    pub fn add_client(&mut self, client: ClientConnection) -> broadcast::Receiver<Arc<RoomFrame>> {
        self.clients.insert(client.client_id, client);
        self.lifecycle = RoomLifecycle::Active;
        self.last_activity = Instant::now();
        self.subscribe()
    }

    /// A fresh receiver on the room's broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomFrame>> {
        self.broadcast.subscribe()
    }

    pub fn remove_client(&mut self, client_id: &Uuid) -> Option<ClientConnection> {
        let removed = self.clients.remove(client_id);
        if removed.is_some() {
            self.last_activity = Instant::now();
            if self.clients.is_empty() {
                self.lifecycle = RoomLifecycle::Idle;
            }
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client(&self, client_id: &Uuid) -> Option<&ClientConnection> {
        self.clients.get(client_id)
    }

    /// Whether any connected socket belongs to this user.
    pub fn has_user(&self, user_id: &str) -> bool {
        self.clients.values().any(|c| c.user_id == user_id)
    }

    /// Apply a remote CRDT update on behalf of `from_client`.
    ///
    /// Returns the room's new version. On a malformed payload the error is
    /// surfaced to the caller so only that client's message is rejected;
    /// the room and its other clients are unaffected.
    pub fn apply_remote_update(
        &mut self,
        update: &[u8],
        from_client: Uuid,
    ) -> Result<u64, RealtimeError> {
        self.document.apply_update(update, &from_client.to_string())?;
        self.version += 1;
        self.update_count += 1;
        self.last_activity = Instant::now();
        if let Some(client) = self.clients.get_mut(&from_client) {
            client.last_activity = Instant::now();
        }
        Ok(self.version)
    }

    /// Fan a frame out to every member's receiver. Returns the receiver
    /// count; zero receivers is not an error.
    pub fn broadcast(&self, frame: RoomFrame) -> usize {
        self.broadcast.send(Arc::new(frame)).unwrap_or(0)
    }

    /// Whether a snapshot is due: updates have accumulated past the cap, or
    /// the room has pending updates and has been quiet past the interval.
    pub fn needs_snapshot(&self, max_updates: u64, interval_secs: u64) -> bool {
        if self.update_count == 0 {
            return false;
        }
        self.update_count >= max_updates
            || self.last_activity.elapsed() >= Duration::from_secs(interval_secs)
    }

    /// Reset the update counter after a successful snapshot.
    pub fn mark_snapshotted(&mut self) {
        self.update_count = 0;
    }

    pub fn get_state(&self) -> RoomState {
        // Participants deduplicated by user (a user may hold several sockets)
        let mut participants: BTreeMap<String, ParticipantView> = BTreeMap::new();
        for client in self.clients.values() {
            participants
                .entry(client.user_id.clone())
                .or_insert_with(|| ParticipantView {
                    id: client.user_id.clone(),
                    name: client.username.clone(),
                    color: color_for_user(&client.user_id),
                });
        }
        RoomState {
            id: self.room_id.clone(),
            participants: participants.into_values().collect(),
            state: self.document.encode_state(),
            version: self.version,
        }
    }

    /// Final teardown; the room must not be used afterwards.
    pub fn teardown(&mut self) {
        self.clients.clear();
        self.lifecycle = RoomLifecycle::Destroyed;
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn room_type(&self) -> &str {
        &self.room_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn lifecycle(&self) -> RoomLifecycle {
        self.lifecycle
    }

    /// Seconds since the last join, leave, or accepted update.
    pub fn seconds_since_activity(&self) -> u64 {
        self.last_activity.elapsed().as_secs()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn document(&self) -> &CollabDocument {
        &self.document
    }

    #[cfg(test)]
    pub(crate) fn backdate_activity(&mut self, secs: u64) {
        self.last_activity = Instant::now()
            .checked_sub(Duration::from_secs(secs))
            .unwrap_or_else(Instant::now);
    }
}
