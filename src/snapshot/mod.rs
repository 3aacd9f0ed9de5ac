//! Durable room snapshots for fast recovery.
//!
//! ```text
//! ┌──────────┐  needs_snapshot?   ┌─────────────────┐
//! │  Room    │ ─────────────────► │ SnapshotManager │
//! │ (CRDT)   │   encoded state    └────────┬────────┘
//! └──────────┘                             │ storage strategy
//!                              ┌───────────┴───────────┐
//!                              ▼                       ▼
//!                     ┌────────────────┐     ┌──────────────────┐
//!                     │ database       │     │ filesystem       │
//!                     │ (SQLite blobs) │     │ (one file/room)  │
//!                     └────────────────┘     └──────────────────┘
//! ```
//!
//! Both backends satisfy the same contract: last-write-wins per room id,
//! and `load` returns the most recent snapshot for a room or `None`.
//! Persistence failures are never fatal — callers log a warning and carry
//! on; a failed snapshot must never block a disconnect.

pub mod database;
pub mod filesystem;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::config::{SnapshotStorageKind, SnapshotsConfig};
use crate::error::SnapshotError;

pub use database::DatabaseSnapshotStore;
pub use filesystem::FilesystemSnapshotStore;

/// A point-in-time binary capture of a room's CRDT state.
///
/// Decoding `snapshot_data` into a fresh document must reproduce text
/// byte-identical to the room at the moment the snapshot was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub room_id: String,
    pub version: u64,
    pub snapshot_data: Vec<u8>,
    /// Seconds since the Unix epoch.
    pub created_at: i64,
}

impl Snapshot {
    pub fn new(room_id: impl Into<String>, snapshot_data: Vec<u8>, version: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.into(),
            version,
            snapshot_data,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64,
        }
    }
}

/// Pluggable snapshot persistence strategy.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;
    async fn load(&self, room_id: &str) -> Result<Option<Snapshot>, SnapshotError>;
    fn name(&self) -> &'static str;
}

/// Builds snapshots and delegates persistence to the configured backend.
pub struct SnapshotManager {
    store: Arc<dyn SnapshotStore>,
    enabled: bool,
}

impl SnapshotManager {
    pub fn new(store: Arc<dyn SnapshotStore>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Select and open the backend named by the configuration.
    ///
    /// `storage_path` is a directory for both backends; the database
    /// backend keeps `snapshots.db` inside it.
    pub async fn from_config(config: &SnapshotsConfig) -> Self {
        let store: Arc<dyn SnapshotStore> = match config.storage {
            SnapshotStorageKind::Database => {
                Arc::new(DatabaseSnapshotStore::open(config.storage_path.join("snapshots.db")))
            }
            SnapshotStorageKind::Filesystem => {
                match FilesystemSnapshotStore::open(&config.storage_path).await {
                    Ok(store) => Arc::new(store),
                    Err(e) => {
                        log::warn!(
                            "Filesystem snapshot storage unavailable at {:?}: {e} — snapshots disabled",
                            config.storage_path
                        );
                        return Self {
                            store: Arc::new(DatabaseSnapshotStore::disabled()),
                            enabled: false,
                        };
                    }
                }
            }
        };
        Self { store, enabled: config.enabled }
    }

    /// Build a snapshot value. Pure — no I/O.
    pub fn create_snapshot(room_id: &str, snapshot_data: Vec<u8>, version: u64) -> Snapshot {
        Snapshot::new(room_id, snapshot_data, version)
    }

    /// Persist a snapshot through the configured backend.
    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if !self.enabled {
            log::debug!("Snapshots disabled; skipping save for room {}", snapshot.room_id);
            return Ok(());
        }
        self.store.save(snapshot).await?;
        log::debug!(
            "Saved snapshot for room {} at version {} ({} bytes, {})",
            snapshot.room_id,
            snapshot.version,
            snapshot.snapshot_data.len(),
            self.store.name()
        );
        Ok(())
    }

    /// Load the most recent snapshot for a room, or `None`.
    ///
    /// Storage errors are demoted to `None` with a warning: a room that
    /// cannot load its snapshot falls back to the record store.
    pub async fn load_snapshot(&self, room_id: &str) -> Option<Snapshot> {
        if !self.enabled {
            return None;
        }
        match self.store.load(room_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Failed to load snapshot for room {room_id}: {e}");
                None
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.name()
    }
}
