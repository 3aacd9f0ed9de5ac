//! SQLite-backed snapshot storage.
//!
//! Snapshots live in a `realtime_snapshots` table as raw blobs. The store
//! opens lazily at startup; if the database or its schema cannot be created
//! it disables itself with a warning instead of taking the server down —
//! rooms then run memory-only until restart.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::SnapshotError;
use crate::snapshot::{Snapshot, SnapshotStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS realtime_snapshots (
    id            TEXT PRIMARY KEY,
    room_id       TEXT NOT NULL,
    snapshot_data BLOB NOT NULL,
    version       INTEGER NOT NULL,
    created_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_realtime_snapshots_room_id
    ON realtime_snapshots(room_id);
CREATE INDEX IF NOT EXISTS idx_realtime_snapshots_created_at
    ON realtime_snapshots(created_at);
";

/// Snapshot store backed by a single SQLite file.
pub struct DatabaseSnapshotStore {
    /// `None` means the store failed to open and every call is a no-op error.
    conn: Option<Mutex<Connection>>,
    path: PathBuf,
}

impl DatabaseSnapshotStore {
    /// Open (or create) the snapshot database at `path`.
    ///
    /// Never fails: on any error the store comes up disabled and logs why.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let conn = match Self::try_open(&path) {
            Ok(conn) => Some(Mutex::new(conn)),
            Err(e) => {
                log::warn!(
                    "Snapshot database unavailable at {path:?}: {e} — rooms will run memory-only"
                );
                None
            }
        };
        Self { conn, path }
    }

    /// A permanently disabled store. Every save and load fails with
    /// [`SnapshotError::Disabled`].
    pub fn disabled() -> Self {
        Self { conn: None, path: PathBuf::new() }
    }

    fn try_open(path: &Path) -> Result<Connection, SnapshotError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for DatabaseSnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let conn = self.conn.as_ref().ok_or(SnapshotError::Disabled)?;
        let conn = conn.lock().map_err(|_| SnapshotError::Disabled)?;
        conn.execute(
            "INSERT INTO realtime_snapshots (id, room_id, snapshot_data, version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.id,
                snapshot.room_id,
                snapshot.snapshot_data,
                snapshot.version as i64,
                snapshot.created_at,
            ],
        )?;
        Ok(())
    }

    async fn load(&self, room_id: &str) -> Result<Option<Snapshot>, SnapshotError> {
        let conn = self.conn.as_ref().ok_or(SnapshotError::Disabled)?;
        let conn = conn.lock().map_err(|_| SnapshotError::Disabled)?;
        let row = conn
            .query_row(
                "SELECT id, room_id, snapshot_data, version, created_at
                 FROM realtime_snapshots
                 WHERE room_id = ?1
                 ORDER BY created_at DESC, version DESC
                 LIMIT 1",
                params![room_id],
                |row| {
                    Ok(Snapshot {
                        id: row.get(0)?,
                        room_id: row.get(1)?,
                        snapshot_data: row.get(2)?,
                        version: row.get::<_, i64>(3)? as u64,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn name(&self) -> &'static str {
        "database"
    }
}
