//! Filesystem-backed snapshot storage: one JSON file per room.
//!
//! Room ids are sanitized into filenames, so `records:doc-1` lands in
//! `records_doc-1.json`. Writes go through a temp file and an atomic rename;
//! a crash mid-write leaves the previous snapshot intact.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::SnapshotError;
use crate::snapshot::{Snapshot, SnapshotStore};

/// On-disk snapshot file layout. Binary state travels as base64 so the
/// files stay inspectable with ordinary tools.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    id: String,
    room_id: String,
    version: u64,
    created_at: i64,
    data: String,
}

pub struct FilesystemSnapshotStore {
    dir: PathBuf,
}

impl FilesystemSnapshotStore {
    /// Open the store rooted at `dir`, creating it if missing.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, room_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_room_id(room_id)))
    }
}

/// Map a room id onto a safe filename component.
fn sanitize_room_id(room_id: &str) -> String {
    room_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl SnapshotStore for FilesystemSnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let file = SnapshotFile {
            id: snapshot.id.clone(),
            room_id: snapshot.room_id.clone(),
            version: snapshot.version,
            created_at: snapshot.created_at,
            data: BASE64.encode(&snapshot.snapshot_data),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let path = self.file_for(&snapshot.room_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, room_id: &str) -> Result<Option<Snapshot>, SnapshotError> {
        let path = self.file_for(room_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: SnapshotFile = serde_json::from_str(&raw)?;
        let data = BASE64
            .decode(&file.data)
            .map_err(|e| SnapshotError::Serialization(format!("corrupt snapshot data: {e}")))?;
        Ok(Some(Snapshot {
            id: file.id,
            room_id: file.room_id,
            version: file.version,
            snapshot_data: data,
            created_at: file.created_at,
        }))
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}
