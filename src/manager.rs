//! Room registry: creation, lookup, and reclamation of rooms.
//!
//! The manager owns the only map from room id to live room. Each room sits
//! behind its own `Mutex` so one room's update stream never blocks another;
//! the map itself takes a short `RwLock`. Room construction (snapshot load,
//! record fetch) happens outside the map lock, with a double-check on
//! insert so two racing joiners end up in the same room.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use async_trait::async_trait;

use crate::auth::{split_room_id, RecordStore};
use crate::error::RealtimeError;
use crate::room::Room;
use crate::snapshot::SnapshotManager;

/// Builds a fully initialized room for one room type.
#[async_trait]
pub trait RoomFactory: Send + Sync {
    async fn create_room(&self, room_id: &str, record_id: &str) -> Result<Room, RealtimeError>;
}

/// Factory for record-backed rooms. Seeding priority:
/// snapshot → record content → empty document.
pub struct RecordRoomFactory {
    records: Arc<dyn RecordStore>,
    snapshots: Arc<SnapshotManager>,
}

impl RecordRoomFactory {
    pub fn new(records: Arc<dyn RecordStore>, snapshots: Arc<SnapshotManager>) -> Self {
        Self { records, snapshots }
    }
}

#[async_trait]
impl RoomFactory for RecordRoomFactory {
    async fn create_room(&self, room_id: &str, record_id: &str) -> Result<Room, RealtimeError> {
        let room_type = split_room_id(room_id).map(|(t, _)| t).unwrap_or("records");
        let mut room = Room::new(room_id, room_type);

        if let Some(snapshot) = self.snapshots.load_snapshot(room_id).await {
            match room.initialize_from_snapshot(&snapshot) {
                Ok(()) => {
                    log::info!(
                        "Room {room_id} restored from snapshot at version {}",
                        snapshot.version
                    );
                    return Ok(room);
                }
                Err(e) => {
                    log::warn!("Snapshot for room {room_id} failed to apply: {e}");
                }
            }
        }

        match self.records.get_record(record_id).await {
            Ok(Some(record)) => {
                room.initialize(Some(&record.content));
                log::info!("Room {room_id} seeded from record {record_id}");
            }
            Ok(None) => {
                // The record vanished between the permission check and now.
                log::warn!("Record {record_id} not found while seeding room {room_id}");
                room.initialize(None);
            }
            Err(e) => {
                log::warn!("Record fetch failed while seeding room {room_id}: {e}");
                room.initialize(None);
            }
        }
        Ok(room)
    }
}

/// Shared handle to a live room.
pub type SharedRoom = Arc<Mutex<Room>>;

pub struct RoomManager {
    rooms: RwLock<HashMap<String, SharedRoom>>,
    factories: HashMap<String, Arc<dyn RoomFactory>>,
    max_rooms: usize,
}

impl RoomManager {
    pub fn new(max_rooms: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            factories: HashMap::new(),
            max_rooms,
        }
    }

    /// Register a factory for a room type. Call before serving traffic.
    pub fn register_factory(&mut self, room_type: impl Into<String>, factory: Arc<dyn RoomFactory>) {
        self.factories.insert(room_type.into(), factory);
    }

    pub fn get_factory(&self, room_type: &str) -> Option<Arc<dyn RoomFactory>> {
        self.factories.get(room_type).cloned()
    }

    /// Look up a room, or create and initialize it if absent.
    ///
    /// Returns the room and whether this call created it. Two connections
    /// racing on the same id both get the same room: construction runs
    /// outside the map lock and the insert is double-checked.
    pub async fn get_or_create_room(
        &self,
        room_id: &str,
    ) -> Result<(SharedRoom, bool), RealtimeError> {
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return Ok((room.clone(), false));
        }

        let (room_type, record_id) = split_room_id(room_id)
            .ok_or_else(|| RealtimeError::RoomTypeNotFound(room_id.to_string()))?;
        let factory = self
            .factories
            .get(room_type)
            .ok_or_else(|| RealtimeError::RoomTypeNotFound(room_type.to_string()))?;

        let room = factory.create_room(room_id, record_id).await?;

        let mut rooms = self.rooms.write().await;
        if let Some(existing) = rooms.get(room_id) {
            // Lost the race; the freshly built room is dropped.
            return Ok((existing.clone(), false));
        }
        if rooms.len() >= self.max_rooms {
            return Err(RealtimeError::RoomLimitReached(self.max_rooms));
        }
        let shared = Arc::new(Mutex::new(room));
        rooms.insert(room_id.to_string(), shared.clone());
        Ok((shared, true))
    }

    pub async fn get_room(&self, room_id: &str) -> Option<SharedRoom> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn all_rooms(&self) -> Vec<(String, SharedRoom)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (id.clone(), room.clone()))
            .collect()
    }

    /// Remove rooms that have been empty longer than `timeout_secs`.
    ///
    /// Returns the removed rooms so the caller can take a final snapshot
    /// and tear them down; they are already unreachable for new joins.
    ///
    /// The scan never awaits a room mutex while holding the map write
    /// lock, so a slow snapshot elsewhere cannot stall room lookups. A
    /// room whose mutex is busy is simply left for the next sweep.
    pub async fn cleanup_empty_rooms(&self, timeout_secs: u64) -> Vec<(String, SharedRoom)> {
        let candidates: Vec<(String, SharedRoom)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (id.clone(), room.clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, room) in candidates {
            let Ok(guard) = room.try_lock() else { continue };
            if guard.client_count() == 0 && guard.seconds_since_activity() >= timeout_secs {
                expired.push(id);
            }
        }

        let mut rooms = self.rooms.write().await;
        expired
            .into_iter()
            .filter_map(|id| {
                // A client may have joined between the scan and now.
                let still_empty = rooms
                    .get(&id)?
                    .try_lock()
                    .map(|guard| guard.client_count() == 0)
                    .unwrap_or(false);
                if still_empty {
                    rooms.remove(&id).map(|room| (id, room))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Remove one room immediately, regardless of idle age.
    pub async fn remove_room(&self, room_id: &str) -> Option<SharedRoom> {
        self.rooms.write().await.remove(room_id)
    }

    pub fn max_rooms(&self) -> usize {
        self.max_rooms
    }
}
