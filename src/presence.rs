//! Ephemeral presence tracking: who is in a room and where their cursor is.
//!
//! Nothing here is persisted — presence is rebuilt from live connections and
//! is lost on server restart by design. Cursor and idle state arrive as
//! `presence` frames and are kept so late joiners can be told who is already
//! in the room; the frames themselves are rebroadcast verbatim by the server.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tokio::sync::RwLock;

use crate::protocol::PresenceEvent;

/// Cursor position with an optional selection range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CursorState {
    pub position: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionRange {
    pub start: u32,
    pub end: u32,
}

/// Per-user, per-room presence. Created on join, deleted on leave.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceState {
    pub user_id: String,
    pub username: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorState>,
    #[serde(default)]
    pub idle: bool,
}

/// Stable, visually distinct CSS color derived from a user id.
///
/// Hashes the id into a hue and converts through HSL with fixed saturation
/// and lightness, so the same user always renders with the same color on
/// every peer without coordination.
pub fn color_for_user(user_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    let hue = (hasher.finish() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0) as u8,
        (g * 255.0) as u8,
        (b * 255.0) as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// In-memory presence map for all rooms: `room_id → user_id → state`.
pub struct PresenceTracker {
    rooms: RwLock<HashMap<String, HashMap<String, PresenceState>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self { rooms: RwLock::new(HashMap::new()) }
    }

    /// Register a user in a room, assigning their stable color.
    pub async fn join(&self, room_id: &str, user_id: &str, username: &str) {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_default();
        room.insert(
            user_id.to_string(),
            PresenceState {
                user_id: user_id.to_string(),
                username: username.to_string(),
                color: color_for_user(user_id),
                cursor: None,
                idle: false,
            },
        );
    }

    /// Retract a user's presence. Returns true if they were present.
    pub async fn leave(&self, room_id: &str, user_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        let removed = room.remove(user_id).is_some();
        if room.is_empty() {
            rooms.remove(room_id);
        }
        removed
    }

    /// Apply an inbound presence event from an authenticated connection.
    ///
    /// The user identity comes from the connection, never from the payload.
    pub async fn apply(
        &self,
        room_id: &str,
        user_id: &str,
        event: PresenceEvent,
        data: &serde_json::Map<String, serde_json::Value>,
    ) {
        match event {
            PresenceEvent::Joined => {
                let username = data
                    .get("username")
                    .and_then(|v| v.as_str())
                    .unwrap_or(user_id);
                self.join(room_id, user_id, username).await;
            }
            PresenceEvent::Left => {
                self.leave(room_id, user_id).await;
            }
            PresenceEvent::Cursor => {
                let cursor = data
                    .get("cursor")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<CursorState>(v).ok());
                if let Some(cursor) = cursor {
                    let mut rooms = self.rooms.write().await;
                    if let Some(state) = rooms
                        .get_mut(room_id)
                        .and_then(|room| room.get_mut(user_id))
                    {
                        state.cursor = Some(cursor);
                        state.idle = false;
                    }
                }
            }
            PresenceEvent::Awareness => {
                let idle = data.get("idle").and_then(|v| v.as_bool());
                if let Some(idle) = idle {
                    let mut rooms = self.rooms.write().await;
                    if let Some(state) = rooms
                        .get_mut(room_id)
                        .and_then(|room| room.get_mut(user_id))
                    {
                        state.idle = idle;
                    }
                }
            }
        }
    }

    /// Current presence states for a room.
    pub async fn room_presence(&self, room_id: &str) -> Vec<PresenceState> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of users with presence in a room.
    pub async fn room_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(|room| room.len()).unwrap_or(0)
    }

    /// Drop all presence for a room (room destruction).
    pub async fn clear_room(&self, room_id: &str) {
        self.rooms.write().await.remove(room_id);
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
