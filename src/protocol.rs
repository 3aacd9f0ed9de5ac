//! JSON wire protocol for the realtime WebSocket endpoint.
//!
//! One JSON envelope per text frame, discriminated by `"type"`:
//!
//! ```text
//! client → server                      server → client
//! ─────────────────────────────────    ─────────────────────────────────────
//! {"type":"ping"}                      {"type":"pong","timestamp":<ms>}
//! {"type":"sync","update":"<b64>"}     {"type":"sync","update":"<b64>",
//!                                       "version":N,"from":"<userId>"}
//! {"type":"presence","event":...}      (rebroadcast verbatim to peers)
//!                                      {"type":"control","event":"room_state",...}
//!                                      {"type":"control","event":"error",...}
//! ```
//!
//! Binary CRDT payloads cross the wire base64-encoded inside the JSON
//! envelope. Unknown or malformed envelopes are dropped by the server with a
//! logged warning; they never terminate the connection.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::RealtimeError;

/// Messages a client may send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Ping,
    Sync {
        /// Base64-encoded CRDT update.
        update: String,
    },
    Presence {
        event: PresenceEvent,
        /// Event-specific fields, carried through untouched so the server
        /// can rebroadcast presence frames verbatim.
        #[serde(flatten)]
        data: serde_json::Map<String, serde_json::Value>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEvent {
    Cursor,
    Awareness,
    Joined,
    Left,
}

/// Messages the server sends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Pong {
        /// Epoch milliseconds.
        timestamp: u64,
    },
    Sync {
        update: String,
        version: u64,
        from: String,
    },
    Control {
        #[serde(flatten)]
        body: ControlBody,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlBody {
    /// Sent once, immediately after a successful join.
    RoomState { room: RoomStateView },
    /// Sent before an error close.
    Error { error: ErrorBody },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomStateView {
    pub id: String,
    pub participants: Vec<ParticipantView>,
    /// Base64-encoded full CRDT state for late-joiner bootstrap.
    #[serde(rename = "yjsState")]
    pub yjs_state: String,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantView {
    pub id: String,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ServerMessage {
    pub fn pong() -> Self {
        ServerMessage::Pong { timestamp: epoch_ms() }
    }

    pub fn sync(update: &[u8], version: u64, from: impl Into<String>) -> Self {
        ServerMessage::Sync {
            update: encode_payload(update),
            version,
            from: from.into(),
        }
    }

    pub fn room_state(room: RoomStateView) -> Self {
        ServerMessage::Control { body: ControlBody::RoomState { room } }
    }

    pub fn error(err: &RealtimeError) -> Self {
        ServerMessage::Control {
            body: ControlBody::Error {
                error: ErrorBody {
                    code: err.code().to_string(),
                    message: err.to_string(),
                },
            },
        }
    }

    pub fn to_json(&self) -> String {
        // Serialization of these envelopes cannot fail; every field is a
        // plain string or integer.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ClientMessage {
    pub fn from_json(raw: &str) -> Result<Self, RealtimeError> {
        serde_json::from_str(raw).map_err(|e| RealtimeError::Protocol(e.to_string()))
    }
}

/// Base64-encode a binary CRDT payload for the wire.
pub fn encode_payload(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a base64 CRDT payload from the wire.
pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, RealtimeError> {
    BASE64
        .decode(encoded)
        .map_err(|e| RealtimeError::InvalidUpdate(format!("bad base64 payload: {e}")))
}

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
