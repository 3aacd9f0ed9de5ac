//! Lifecycle hook events for host integration.
//!
//! The server pushes structured events onto an unbounded channel; the host
//! decides what to do with them (audit log, webhooks, metrics). If no one
//! is listening the emitter is inert and emitting costs nothing.

use serde_json::Value;
use tokio::sync::mpsc;

pub const EVENT_CLIENT_CONNECTED: &str = "client_connected";
pub const EVENT_CLIENT_DISCONNECTED: &str = "client_disconnected";
pub const EVENT_ROOM_CREATED: &str = "room_created";
pub const EVENT_ROOM_DESTROYED: &str = "room_destroyed";
pub const EVENT_SNAPSHOT_SAVED: &str = "snapshot_saved";

#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
    pub name: String,
    pub payload: Value,
}

/// Sends hook events to whoever holds the receiving half.
#[derive(Clone)]
pub struct HookEmitter {
    tx: Option<mpsc::UnboundedSender<HookEvent>>,
}

impl HookEmitter {
    /// Create an emitter wired to a receiver the host drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HookEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// An emitter that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, name: &str, payload: Value) {
        let Some(tx) = &self.tx else {
            return;
        };
        log::debug!("Hook event: {name}");
        // A dropped receiver just means the host stopped listening.
        let _ = tx.send(HookEvent {
            name: name.to_string(),
            payload,
        });
    }
}
