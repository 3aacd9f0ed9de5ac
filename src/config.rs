//! Server configuration, loaded once from `realtime.yml`.
//!
//! The file may either nest everything under a `realtime:` key (the usual
//! layout when the file is shared with other subsystems) or be flat. Every
//! field has a default, so an empty file yields a working configuration.
//!
//! ```yaml
//! realtime:
//!   enabled: true
//!   port: 8081
//!   rooms:
//!     max_rooms: 500
//!     cleanup_timeout: 60
//!   snapshots:
//!     storage: database
//!     interval: 300
//!     max_updates: 100
//!   rate_limiting:
//!     connections_per_ip: 20
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level realtime server configuration. Read-only after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Master switch; a disabled server refuses to start.
    pub enabled: bool,
    pub port: u16,
    pub host: String,
    /// URL path prefix the WebSocket endpoint is mounted under.
    pub path: String,
    pub rooms: RoomsConfig,
    pub snapshots: SnapshotsConfig,
    pub rate_limiting: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    /// Hard cap on concurrently live rooms.
    pub max_rooms: usize,
    /// Seconds between idle-room cleanup sweeps.
    pub cleanup_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotsConfig {
    pub enabled: bool,
    /// Seconds between snapshot sweeps; also the idle threshold after which
    /// a room with pending updates is snapshotted regardless of count.
    pub interval: u64,
    /// Snapshot once this many updates have accumulated since the last one.
    pub max_updates: u64,
    pub storage: SnapshotStorageKind,
    /// Directory holding snapshot data. The database backend keeps its
    /// `snapshots.db` file inside it.
    pub storage_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStorageKind {
    Database,
    Filesystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-connection inbound message budget; excess frames are dropped.
    pub messages_per_second: u32,
    /// 0 disables the cap.
    pub connections_per_ip: u32,
    /// 0 disables the cap.
    pub connections_per_user: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8081,
            host: "127.0.0.1".to_string(),
            path: "/realtime".to_string(),
            rooms: RoomsConfig::default(),
            snapshots: SnapshotsConfig::default(),
            rate_limiting: RateLimitConfig::default(),
        }
    }
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self { max_rooms: 500, cleanup_timeout: 60 }
    }
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 300,
            max_updates: 100,
            storage: SnapshotStorageKind::Database,
            storage_path: PathBuf::from("realtime-data"),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_second: 100,
            connections_per_ip: 20,
            connections_per_user: 5,
        }
    }
}

/// Wrapper for the nested `realtime:` layout.
#[derive(Debug, Deserialize)]
struct Nested {
    realtime: RealtimeConfig,
}

impl RealtimeConfig {
    /// Parse YAML, accepting both the nested and the flat layout.
    pub fn from_yaml(source: &str) -> Result<Self, serde_yaml::Error> {
        match serde_yaml::from_str::<Nested>(source) {
            Ok(nested) => Ok(nested.realtime),
            Err(_) => serde_yaml::from_str::<RealtimeConfig>(source),
        }
    }

    /// Load from a file path (typically `realtime.yml`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }

    /// `host:port` bind address for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RealtimeConfig::default();
        assert!(config.enabled);
        assert_eq!(config.port, 8081);
        assert_eq!(config.path, "/realtime");
        assert_eq!(config.rooms.max_rooms, 500);
        assert_eq!(config.snapshots.max_updates, 100);
        assert_eq!(config.snapshots.storage, SnapshotStorageKind::Database);
        assert_eq!(config.rate_limiting.connections_per_ip, 20);
    }

    #[test]
    fn test_parse_nested_layout() {
        let yaml = r#"
realtime:
  port: 9100
  host: 0.0.0.0
  snapshots:
    storage: filesystem
    max_updates: 25
"#;
        let config = RealtimeConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.snapshots.storage, SnapshotStorageKind::Filesystem);
        assert_eq!(config.snapshots.max_updates, 25);
        // Untouched sections keep defaults
        assert_eq!(config.rooms.cleanup_timeout, 60);
    }

    #[test]
    fn test_parse_flat_layout() {
        let yaml = r#"
enabled: false
port: 7777
rate_limiting:
  connections_per_user: 2
"#;
        let config = RealtimeConfig::from_yaml(yaml).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.port, 7777);
        assert_eq!(config.rate_limiting.connections_per_user, 2);
    }

    #[test]
    fn test_empty_source_yields_defaults() {
        let config = RealtimeConfig::from_yaml("{}").unwrap();
        assert_eq!(config.port, RealtimeConfig::default().port);
    }

    #[test]
    fn test_bind_addr() {
        let mut config = RealtimeConfig::default();
        config.host = "10.0.0.5".into();
        config.port = 9000;
        assert_eq!(config.bind_addr(), "10.0.0.5:9000");
    }
}
