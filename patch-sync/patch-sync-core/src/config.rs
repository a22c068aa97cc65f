//! Engine configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Namespace that, with the relative path, identifies a document.
    #[serde(default = "Uuid::nil")]
    pub project_id: Uuid,

    /// Directory that relative document paths are resolved against.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Local watch store file (default `.patch-sync/watch.redb` under `root`).
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    /// Directory of the file-backed stream transport.
    #[serde(default)]
    pub stream_dir: Option<PathBuf>,

    /// Directory of the JSON document registry.
    #[serde(default)]
    pub registry_dir: Option<PathBuf>,

    /// Session id stamped on every patch this process writes.
    #[serde(default = "default_user_id")]
    pub user_id: u32,

    /// Quiet period before a burst of notifications becomes one diff pass.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// How long a change waits for its publish before reporting failure.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Attempts for a diff pass that hits a transient error.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Watches not refreshed by a heartbeat within this many seconds are
    /// dropped. `null` keeps them until deactivated explicitly.
    #[serde(default = "default_heartbeat_ttl_secs")]
    pub heartbeat_ttl_secs: Option<u64>,

    /// Capacity of each path's event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Publish a full-content snapshot every this many versions.
    #[serde(default)]
    pub snapshot_interval: Option<u64>,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_user_id() -> u32 { 1 }
fn default_debounce_ms() -> u64 { 150 }
fn default_publish_timeout_ms() -> u64 { 10_000 }
fn default_retry_attempts() -> u32 { 3 }
fn default_retry_base_delay_ms() -> u64 { 200 }
fn default_heartbeat_ttl_secs() -> Option<u64> { Some(120) }
fn default_event_capacity() -> usize { 256 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            project_id: Uuid::nil(),
            root: default_root(),
            store_path: None,
            stream_dir: None,
            registry_dir: None,
            user_id: default_user_id(),
            debounce_ms: default_debounce_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            heartbeat_ttl_secs: default_heartbeat_ttl_secs(),
            event_capacity: default_event_capacity(),
            snapshot_interval: None,
        }
    }
}

impl SyncConfig {
    pub fn for_root(project_id: Uuid, root: impl Into<PathBuf>) -> Self {
        Self {
            project_id,
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn state_dir(&self) -> PathBuf {
        self.root.join(".patch-sync")
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("watch.redb"))
    }

    pub fn stream_dir(&self) -> PathBuf {
        self.stream_dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join("streams"))
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.registry_dir
            .clone()
            .unwrap_or_else(|| self.state_dir().join("registry"))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn heartbeat_ttl(&self) -> Option<Duration> {
        self.heartbeat_ttl_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: SyncConfig = serde_json::from_str(r#"{"root": "/srv/project"}"#).unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(150));
        assert_eq!(config.heartbeat_ttl(), Some(Duration::from_secs(120)));
        assert_eq!(
            config.store_path(),
            PathBuf::from("/srv/project/.patch-sync/watch.redb")
        );
        assert!(config.snapshot_interval.is_none());
    }

    #[test]
    fn null_ttl_disables_expiry() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"heartbeat_ttl_secs": null, "user_id": 7}"#).unwrap();
        assert_eq!(config.heartbeat_ttl(), None);
        assert_eq!(config.user_id, 7);
    }
}
