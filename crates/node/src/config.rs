//! Daemon configuration: config-file watching and process settings

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use timesync_timing::{SharedConfig, SyncConfig};

/// Process-level settings that are not hot-reloadable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    /// Relay address (listen address in relay mode, target in node mode)
    pub relay_addr: String,
    /// Client WebSocket bind address (node mode)
    pub client_addr: String,
    /// Sync config file watched for changes (node mode)
    pub config_path: PathBuf,
    /// How often the config file is checked for changes
    pub config_poll_ms: u64,
    /// Seconds between stats log lines
    pub stats_interval_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            relay_addr: "127.0.0.1:9400".to_string(),
            client_addr: "127.0.0.1:9401".to_string(),
            config_path: PathBuf::from("./timesync.json"),
            config_poll_ms: 1000,
            stats_interval_secs: 30,
        }
    }
}

/// Polls a config file's modification time and reloads it on change
pub struct ConfigWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
    reported_missing: bool,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
            reported_missing: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload into `shared` if the file changed since the last poll
    ///
    /// Returns the new configuration when one was applied. A missing or
    /// invalid file leaves the previous configuration in place.
    pub fn poll(&mut self, shared: &SharedConfig) -> Option<SyncConfig> {
        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                if !self.reported_missing {
                    tracing::warn!(
                        "Time sync config {} not readable ({}) - waiting for it",
                        self.path.display(),
                        e
                    );
                    self.reported_missing = true;
                }
                return None;
            }
        };
        self.reported_missing = false;

        if self.last_modified == Some(modified) {
            return None;
        }
        self.last_modified = Some(modified);

        match shared.reload_from(&self.path) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::error!("Rejected time sync config {}: {}", self.path.display(), e);
                None
            }
        }
    }
}
