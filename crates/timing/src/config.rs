//! Time sync configuration
//!
//! Configuration may arrive after the node starts (or be reloaded while it
//! runs), so consumers read it through [`ConfigProvider`] on every cycle and
//! treat [`SyncError::ConfigUnavailable`] as "try again next cycle".

use crate::error::{Result, SyncError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Time sync configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Whether this node is the cluster's time authority
    pub is_time_authority: bool,
    /// Milliseconds between time pushes to connected clients
    pub client_sync_interval_ms: i64,
    /// Milliseconds between follower time requests
    pub network_sync_interval_ms: i64,
    /// Offset change that triggers a drift report
    pub max_drift_ms: i64,
    /// Age after which a client's sync record counts as stale
    pub stale_client_timeout_ms: i64,
    /// Maximum number of clients tracked for sync
    pub max_clients: usize,
    /// Soft per-cycle budget for pushing time to clients
    pub client_broadcast_budget_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            is_time_authority: false,
            client_sync_interval_ms: 1000,
            network_sync_interval_ms: 5000,
            max_drift_ms: 50,
            stale_client_timeout_ms: 30_000,
            max_clients: 1000,
            client_broadcast_budget_ms: crate::CLIENT_BROADCAST_BUDGET_MS,
        }
    }
}

impl SyncConfig {
    /// Check every value against its allowed range
    pub fn validate(&self) -> Result<()> {
        check_range("clientSyncIntervalMs", self.client_sync_interval_ms, 50, 10_000)?;
        check_range("networkSyncIntervalMs", self.network_sync_interval_ms, 1000, 30_000)?;
        check_range("maxDriftMs", self.max_drift_ms, 10, 1000)?;
        check_range("staleClientTimeoutMs", self.stale_client_timeout_ms, 5000, 300_000)?;
        check_range("maxClients", self.max_clients as i64, 10, 5000)?;
        if self.client_broadcast_budget_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "clientBroadcastBudgetMs must be at least 1".to_string(),
            ));
        }

        if self.network_sync_interval_ms < 2000 {
            tracing::warn!(
                "Network sync interval is very low ({}ms) - may cause excessive network traffic",
                self.network_sync_interval_ms
            );
        }
        Ok(())
    }

    /// Parse and validate a JSON document
    pub fn from_json(text: &str) -> Result<Self> {
        let config: SyncConfig =
            serde_json::from_str(text).map_err(|e| SyncError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }
}

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<()> {
    if value < min || value > max {
        return Err(SyncError::InvalidConfig(format!(
            "{} = {} is outside {}..={}",
            name, value, min, max
        )));
    }
    Ok(())
}

/// Read-only access to the current configuration
pub trait ConfigProvider: Send + Sync {
    /// Current snapshot, or [`SyncError::ConfigUnavailable`] if nothing is loaded yet
    fn snapshot(&self) -> Result<SyncConfig>;
}

/// Hot-reloadable configuration holder
#[derive(Debug, Default)]
pub struct SharedConfig {
    current: RwLock<Option<SyncConfig>>,
}

impl SharedConfig {
    /// Create an empty holder; snapshots fail until something is loaded
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a holder that is already loaded
    pub fn loaded(config: SyncConfig) -> Self {
        Self {
            current: RwLock::new(Some(config)),
        }
    }

    /// Replace the current configuration
    pub fn replace(&self, config: SyncConfig) {
        *self.current.write() = Some(config);
    }

    /// Drop the current configuration (back to "not loaded")
    pub fn clear(&self) {
        *self.current.write() = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }

    /// Load a file into the holder, keeping the previous value on failure
    pub fn reload_from(&self, path: &Path) -> Result<SyncConfig> {
        let config = SyncConfig::from_file(path)?;
        self.replace(config);
        tracing::info!("Loaded time sync config from {}", path.display());
        Ok(config)
    }
}

impl ConfigProvider for SharedConfig {
    fn snapshot(&self) -> Result<SyncConfig> {
        self.current.read().ok_or(SyncError::ConfigUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SyncConfig::from_json(r#"{"isTimeAuthority": true, "maxDriftMs": 80}"#).unwrap();
        assert!(config.is_time_authority);
        assert_eq!(config.max_drift_ms, 80);
        assert_eq!(config.client_sync_interval_ms, 1000);
        assert_eq!(config.network_sync_interval_ms, 5000);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err = SyncConfig::from_json(r#"{"clientSyncIntervalMs": 10}"#).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));

        let err = SyncConfig::from_json(r#"{"clientBroadcastBudgetMs": 0}"#).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }

    #[test]
    fn test_shared_config_unavailable_until_loaded() {
        let shared = SharedConfig::new();
        assert_eq!(shared.snapshot(), Err(SyncError::ConfigUnavailable));

        shared.replace(SyncConfig::default());
        assert_eq!(shared.snapshot().unwrap(), SyncConfig::default());

        shared.clear();
        assert!(!shared.is_loaded());
    }

    #[test]
    fn test_reload_from_file_keeps_previous_on_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"isTimeAuthority": true}}"#).unwrap();

        let shared = SharedConfig::new();
        let loaded = shared.reload_from(file.path()).unwrap();
        assert!(loaded.is_time_authority);

        let mut broken = NamedTempFile::new().unwrap();
        write!(broken, "not json").unwrap();
        assert!(shared.reload_from(broken.path()).is_err());
        assert!(shared.snapshot().unwrap().is_time_authority);
    }
}
