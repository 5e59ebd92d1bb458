//! Sync-core configuration: conflict policy, pull window, and push batching.
//! Constructible in code or loaded from a TOML file, the way `comunicado`'s
//! own config module layers defaults under an optional file on disk.

use crate::calendar::conflict::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: toml::de::Error },
}

/// Serialized form of `ConflictPolicy`, kept distinct from the enum used
/// inside `ConflictResolver` so the on-disk key (`server_wins` etc.) stays
/// stable independent of the Rust variant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicyConfig {
    ServerWins,
    ClientWins,
    LastWriteWins,
}

impl Default for ConflictPolicyConfig {
    fn default() -> Self {
        ConflictPolicyConfig::ServerWins
    }
}

impl From<ConflictPolicyConfig> for ConflictPolicy {
    fn from(value: ConflictPolicyConfig) -> Self {
        match value {
            ConflictPolicyConfig::ServerWins => ConflictPolicy::ServerWins,
            ConflictPolicyConfig::ClientWins => ConflictPolicy::ClientWins,
            ConflictPolicyConfig::LastWriteWins => ConflictPolicy::LastWriteWins,
        }
    }
}

fn default_push_batch_limit() -> i64 {
    50
}

fn default_pull_window_past_days() -> i64 {
    90
}

fn default_pull_window_future_days() -> i64 {
    365 * 2
}

fn default_ics_refresh_minutes() -> i64 {
    60
}

/// Top-level configuration for one `SyncEngine` instance, covering every
/// account it drives. Per-account overrides (e.g. a slower-moving shared
/// calendar wanting a longer pull window) are a host-level concern layered
/// on top; this struct carries the engine-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncCoreConfig {
    pub conflict_policy: ConflictPolicyConfig,
    #[serde(default = "default_push_batch_limit")]
    pub push_batch_limit: i64,
    #[serde(default = "default_pull_window_past_days")]
    pub pull_window_past_days: i64,
    #[serde(default = "default_pull_window_future_days")]
    pub pull_window_future_days: i64,
    #[serde(default = "default_ics_refresh_minutes")]
    pub ics_refresh_minutes: i64,
    pub database_path: Option<String>,
}

impl Default for SyncCoreConfig {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicyConfig::default(),
            push_batch_limit: default_push_batch_limit(),
            pull_window_past_days: default_pull_window_past_days(),
            pull_window_future_days: default_pull_window_future_days(),
            ics_refresh_minutes: default_ics_refresh_minutes(),
            database_path: None,
        }
    }
}

impl SyncCoreConfig {
    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.conflict_policy.into()
    }
}

pub fn load_from_toml(path: impl AsRef<Path>) -> Result<SyncCoreConfig, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_server_wins_and_fifty_item_push_batches() {
        let config = SyncCoreConfig::default();
        assert_eq!(config.conflict_policy(), ConflictPolicy::ServerWins);
        assert_eq!(config.push_batch_limit, 50);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults_for_missing_fields() {
        let parsed: SyncCoreConfig = toml::from_str("conflict_policy = \"client_wins\"\n").unwrap();
        assert_eq!(parsed.conflict_policy, ConflictPolicyConfig::ClientWins);
        assert_eq!(parsed.push_batch_limit, 50);
        assert_eq!(parsed.pull_window_past_days, 90);
    }

    #[test]
    fn unreadable_path_reports_a_read_error() {
        let err = load_from_toml("/nonexistent/path/sync-core.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
