/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * HybridDB - Primary/replica document database access layer
 * Built with Rust for superior performance and reliability
 *
 * @file config.rs
 * @brief HybridDB configuration management
 */

use crate::error::{HybridError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "HYBRIDDB";
pub const DEFAULT_SECONDARY_URI: &str = "postgresql://localhost:5432/hybriddb_replica";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HybridConfig {
    /// Authoritative store. Required unless `build_phase` is set.
    #[serde(default)]
    pub primary_uri: Option<String>,

    #[serde(default = "default_secondary_uri")]
    pub secondary_uri: String,

    #[serde(default = "default_true")]
    pub secondary_enabled: bool,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    #[serde(default = "default_pool_min_size")]
    pub pool_min_size: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_drift_check_interval_secs")]
    pub drift_check_interval_secs: u64,

    #[serde(default = "default_replication_workers")]
    pub replication_workers: usize,

    #[serde(default = "default_replication_queue_capacity")]
    pub replication_queue_capacity: usize,

    /// Resync a collection again once its lock is released if a resync was
    /// skipped while it was held.
    #[serde(default)]
    pub retrigger_skipped_resync: bool,

    #[serde(default = "default_shutdown_drain_timeout_ms")]
    pub shutdown_drain_timeout_ms: u64,

    /// Offline/build mode: no store is contacted and reads return nothing.
    #[serde(default)]
    pub build_phase: bool,
}

fn default_secondary_uri() -> String { DEFAULT_SECONDARY_URI.to_string() }
fn default_true() -> bool { true }
fn default_pool_max_size() -> u32 { 10 }
fn default_pool_min_size() -> u32 { 2 }
fn default_connect_timeout_ms() -> u64 { 5000 }
fn default_drift_check_interval_secs() -> u64 { 300 }
fn default_replication_workers() -> usize { 2 }
fn default_replication_queue_capacity() -> usize { 1024 }
fn default_shutdown_drain_timeout_ms() -> u64 { 10_000 }

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            primary_uri: None,
            secondary_uri: default_secondary_uri(),
            secondary_enabled: default_true(),
            pool_max_size: default_pool_max_size(),
            pool_min_size: default_pool_min_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            drift_check_interval_secs: default_drift_check_interval_secs(),
            replication_workers: default_replication_workers(),
            replication_queue_capacity: default_replication_queue_capacity(),
            retrigger_skipped_resync: false,
            shutdown_drain_timeout_ms: default_shutdown_drain_timeout_ms(),
            build_phase: false,
        }
    }
}

impl HybridConfig {
    pub fn with_primary(uri: impl Into<String>) -> Self {
        Self {
            primary_uri: Some(uri.into()),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_env_source(None)
    }

    pub fn from_env_source(source: Option<HashMap<String, String>>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(source),
            )
            .build()?;

        let config: HybridConfig = settings.try_deserialize()?;
        Ok(config)
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            HybridError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let parsed = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content).map_err(|e| e.to_string()),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| e.to_string()),
            _ => toml::from_str(&content).map_err(|e| e.to_string()),
        };

        parsed.map_err(|e| {
            HybridError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self).map_err(|e| e.to_string()),
            Some("yaml") | Some("yml") => serde_yaml::to_string(self).map_err(|e| e.to_string()),
            _ => toml::to_string_pretty(self).map_err(|e| e.to_string()),
        }
        .map_err(HybridError::Configuration)?;

        tokio::fs::write(path, content).await.map_err(|e| {
            HybridError::Configuration(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.build_phase {
            match self.primary_uri.as_deref().map(str::trim) {
                None | Some("") => {
                    return Err(HybridError::Configuration(format!(
                        "{}_PRIMARY_URI is required",
                        ENV_PREFIX
                    )))
                }
                Some(_) => {}
            }
        }
        if self.pool_max_size == 0 {
            return Err(HybridError::Configuration("pool_max_size must be at least 1".into()));
        }
        if self.pool_min_size > self.pool_max_size {
            return Err(HybridError::Configuration(format!(
                "pool_min_size ({}) exceeds pool_max_size ({})",
                self.pool_min_size, self.pool_max_size
            )));
        }
        if self.replication_workers == 0 {
            return Err(HybridError::Configuration("replication_workers must be at least 1".into()));
        }
        if self.replication_queue_capacity == 0 {
            return Err(HybridError::Configuration(
                "replication_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn drift_check_interval(&self) -> Duration {
        Duration::from_secs(self.drift_check_interval_secs)
    }

    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults() {
        let config = HybridConfig::default();
        assert_eq!(config.pool_max_size, 10);
        assert_eq!(config.pool_min_size, 2);
        assert_eq!(config.drift_check_interval(), Duration::from_secs(300));
        assert_eq!(config.secondary_uri, DEFAULT_SECONDARY_URI);
        assert!(config.secondary_enabled);
        assert!(!config.retrigger_skipped_resync);
    }

    #[test]
    fn test_missing_primary_is_fatal() {
        let err = HybridConfig::default().validate().unwrap_err();
        assert!(matches!(err, HybridError::Configuration(_)));
    }

    #[test]
    fn test_build_phase_allows_missing_primary() {
        let config = HybridConfig {
            build_phase: true,
            ..HybridConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_bounds_validated() {
        let config = HybridConfig {
            pool_min_size: 20,
            ..HybridConfig::with_primary("memory://primary")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_env_source() {
        let config = HybridConfig::from_env_source(env(&[
            ("HYBRIDDB_PRIMARY_URI", "postgresql://db.internal:5432/app"),
            ("HYBRIDDB_POOL_MAX_SIZE", "25"),
            ("HYBRIDDB_SECONDARY_ENABLED", "false"),
        ]))
        .unwrap();

        assert_eq!(config.primary_uri.as_deref(), Some("postgresql://db.internal:5432/app"));
        assert_eq!(config.pool_max_size, 25);
        assert!(!config.secondary_enabled);
        assert_eq!(config.pool_min_size, 2);
    }

    #[tokio::test]
    async fn test_save_and_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hybriddb.toml");

        let config = HybridConfig {
            replication_workers: 4,
            ..HybridConfig::with_primary("memory://primary")
        };
        config.save(&path).await.unwrap();

        let loaded = HybridConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_yaml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hybriddb.yaml");
        tokio::fs::write(&path, "primary_uri: memory://primary\n").await.unwrap();

        let loaded = HybridConfig::load(&path).await.unwrap();
        assert_eq!(loaded.primary_uri.as_deref(), Some("memory://primary"));
        assert_eq!(loaded.replication_queue_capacity, 1024);
    }
}
