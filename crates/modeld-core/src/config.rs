//! Configuration types for modeld

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Snapshot storage configuration
    pub storage: StorageConfig,
    /// Resident cache configuration
    pub cache: CacheConfig,
    /// Dispatcher configuration
    pub dispatcher: DispatcherConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Default parameters per model kind, overriding the built-in defaults
    pub models: HashMap<String, serde_json::Value>,
}

impl WorkerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::ModeldError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::ModeldError::Config(format!("Failed to read config file: {}", e))
        })?;
        let config: WorkerConfig = toml::from_str(&content)
            .map_err(|e| crate::ModeldError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the worker cannot run with
    pub fn validate(&self) -> Result<(), crate::ModeldError> {
        if self.cache.capacity == 0 {
            return Err(crate::ModeldError::Config(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        if self.storage.generations == 0 {
            return Err(crate::ModeldError::Config(
                "storage.generations must be at least 1".to_string(),
            ));
        }
        if self.dispatcher.max_inflight == 0 {
            return Err(crate::ModeldError::Config(
                "dispatcher.max_inflight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub rest_address: String,
    /// Port for the REST API server
    pub rest_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rest_address: "0.0.0.0".to_string(),
            rest_port: 9090,
        }
    }
}

/// Snapshot storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding one checkpoint directory per entity
    pub checkpoint_root: PathBuf,
    /// Number of committed generations kept per entity
    pub generations: usize,
    /// Gzip snapshot blobs
    pub compress: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            checkpoint_root: PathBuf::from("/var/lib/modeld/models"),
            generations: 2,
            compress: true,
        }
    }
}

/// When write-back of an evicted entity happens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Spawn the write-back batch and reply immediately
    Deferred,
    /// Await the write-back batch before replying
    Inline,
}

/// Resident cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of resident models
    pub capacity: usize,
    /// Eviction write-back mode
    pub flush_mode: FlushMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            flush_mode: FlushMode::Deferred,
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Seconds to wait for a per-entity lock
    pub lock_timeout_secs: u64,
    /// Maximum number of jobs processed concurrently
    pub max_inflight: usize,
    /// Model kind used for entities that have none recorded
    pub default_model: String,
    /// Seconds a queue client waits for a reply
    pub job_timeout_secs: u64,
    /// Capacity of the in-process job queue
    pub queue_depth: usize,
}

impl DispatcherConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 30,
            max_inflight: 10,
            default_model: "ewma".to_string(),
            job_timeout_secs: 60,
            queue_depth: 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_worker_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.api.rest_port, 9090);
        assert_eq!(config.storage.generations, 2);
        assert_eq!(config.cache.capacity, 10);
        assert_eq!(config.cache.flush_mode, FlushMode::Deferred);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_config_parse() {
        let toml_str = r#"
[storage]
checkpoint_root = "/tmp/models"
generations = 3
compress = false

[cache]
capacity = 2
flush_mode = "inline"

[dispatcher]
lock_timeout_secs = 5
default_model = "counter"

[models.ewma]
alpha = 0.2
"#;
        let config: WorkerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage.checkpoint_root, PathBuf::from("/tmp/models"));
        assert_eq!(config.storage.generations, 3);
        assert!(!config.storage.compress);
        assert_eq!(config.cache.capacity, 2);
        assert_eq!(config.cache.flush_mode, FlushMode::Inline);
        assert_eq!(config.dispatcher.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.dispatcher.max_inflight, 10);
        assert_eq!(config.dispatcher.default_model, "counter");
        assert_eq!(config.models["ewma"]["alpha"], 0.2);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = WorkerConfig::default();
        config.cache.capacity = 0;
        assert!(config.validate().is_err());
    }
}
