// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Orchestrator configuration.
//!
//! Supports both programmatic and file-based configuration. The `[engine]`
//! table carries the [`EngineConfig`] defaults applied by the job converter
//! and the writer group hosts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use telepub::EngineConfig;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Engine configuration: {0}")]
    Engine(#[from] telepub::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where the published messages go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Log every message at debug level.
    #[default]
    Log,
    /// Append length-prefixed records to a file.
    File { path: PathBuf },
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Published nodes file to watch and persist to.
    #[serde(default = "default_published_nodes_path")]
    pub published_nodes_path: PathBuf,

    /// JSON schema used to validate the published nodes file.
    #[serde(default)]
    pub schema_path: Option<PathBuf>,

    /// File change polling interval (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Delay between retries of a failed file read (milliseconds).
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Number of worker loops pulling jobs.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Worker heartbeat interval (seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_published_nodes_path() -> PathBuf {
    PathBuf::from("publishednodes.json")
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_retry_delay() -> u64 {
    500
}

fn default_worker_count() -> usize {
    1
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            published_nodes_path: default_published_nodes_path(),
            schema_path: None,
            poll_interval_ms: default_poll_interval(),
            retry_delay_ms: default_retry_delay(),
            worker_count: default_worker_count(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            log_level: default_log_level(),
            transport: TransportConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.published_nodes_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "Published nodes path must not be empty".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "Poll interval must be greater than 0".into(),
            ));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("Worker count must be at least 1".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "Heartbeat interval must be greater than 0".into(),
            ));
        }
        self.engine.validate()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}
