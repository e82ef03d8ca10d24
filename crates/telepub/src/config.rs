// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine configuration.
//!
//! Supports both programmatic and file-based configuration. Values here are
//! the defaults a writer group falls back to when its own configuration does
//! not override them.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Shape of the emitted messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MessagingMode {
    /// One legacy message per monitored item notification.
    Samples,
    /// Network messages grouping data set messages per writer group.
    #[default]
    PubSub,
}

/// Wire encoding of the emitted messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MessageEncoding {
    #[default]
    Json,
    Binary,
}

/// Batching and backpressure settings of one writer group pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Number of notification batches collected before encoding (>= 2 enables batching).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Forced batch emission interval in milliseconds (0 = disabled).
    #[serde(default = "default_batch_trigger_interval_ms")]
    pub batch_trigger_interval_ms: u64,

    /// Maximum encoded message size in bytes (0 = unbounded).
    #[serde(default)]
    pub max_message_size: usize,

    /// Messages queued for the sink before ingress starts dropping.
    #[serde(default = "default_max_outgress_messages")]
    pub max_outgress_messages: usize,
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_trigger_interval_ms() -> u64 {
    10_000
}

fn default_max_outgress_messages() -> usize {
    4096
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_trigger_interval_ms: default_batch_trigger_interval_ms(),
            max_message_size: 0,
            max_outgress_messages: default_max_outgress_messages(),
        }
    }
}

impl BatchSettings {
    /// Whether the pipeline groups several batches into one encoder call.
    pub fn is_batching(&self) -> bool {
        self.batch_size > 1
    }

    /// Batch trigger interval, `None` when disabled.
    pub fn batch_trigger_interval(&self) -> Option<Duration> {
        (self.batch_trigger_interval_ms > 0)
            .then(|| Duration::from_millis(self.batch_trigger_interval_ms))
    }

    /// Effective message size bound after clamping to the transport limit.
    ///
    /// Either side being 0 means "no limit" on that side.
    pub fn effective_max_message_size(&self, transport_limit: usize) -> usize {
        match (self.max_message_size, transport_limit) {
            (0, 0) => usize::MAX,
            (0, limit) => limit,
            (size, 0) => size,
            (size, limit) => size.min(limit),
        }
    }

    /// Set batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set batch trigger interval in milliseconds.
    pub fn with_trigger_interval_ms(mut self, ms: u64) -> Self {
        self.batch_trigger_interval_ms = ms;
        self
    }

    /// Set maximum message size.
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set maximum outgress messages.
    pub fn with_max_outgress_messages(mut self, count: usize) -> Self {
        self.max_outgress_messages = count;
        self
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Publisher identity stamped on every network message.
    #[serde(default = "default_publisher_id")]
    pub publisher_id: String,

    /// Default messaging mode.
    #[serde(default)]
    pub messaging_mode: MessagingMode,

    /// Default message encoding.
    #[serde(default)]
    pub message_encoding: MessageEncoding,

    /// Default batching settings.
    #[serde(default)]
    pub batching: BatchSettings,

    /// Diagnostics logging interval in seconds (0 = disabled).
    #[serde(default = "default_diagnostics_interval")]
    pub diagnostics_interval_secs: u64,

    /// Publishing interval used when neither data set nor node sets one.
    #[serde(default = "default_publishing_interval")]
    pub default_publishing_interval_ms: u64,

    /// Key frame count used when the data set does not set one (0 = none).
    #[serde(default)]
    pub default_key_frame_count: u32,

    /// Metadata send interval used when the data set does not set one (0 = none).
    #[serde(default)]
    pub default_metadata_interval_ms: u64,

    /// Maximum number of nodes in one data set writer.
    #[serde(default = "default_max_nodes_per_dataset")]
    pub max_nodes_per_dataset: usize,
}

fn default_publisher_id() -> String {
    "telepub".to_string()
}

fn default_diagnostics_interval() -> u64 {
    60
}

fn default_publishing_interval() -> u64 {
    1000
}

fn default_max_nodes_per_dataset() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            publisher_id: default_publisher_id(),
            messaging_mode: MessagingMode::default(),
            message_encoding: MessageEncoding::default(),
            batching: BatchSettings::default(),
            diagnostics_interval_secs: default_diagnostics_interval(),
            default_publishing_interval_ms: default_publishing_interval(),
            default_key_frame_count: 0,
            default_metadata_interval_ms: 0,
            max_nodes_per_dataset: default_max_nodes_per_dataset(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.publisher_id.is_empty() {
            return Err(ConfigError::Invalid("Publisher id must not be empty".into()));
        }
        if self.batching.batch_size == 0 {
            return Err(ConfigError::Invalid("Batch size must be at least 1".into()));
        }
        if self.batching.max_outgress_messages == 0 {
            return Err(ConfigError::Invalid(
                "Max outgress messages must be at least 1".into(),
            ));
        }
        if self.max_nodes_per_dataset == 0 {
            return Err(ConfigError::Invalid(
                "Max nodes per data set must be at least 1".into(),
            ));
        }
        if self.default_publishing_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "Default publishing interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Diagnostics interval, `None` when disabled.
    pub fn diagnostics_interval(&self) -> Option<Duration> {
        (self.diagnostics_interval_secs > 0)
            .then(|| Duration::from_secs(self.diagnostics_interval_secs))
    }

    /// Set the publisher id.
    pub fn publisher_id(mut self, id: impl Into<String>) -> Self {
        self.publisher_id = id.into();
        self
    }

    /// Set messaging mode and encoding.
    pub fn messaging(mut self, mode: MessagingMode, encoding: MessageEncoding) -> Self {
        self.messaging_mode = mode;
        self.message_encoding = encoding;
        self
    }

    /// Set batching defaults.
    pub fn batching(mut self, batching: BatchSettings) -> Self {
        self.batching = batching;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batching.max_outgress_messages, 4096);
        assert_eq!(config.diagnostics_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_effective_max_message_size() {
        let unbounded = BatchSettings::default();
        assert_eq!(unbounded.effective_max_message_size(0), usize::MAX);
        assert_eq!(unbounded.effective_max_message_size(256 * 1024), 256 * 1024);

        let bounded = BatchSettings::default().with_max_message_size(1024);
        assert_eq!(bounded.effective_max_message_size(0), 1024);
        assert_eq!(bounded.effective_max_message_size(512), 512);
        assert_eq!(bounded.effective_max_message_size(4096), 1024);
    }

    #[test]
    fn test_batching_flags() {
        assert!(!BatchSettings::default().with_batch_size(1).is_batching());
        assert!(BatchSettings::default().with_batch_size(2).is_batching());
        assert!(BatchSettings::default()
            .with_trigger_interval_ms(0)
            .batch_trigger_interval()
            .is_none());
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let config =
            EngineConfig::default().batching(BatchSettings::default().with_batch_size(0));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_file() {
        let toml = r#"
publisher_id = "line-4"
messaging_mode = "Samples"
message_encoding = "Binary"
diagnostics_interval_secs = 0

[batching]
batch_size = 10
max_message_size = 65536
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.publisher_id, "line-4");
        assert_eq!(config.messaging_mode, MessagingMode::Samples);
        assert_eq!(config.message_encoding, MessageEncoding::Binary);
        assert_eq!(config.batching.batch_size, 10);
        assert_eq!(config.batching.batch_trigger_interval_ms, 10_000);
        assert_eq!(config.batching.max_message_size, 65536);
        assert!(config.diagnostics_interval().is_none());
    }
}
