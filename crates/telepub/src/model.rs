// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Writer group and data set writer configuration model.
//!
//! A [`WriterGroupConfig`] is an immutable snapshot. Hosts hold it behind an
//! `Arc` and replace it wholesale on update.

use crate::config::{BatchSettings, MessageEncoding, MessagingMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Authentication used to open the data source session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AuthMode {
    #[default]
    Anonymous,
    UsernamePassword,
}

/// Identity of one data source connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionModel {
    /// Endpoint url of the data source.
    pub endpoint_url: String,

    /// Use a secured channel.
    #[serde(default)]
    pub use_security: bool,

    /// Authentication mode.
    #[serde(default)]
    pub auth_mode: AuthMode,

    /// User name when `auth_mode` is `UsernamePassword`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password when `auth_mode` is `UsernamePassword`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Writer group the connection belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl ConnectionModel {
    /// Anonymous, unsecured connection to `endpoint_url`.
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            use_security: false,
            auth_mode: AuthMode::Anonymous,
            username: None,
            password: None,
            group: None,
        }
    }
}

/// One monitored data point and its sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedItem {
    pub node_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Field name in the emitted data set; defaults to the display name or node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_interval_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discard_new: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_first: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_change_trigger: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadband_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadband_value: Option<f64>,
}

impl PublishedItem {
    /// Item with only a node id.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            display_name: None,
            field_id: None,
            sampling_interval_ms: None,
            heartbeat_interval_ms: None,
            queue_size: None,
            discard_new: None,
            skip_first: None,
            data_change_trigger: None,
            deadband_type: None,
            deadband_value: None,
        }
    }

    /// Name of the field this item produces in a data set message.
    pub fn field_name(&self) -> &str {
        self.field_id
            .as_deref()
            .or(self.display_name.as_deref())
            .unwrap_or(&self.node_id)
    }
}

/// One logical stream of notifications from one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetWriterConfig {
    /// Unique writer name within the writer group.
    pub writer_id: String,

    /// Numeric writer id carried on the wire.
    pub dataset_writer_id: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_class_id: Option<String>,

    /// Subscription publishing interval.
    pub publishing_interval_ms: u64,

    /// Emit a key frame after every N delta frames (0 = never).
    #[serde(default)]
    pub key_frame_count: u32,

    /// Emit a key frame on this period (0 = never).
    #[serde(default)]
    pub key_frame_interval_ms: u64,

    /// Emit metadata on this period (0 = only on version change).
    #[serde(default)]
    pub metadata_send_interval_ms: u64,

    /// Forward subscription keep-alives as keep-alive messages.
    #[serde(default)]
    pub send_keep_alive: bool,

    pub connection: ConnectionModel,

    pub items: Vec<PublishedItem>,

    /// Static fields appended to every message of this writer.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extension_fields: BTreeMap<String, serde_json::Value>,
}

impl DataSetWriterConfig {
    /// Writer with default timing over `items`.
    pub fn new(
        writer_id: impl Into<String>,
        dataset_writer_id: u16,
        connection: ConnectionModel,
        items: Vec<PublishedItem>,
    ) -> Self {
        Self {
            writer_id: writer_id.into(),
            dataset_writer_id,
            dataset_name: None,
            dataset_class_id: None,
            publishing_interval_ms: 1000,
            key_frame_count: 0,
            key_frame_interval_ms: 0,
            metadata_send_interval_ms: 0,
            send_keep_alive: false,
            connection,
            items,
            extension_fields: BTreeMap::new(),
        }
    }

    pub fn key_frame_interval(&self) -> Option<Duration> {
        (self.key_frame_interval_ms > 0).then(|| Duration::from_millis(self.key_frame_interval_ms))
    }

    pub fn metadata_send_interval(&self) -> Option<Duration> {
        (self.metadata_send_interval_ms > 0)
            .then(|| Duration::from_millis(self.metadata_send_interval_ms))
    }

    /// Whether a change from `self` to `other` alters the timer setup.
    pub fn timers_differ(&self, other: &Self) -> bool {
        self.key_frame_interval_ms != other.key_frame_interval_ms
            || self.metadata_send_interval_ms != other.metadata_send_interval_ms
    }
}

/// A named set of data set writers sharing transport and batching settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterGroupConfig {
    pub writer_group_id: String,

    pub publisher_id: String,

    #[serde(default)]
    pub messaging_mode: MessagingMode,

    #[serde(default)]
    pub encoding: MessageEncoding,

    #[serde(default)]
    pub batching: BatchSettings,

    pub writers: Vec<DataSetWriterConfig>,
}

impl WriterGroupConfig {
    /// Empty writer group with default pipeline settings.
    pub fn new(writer_group_id: impl Into<String>, publisher_id: impl Into<String>) -> Self {
        Self {
            writer_group_id: writer_group_id.into(),
            publisher_id: publisher_id.into(),
            messaging_mode: MessagingMode::default(),
            encoding: MessageEncoding::default(),
            batching: BatchSettings::default(),
            writers: Vec::new(),
        }
    }

    /// Add a writer.
    pub fn writer(mut self, writer: DataSetWriterConfig) -> Self {
        self.writers.push(writer);
        self
    }

    /// Look up a writer by name.
    pub fn find_writer(&self, writer_id: &str) -> Option<&DataSetWriterConfig> {
        self.writers.iter().find(|w| w.writer_id == writer_id)
    }

    /// Whether switching to `other` requires a new pipeline
    /// (encoder strategy or batching changed).
    pub fn pipeline_differs(&self, other: &Self) -> bool {
        self.publisher_id != other.publisher_id
            || self.messaging_mode != other.messaging_mode
            || self.encoding != other.encoding
            || self.batching != other.batching
    }

    /// Total number of monitored items across all writers.
    pub fn item_count(&self) -> usize {
        self.writers.iter().map(|w| w.items.len()).sum()
    }
}
