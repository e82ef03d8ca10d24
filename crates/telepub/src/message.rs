// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime message types flowing through a writer group.
//!
//! ```text
//! Subscription -> Notification* -> NotificationBatch -> (encoder) -> WireMessage
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content type of JSON encoded messages.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type of binary encoded messages.
pub const CONTENT_TYPE_BINARY: &str = "application/x-telepub-binary";

/// Status code of a good value.
pub const STATUS_GOOD: u32 = 0;

/// A sampled value with its quality and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue {
    pub value: serde_json::Value,

    #[serde(default)]
    pub status_code: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DataValue {
    /// Good value sampled now.
    pub fn good(value: serde_json::Value) -> Self {
        Self {
            value,
            status_code: STATUS_GOOD,
            source_timestamp: Some(Utc::now()),
            server_timestamp: None,
        }
    }

    pub fn is_good(&self) -> bool {
        self.status_code == STATUS_GOOD
    }
}

/// One observed change of a monitored data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Subscription that produced the notification.
    pub subscription_id: String,

    pub node_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Field name in the data set.
    pub field_name: String,

    pub value: DataValue,

    /// Sequence number assigned by the subscription.
    #[serde(default)]
    pub sequence_number: u32,

    /// Value repeated by a heartbeat rather than a real change.
    #[serde(default)]
    pub is_heartbeat: bool,
}

/// Kind of a notification batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    DeltaFrame,
    KeyFrame,
    Metadata,
    KeepAlive,
}

impl MessageType {
    /// Wire name of the message type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeltaFrame => "ua-deltaframe",
            Self::KeyFrame => "ua-keyframe",
            Self::Metadata => "ua-metadata",
            Self::KeepAlive => "ua-keepalive",
        }
    }

    /// Numeric tag used by the binary encoding.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::DeltaFrame => 1,
            Self::KeyFrame => 2,
            Self::Metadata => 3,
            Self::KeepAlive => 4,
        }
    }
}

/// Version of a data set schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct MetaDataVersion {
    pub major: u32,
    pub minor: u32,
}

impl MetaDataVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

/// Description of one data set field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetaData {
    pub name: String,
    pub node_id: String,
}

/// Schema of the data set produced by one writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSetMetaData {
    pub name: String,
    pub version: MetaDataVersion,
    pub fields: Vec<FieldMetaData>,
}

/// Ordered notifications of one writer plus the message framing around them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationBatch {
    /// Writer name.
    pub writer_id: String,

    /// Numeric writer id.
    pub dataset_writer_id: u16,

    pub writer_group_id: String,

    pub endpoint_url: String,

    /// Per-writer sequence number, never 0.
    pub sequence_number: u32,

    pub message_type: MessageType,

    pub notifications: Vec<Notification>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DataSetMetaData>,

    /// Schema version the notifications were produced with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_version: Option<MetaDataVersion>,

    pub timestamp: DateTime<Utc>,

    /// Writer extension fields, copied into every sample.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub extension_fields: std::collections::BTreeMap<String, serde_json::Value>,
}

impl NotificationBatch {
    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }
}

/// An encoded message ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    /// Correlation id.
    pub message_id: String,

    pub content_type: &'static str,

    pub body: Vec<u8>,

    pub timestamp: DateTime<Utc>,

    /// Notifications carried in the body.
    pub notification_count: usize,

    /// Whether the body carries metadata rather than data.
    pub is_metadata: bool,
}

impl WireMessage {
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// Per-writer sequence number generator that never yields 0.
#[derive(Debug, Clone, Default)]
pub struct SequenceNumber {
    current: u32,
}

impl SequenceNumber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting after `value` (test hook for wrap behaviour).
    pub fn starting_after(value: u32) -> Self {
        Self { current: value }
    }

    /// Advance and return the next number, skipping 0 on wrap.
    pub fn next(&mut self) -> u32 {
        self.current = self.current.wrapping_add(1);
        while self.current == 0 {
            self.current = self.current.wrapping_add(1);
        }
        self.current
    }

    /// Last value handed out (0 before the first call).
    pub fn current(&self) -> u32 {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_number_starts_at_one() {
        let mut seq = SequenceNumber::new();
        assert_eq!(seq.current(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[test]
    fn test_sequence_number_skips_zero_on_wrap() {
        let mut seq = SequenceNumber::starting_after(u32::MAX - 1);
        assert_eq!(seq.next(), u32::MAX);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(MessageType::KeyFrame.as_str(), "ua-keyframe");
        assert_eq!(MessageType::KeepAlive.as_u8(), 4);
    }
}
