// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Published nodes file model.
//!
//! The file is a JSON array of endpoint entries with PascalCase field names.
//! Each entry names one data source connection, one data set and the nodes
//! published from it. Interval fields exist in two forms: integer
//! milliseconds and a `[d.]hh:mm:ss[.fffffff]` timespan string. The timespan
//! wins when both are set.

use crate::error::ReconcileError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use telepub::{AuthMode, ConnectionModel, MessageEncoding, MessagingMode, PublishedItem};

/// One monitored node of an endpoint entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OpcNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded_node_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_set_field_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opc_sampling_interval: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "timespan::option")]
    pub opc_sampling_interval_timespan: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opc_publishing_interval: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "timespan::option")]
    pub opc_publishing_interval_timespan: Option<Duration>,

    /// Heartbeat interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "timespan::option")]
    pub heartbeat_interval_timespan: Option<Duration>,

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

impl OpcNode {
    /// Node with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Set the publishing interval in milliseconds.
    pub fn with_publishing_interval(mut self, ms: u64) -> Self {
        self.opc_publishing_interval = Some(ms);
        self
    }

    /// The node id, falling back to the expanded node id.
    pub fn node_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or(self.expanded_node_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn publishing_interval(&self) -> Option<Duration> {
        self.opc_publishing_interval_timespan
            .or_else(|| self.opc_publishing_interval.map(Duration::from_millis))
    }

    pub fn sampling_interval(&self) -> Option<Duration> {
        self.opc_sampling_interval_timespan
            .or_else(|| self.opc_sampling_interval.map(Duration::from_millis))
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        self.heartbeat_interval_timespan
            .or_else(|| self.heartbeat_interval.map(Duration::from_secs))
    }

    /// Whether both describe the same monitored node (id and publishing interval).
    pub fn is_same(&self, other: &OpcNode) -> bool {
        self.node_id() == other.node_id() && self.publishing_interval() == other.publishing_interval()
    }

    /// Monitored item for the engine.
    pub fn to_published_item(&self) -> PublishedItem {
        let mut item = PublishedItem::new(self.node_id().unwrap_or_default());
        item.display_name = self.display_name.clone();
        item.field_id = self.data_set_field_id.clone();
        item.sampling_interval_ms = self.sampling_interval().map(duration_ms);
        item.heartbeat_interval_ms = self.heartbeat().map(duration_ms);
        item.queue_size = self.queue_size;
        item.discard_new = self.discard_new;
        item.skip_first = self.skip_first;
        item.data_change_trigger = self.data_change_trigger.clone();
        item.deadband_type = self.deadband_type.clone();
        item.deadband_value = self.deadband_value;
        item
    }
}

/// Legacy single node reference (`"NodeId": { "Identifier": ... }`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LegacyNodeId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

/// One endpoint entry of the published nodes file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PublishedNodesEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change_date_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub endpoint_url: String,

    #[serde(default)]
    pub use_security: bool,

    #[serde(default)]
    pub opc_authentication_mode: AuthMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opc_authentication_username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opc_authentication_password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_set_writer_group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_set_writer_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_set_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_set_description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_set_class_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_set_publishing_interval: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "timespan::option")]
    pub data_set_publishing_interval_timespan: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_set_key_frame_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data_update_time: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "timespan::option")]
    pub meta_data_update_time_timespan: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_keep_alive_data_set_messages: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messaging_mode: Option<MessagingMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_encoding: Option<MessageEncoding>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_trigger_interval: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_set_extension_fields: Option<BTreeMap<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opc_nodes: Option<Vec<OpcNode>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<LegacyNodeId>,
}

impl PublishedNodesEntry {
    /// Entry for `endpoint_url` without nodes.
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            ..Default::default()
        }
    }

    /// Set the writer group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.data_set_writer_group = Some(group.into());
        self
    }

    /// Set the data set writer id.
    pub fn writer(mut self, writer_id: impl Into<String>) -> Self {
        self.data_set_writer_id = Some(writer_id.into());
        self
    }

    /// Append nodes.
    pub fn nodes<I: IntoIterator<Item = OpcNode>>(mut self, nodes: I) -> Self {
        self.opc_nodes.get_or_insert_with(Vec::new).extend(nodes);
        self
    }

    /// Nodes of the entry (empty when absent).
    pub fn opc_nodes(&self) -> &[OpcNode] {
        self.opc_nodes.as_deref().unwrap_or_default()
    }

    pub fn has_nodes(&self) -> bool {
        !self.opc_nodes().is_empty()
    }

    pub fn publishing_interval(&self) -> Option<Duration> {
        self.data_set_publishing_interval_timespan
            .or_else(|| self.data_set_publishing_interval.map(Duration::from_millis))
    }

    pub fn metadata_update_time(&self) -> Option<Duration> {
        self.meta_data_update_time_timespan
            .or_else(|| self.meta_data_update_time.map(Duration::from_millis))
    }

    /// Same connection and writer group: endpoint (case-insensitive),
    /// security, credentials and group.
    pub fn has_same_group(&self, other: &PublishedNodesEntry) -> bool {
        self.endpoint_url.eq_ignore_ascii_case(&other.endpoint_url)
            && self.use_security == other.use_security
            && self.opc_authentication_mode == other.opc_authentication_mode
            && self.opc_authentication_username == other.opc_authentication_username
            && self.opc_authentication_password == other.opc_authentication_password
            && self.data_set_writer_group == other.data_set_writer_group
    }

    /// Same group, writer id and publishing interval.
    pub fn has_same_data_set(&self, other: &PublishedNodesEntry) -> bool {
        self.has_same_group(other)
            && self.data_set_writer_id == other.data_set_writer_id
            && self.publishing_interval() == other.publishing_interval()
    }

    /// Connection identity of the entry.
    pub fn connection(&self) -> ConnectionModel {
        let mut connection = ConnectionModel::new(self.endpoint_url.clone());
        connection.use_security = self.use_security;
        connection.auth_mode = self.opc_authentication_mode;
        if self.opc_authentication_mode == AuthMode::UsernamePassword {
            connection.username = self.opc_authentication_username.clone();
            connection.password = self.opc_authentication_password.clone();
        }
        connection.group = self.data_set_writer_group.clone();
        connection
    }

    /// Header fields only, as listed by `get_configured_endpoints`.
    pub fn header(&self) -> PublishedNodesEntry {
        PublishedNodesEntry {
            opc_nodes: None,
            node_id: None,
            opc_authentication_password: None,
            data_set_publishing_interval: if self.data_set_publishing_interval_timespan.is_some() {
                None
            } else {
                self.data_set_publishing_interval
            },
            ..self.clone()
        }
    }

    /// Rewrite a legacy `NodeId` reference into `OpcNodes`.
    pub fn normalize_legacy_node_id(&mut self) -> Result<(), ReconcileError> {
        let Some(identifier) = self
            .node_id
            .take()
            .and_then(|n| n.identifier)
            .filter(|id| !id.is_empty())
        else {
            return Ok(());
        };
        if self.has_nodes() {
            return Err(ReconcileError::Malformed(format!(
                "entry for {} defines both OpcNodes and NodeId",
                self.endpoint_url
            )));
        }
        self.opc_nodes = Some(vec![OpcNode::new(identifier)]);
        Ok(())
    }
}

/// Parse published nodes content and rewrite legacy entries.
pub fn parse_entries(content: &str) -> Result<Vec<PublishedNodesEntry>, ReconcileError> {
    let mut entries: Vec<PublishedNodesEntry> = serde_json::from_str(content)?;
    for entry in entries.iter_mut() {
        entry.normalize_legacy_node_id()?;
    }
    Ok(entries)
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// `[d.]hh:mm:ss[.fffffff]` timespans.
pub mod timespan {
    use std::time::Duration;

    const TICKS_PER_SECOND: u32 = 10_000_000;
    const NANOS_PER_TICK: u32 = 100;

    /// Parse a timespan string.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(format!("invalid timespan '{}'", s));
        }

        let (days, hours) = match parts[0].split_once('.') {
            Some((d, h)) => (number(d, s)?, number(h, s)?),
            None => (0, number(parts[0], s)?),
        };
        let minutes = number(parts[1], s)?;
        let (seconds, fraction) = match parts[2].split_once('.') {
            Some((sec, frac)) => (number(sec, s)?, fraction_nanos(frac, s)?),
            None => (number(parts[2], s)?, 0),
        };
        if hours > 23 || minutes > 59 || seconds > 59 {
            return Err(format!("timespan component out of range in '{}'", s));
        }

        let total = ((days * 24 + hours) * 60 + minutes) * 60 + seconds;
        Ok(Duration::new(total, fraction))
    }

    /// Format a duration as a timespan string.
    pub fn format(d: Duration) -> String {
        let total = d.as_secs();
        let days = total / 86_400;
        let hours = (total / 3600) % 24;
        let minutes = (total / 60) % 60;
        let seconds = total % 60;
        let ticks = d.subsec_nanos() / NANOS_PER_TICK;

        let mut out = String::new();
        if days > 0 {
            out.push_str(&format!("{}.", days));
        }
        out.push_str(&format!("{:02}:{:02}:{:02}", hours, minutes, seconds));
        if ticks > 0 {
            out.push_str(&format!(".{:07}", ticks));
        }
        out
    }

    fn number(part: &str, s: &str) -> Result<u64, String> {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid timespan '{}'", s));
        }
        part.parse().map_err(|_| format!("invalid timespan '{}'", s))
    }

    fn fraction_nanos(frac: &str, s: &str) -> Result<u32, String> {
        if frac.is_empty() || frac.len() > 7 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid timespan fraction in '{}'", s));
        }
        let padded = format!("{:0<7}", frac);
        let ticks: u32 = padded
            .parse()
            .map_err(|_| format!("invalid timespan fraction in '{}'", s))?;
        debug_assert!(ticks < TICKS_PER_SECOND);
        Ok(ticks * NANOS_PER_TICK)
    }

    /// Serde adapter for `Option<Duration>` timespan fields.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_str(&super::format(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
            let raw: Option<String> = Option::deserialize(deserializer)?;
            raw.filter(|s| !s.trim().is_empty())
                .map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timespan_parse_and_format() {
        assert_eq!(timespan::parse("00:00:01").unwrap(), Duration::from_secs(1));
        assert_eq!(timespan::parse("00:01:30.5").unwrap(), Duration::from_millis(90_500));
        assert_eq!(
            timespan::parse("1.02:00:00").unwrap(),
            Duration::from_secs(26 * 3600)
        );
        assert_eq!(timespan::parse("00:00:00.0000001").unwrap(), Duration::from_nanos(100));
        assert!(timespan::parse("1000").is_err());
        assert!(timespan::parse("00:61:00").is_err());
        assert!(timespan::parse("00:00:01.12345678").is_err());

        assert_eq!(timespan::format(Duration::from_millis(1500)), "00:00:01.5000000");
        assert_eq!(timespan::format(Duration::from_secs(86_400 + 61)), "1.00:01:01");
    }

    #[test]
    fn test_parse_pascal_case_entry() {
        let json = r#"[{
            "EndpointUrl": "opc.tcp://plc:4840",
            "UseSecurity": true,
            "DataSetWriterGroup": "line-1",
            "DataSetWriterId": "w1",
            "DataSetPublishingInterval": 2000,
            "DataSetPublishingIntervalTimespan": "00:00:05",
            "OpcNodes": [
                { "Id": "ns=2;s=Speed", "OpcSamplingInterval": 250, "DataSetFieldId": "speed" },
                { "ExpandedNodeId": "nsu=http://x;s=Torque" }
            ]
        }]"#;
        let entries = parse_entries(json).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert!(entry.use_security);
        assert_eq!(entry.publishing_interval(), Some(Duration::from_secs(5)));
        assert_eq!(entry.opc_nodes().len(), 2);
        assert_eq!(entry.opc_nodes()[1].node_id(), Some("nsu=http://x;s=Torque"));

        let item = entry.opc_nodes()[0].to_published_item();
        assert_eq!(item.sampling_interval_ms, Some(250));
        assert_eq!(item.field_name(), "speed");
    }

    #[test]
    fn test_legacy_node_id_is_rewritten() {
        let json = r#"[{ "EndpointUrl": "opc.tcp://plc:4840", "NodeId": { "Identifier": "i=2258" } }]"#;
        let entries = parse_entries(json).unwrap();
        assert!(entries[0].node_id.is_none());
        assert_eq!(entries[0].opc_nodes()[0].id.as_deref(), Some("i=2258"));
    }

    #[test]
    fn test_legacy_node_id_with_nodes_is_malformed() {
        let json = r#"[{
            "EndpointUrl": "opc.tcp://plc:4840",
            "NodeId": { "Identifier": "i=2258" },
            "OpcNodes": [{ "Id": "i=2259" }]
        }]"#;
        assert!(matches!(parse_entries(json), Err(ReconcileError::Malformed(_))));
    }

    #[test]
    fn test_group_and_data_set_matching() {
        let a = PublishedNodesEntry::new("opc.tcp://PLC:4840").group("g").writer("w1");
        let b = PublishedNodesEntry::new("opc.tcp://plc:4840").group("g").writer("w2");
        assert!(a.has_same_group(&b));
        assert!(!a.has_same_data_set(&b));

        let mut c = a.clone();
        c.data_set_publishing_interval = Some(500);
        assert!(!a.has_same_data_set(&c));

        let d = PublishedNodesEntry::new("opc.tcp://plc:4840").group("other");
        assert!(!a.has_same_group(&d));
    }

    #[test]
    fn test_node_identity() {
        let a = OpcNode::new("ns=2;s=A");
        let mut b = OpcNode::new("ns=2;s=A");
        b.display_name = Some("A".into());
        assert!(a.is_same(&b));
        assert!(!a.is_same(&OpcNode::new("ns=2;s=A").with_publishing_interval(100)));
    }

    #[test]
    fn test_connection_drops_credentials_for_anonymous() {
        let mut entry = PublishedNodesEntry::new("opc.tcp://plc:4840").group("g");
        entry.opc_authentication_username = Some("user".into());
        let connection = entry.connection();
        assert_eq!(connection.username, None);
        assert_eq!(connection.group.as_deref(), Some("g"));

        entry.opc_authentication_mode = AuthMode::UsernamePassword;
        assert_eq!(entry.connection().username.as_deref(), Some("user"));
    }

    #[test]
    fn test_header_strips_nodes_and_secrets() {
        let mut entry = PublishedNodesEntry::new("opc.tcp://plc:4840").nodes([OpcNode::new("i=1")]);
        entry.opc_authentication_password = Some("secret".into());
        entry.data_set_publishing_interval = Some(1000);
        entry.data_set_publishing_interval_timespan = Some(Duration::from_secs(2));

        let header = entry.header();
        assert!(header.opc_nodes.is_none());
        assert!(header.opc_authentication_password.is_none());
        assert_eq!(header.data_set_publishing_interval, None);
        assert_eq!(header.publishing_interval(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_serialization_uses_pascal_case_and_skips_empty() {
        let entry = PublishedNodesEntry::new("opc.tcp://plc:4840").nodes([OpcNode::new("i=1")]);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["EndpointUrl"], "opc.tcp://plc:4840");
        assert_eq!(json["OpcNodes"][0]["Id"], "i=1");
        assert!(json.get("DataSetWriterId").is_none());
    }
}
