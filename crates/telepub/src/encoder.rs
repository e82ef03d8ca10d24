// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message encoder.
//!
//! Turns notification batches into [`WireMessage`]s. The strategy is fixed at
//! construction from (messaging mode, encoding):
//!
//! | Mode    | JSON                         | Binary                          |
//! |---------|------------------------------|---------------------------------|
//! | Samples | one object per notification  | one record per notification     |
//! | PubSub  | network message of data sets | network header + data set frames|
//!
//! # Binary framing (little-endian)
//!
//! ```text
//! Samples, batched:    0x01 | count (u32) | { len (u32) | sample }*
//! Samples, single:     0x00 | sample
//! Network:             version (u8) | kind (u8) | mask (u32) | [publisher] |
//!                      [group] | message id (16) | count (u16) |
//!                      { len (u32) | data set message }*
//! Strings:             len (u16) | utf-8 bytes
//! ```
//!
//! A unit (one sample, or one data set message) is never split across two
//! messages. Units that cannot fit the size bound on their own are dropped.

use crate::config::{MessageEncoding, MessagingMode};
use crate::message::{
    MessageType, Notification, NotificationBatch, WireMessage, CONTENT_TYPE_BINARY,
    CONTENT_TYPE_JSON,
};
use byteorder::{LittleEndian, WriteBytesExt};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use thiserror::Error;
use uuid::Uuid;

/// Content mask bits: optional fields present in a message.
pub mod content_mask {
    /// Network message carries the publisher id.
    pub const PUBLISHER_ID: u32 = 0x0001;
    /// Network message carries the writer group name.
    pub const WRITER_GROUP: u32 = 0x0002;
    /// Data set messages carry a timestamp.
    pub const TIMESTAMP: u32 = 0x0010;
    /// Data set messages carry the metadata version.
    pub const METADATA_VERSION: u32 = 0x0020;
    /// Fields carry their status code.
    pub const STATUS: u32 = 0x0100;
    /// Fields carry their source timestamp.
    pub const SOURCE_TIMESTAMP: u32 = 0x0200;

    /// Every optional field.
    pub const ALL: u32 =
        PUBLISHER_ID | WRITER_GROUP | TIMESTAMP | METADATA_VERSION | STATUS | SOURCE_TIMESTAMP;
}

const NETWORK_VERSION: u8 = 1;
const NETWORK_KIND_DATA: u8 = 1;
const NETWORK_KIND_METADATA: u8 = 2;

/// Encoding errors.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Notification has no node id")]
    MissingNodeId,

    #[error("Metadata batch carries no metadata")]
    MissingMetadata,

    #[error("Field {field} too long for binary encoding ({len} bytes)")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    SamplesJson,
    SamplesBinary,
    NetworkJson,
    NetworkBinary,
}

impl Strategy {
    fn is_samples(self) -> bool {
        matches!(self, Self::SamplesJson | Self::SamplesBinary)
    }

    fn content_type(self) -> &'static str {
        match self {
            Self::SamplesJson | Self::NetworkJson => CONTENT_TYPE_JSON,
            Self::SamplesBinary | Self::NetworkBinary => CONTENT_TYPE_BINARY,
        }
    }
}

/// One indivisible piece of a message body.
struct Unit {
    bytes: Vec<u8>,
    notifications: usize,
}

/// Size model of a message: header/trailer bytes, bytes added per unit,
/// separator bytes between units.
struct Framing {
    fixed: usize,
    per_unit: usize,
    separator: usize,
    max_units: usize,
}

impl Framing {
    fn single(&self, unit: &Unit) -> usize {
        self.fixed + self.per_unit + unit.bytes.len()
    }
}

/// Encoder diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncoderStats {
    pub notifications_processed: u64,
    pub notifications_dropped: u64,
    pub messages_processed: u64,
    pub avg_notifications_per_message: f64,
    pub avg_message_size: f64,
    /// Messages produced / minimum messages required, averaged over the
    /// encode calls that had to honor a size bound.
    pub split_ratio: f64,
}

#[derive(Debug, Default)]
struct Totals {
    notifications_processed: u64,
    notifications_dropped: u64,
    messages: u64,
    notifications_in_messages: u64,
    bytes: u64,
    split_ratio_sum: f64,
    split_samples: u64,
}

/// Batch-to-message encoder of one writer group.
pub struct MessageEncoder {
    strategy: Strategy,
    publisher_id: String,
    content_mask: u32,
    totals: Mutex<Totals>,
}

impl MessageEncoder {
    /// Create an encoder for the given messaging mode and encoding.
    pub fn new(mode: MessagingMode, encoding: MessageEncoding, publisher_id: impl Into<String>) -> Self {
        let strategy = match (mode, encoding) {
            (MessagingMode::Samples, MessageEncoding::Json) => Strategy::SamplesJson,
            (MessagingMode::Samples, MessageEncoding::Binary) => Strategy::SamplesBinary,
            (MessagingMode::PubSub, MessageEncoding::Json) => Strategy::NetworkJson,
            (MessagingMode::PubSub, MessageEncoding::Binary) => Strategy::NetworkBinary,
        };
        Self {
            strategy,
            publisher_id: publisher_id.into(),
            content_mask: content_mask::ALL,
            totals: Mutex::new(Totals::default()),
        }
    }

    /// Restrict the optional fields written (see [`content_mask`]).
    pub fn with_content_mask(mut self, mask: u32) -> Self {
        self.content_mask = mask;
        self
    }

    pub fn content_type(&self) -> &'static str {
        self.strategy.content_type()
    }

    fn has(&self, bit: u32) -> bool {
        self.content_mask & bit != 0
    }

    /// Encode `batches` into wire messages no larger than `max_message_size`
    /// (0 = unbounded). With `as_batch`, several units are packed into one
    /// message; otherwise every unit becomes its own message.
    ///
    /// Per-unit failures are logged, counted and skipped.
    pub fn encode(
        &self,
        batches: &[NotificationBatch],
        max_message_size: usize,
        as_batch: bool,
    ) -> Result<Vec<WireMessage>, EncodeError> {
        let limit = if max_message_size == 0 {
            usize::MAX
        } else {
            max_message_size
        };

        let mut out = Vec::new();
        let mut pending: Vec<Unit> = Vec::new();
        let mut pending_group: Option<&str> = None;
        let mut processed = 0u64;
        let mut dropped = 0u64;

        for batch in batches {
            if batch.message_type == MessageType::Metadata {
                if self.strategy.is_samples() {
                    continue;
                }
                if let Some(group) = pending_group {
                    self.flush(&mut pending, group, limit, as_batch, &mut out, &mut dropped)?;
                }
                match self.metadata_message(batch) {
                    Ok(message) if message.size() <= limit => out.push(message),
                    Ok(message) => tracing::warn!(
                        writer = %batch.writer_id,
                        "Metadata message of {} bytes exceeds limit {}, dropped",
                        message.size(),
                        limit
                    ),
                    Err(e) => tracing::warn!(writer = %batch.writer_id, "Failed to encode metadata: {}", e),
                }
                continue;
            }

            if let Some(group) = pending_group {
                if group != batch.writer_group_id {
                    self.flush(&mut pending, group, limit, as_batch, &mut out, &mut dropped)?;
                }
            }
            pending_group = Some(batch.writer_group_id.as_str());
            processed += batch.len() as u64;

            match self.strategy {
                Strategy::SamplesJson | Strategy::SamplesBinary => {
                    for notification in &batch.notifications {
                        let encoded = if self.strategy == Strategy::SamplesJson {
                            self.sample_json(batch, notification)
                        } else {
                            self.sample_binary(batch, notification)
                        };
                        match encoded {
                            Ok(bytes) => pending.push(Unit {
                                bytes,
                                notifications: 1,
                            }),
                            Err(e) => {
                                dropped += 1;
                                tracing::debug!(node = %notification.node_id, "Sample dropped: {}", e);
                            }
                        }
                    }
                }
                Strategy::NetworkJson | Strategy::NetworkBinary => {
                    let encoded = if self.strategy == Strategy::NetworkJson {
                        self.dataset_json(batch, &mut dropped)
                    } else {
                        self.dataset_binary(batch, &mut dropped)
                    };
                    match encoded {
                        Ok(unit) => pending.push(unit),
                        Err(e) => {
                            dropped += batch.len() as u64;
                            tracing::debug!(writer = %batch.writer_id, "Data set message dropped: {}", e);
                        }
                    }
                }
            }
        }
        if let Some(group) = pending_group {
            self.flush(&mut pending, group, limit, as_batch, &mut out, &mut dropped)?;
        }

        self.record(&out, processed, dropped, limit);
        Ok(out)
    }

    /// Pack `pending` units into messages and append them to `out`.
    fn flush(
        &self,
        pending: &mut Vec<Unit>,
        group: &str,
        limit: usize,
        as_batch: bool,
        out: &mut Vec<WireMessage>,
        dropped: &mut u64,
    ) -> Result<(), EncodeError> {
        if pending.is_empty() {
            return Ok(());
        }
        let framing = self.framing(group, as_batch);
        let mut chunk: Vec<Unit> = Vec::new();
        let mut chunk_size = 0usize;

        for unit in pending.drain(..) {
            if framing.single(&unit) > limit {
                *dropped += unit.notifications as u64;
                tracing::warn!(
                    "Unit of {} bytes can not fit in a {} byte message, dropped",
                    unit.bytes.len(),
                    limit
                );
                continue;
            }

            let added = framing.per_unit + unit.bytes.len() + framing.separator;
            let fits = !chunk.is_empty()
                && as_batch
                && chunk.len() < framing.max_units
                && chunk_size + added <= limit;
            if !chunk.is_empty() && !fits {
                out.push(self.assemble(group, std::mem::take(&mut chunk), as_batch)?);
            }
            if chunk.is_empty() {
                chunk_size = framing.single(&unit);
            } else {
                chunk_size += added;
            }
            chunk.push(unit);
        }
        if !chunk.is_empty() {
            out.push(self.assemble(group, chunk, as_batch)?);
        }
        Ok(())
    }

    fn framing(&self, group: &str, as_batch: bool) -> Framing {
        match (self.strategy, as_batch) {
            (Strategy::SamplesJson, true) => Framing {
                fixed: 2,
                per_unit: 0,
                separator: 1,
                max_units: usize::MAX,
            },
            (Strategy::SamplesBinary, true) => Framing {
                fixed: 5,
                per_unit: 4,
                separator: 0,
                max_units: u32::MAX as usize,
            },
            (Strategy::SamplesJson, false) => Framing {
                fixed: 0,
                per_unit: 0,
                separator: 0,
                max_units: 1,
            },
            (Strategy::SamplesBinary, false) => Framing {
                fixed: 1,
                per_unit: 0,
                separator: 0,
                max_units: 1,
            },
            (Strategy::NetworkJson, _) => {
                let (prefix, suffix) = self.network_json_frame(&Uuid::nil().to_string(), group);
                Framing {
                    fixed: prefix.len() + suffix.len(),
                    per_unit: 0,
                    separator: 1,
                    max_units: usize::MAX,
                }
            }
            (Strategy::NetworkBinary, _) => Framing {
                fixed: self.network_binary_header_len(group),
                per_unit: 4,
                separator: 0,
                max_units: u16::MAX as usize,
            },
        }
    }

    fn assemble(&self, group: &str, units: Vec<Unit>, as_batch: bool) -> Result<WireMessage, EncodeError> {
        let message_id = Uuid::new_v4();
        let notification_count = units.iter().map(|u| u.notifications).sum();
        let mut body = Vec::new();

        match (self.strategy, as_batch) {
            (Strategy::SamplesJson, true) => {
                body.push(b'[');
                join_json(&mut body, &units);
                body.push(b']');
            }
            (Strategy::SamplesJson, false) => {
                for unit in &units {
                    body.extend_from_slice(&unit.bytes);
                }
            }
            (Strategy::SamplesBinary, true) => {
                body.write_u8(1)?;
                body.write_u32::<LittleEndian>(units.len() as u32)?;
                write_frames(&mut body, &units)?;
            }
            (Strategy::SamplesBinary, false) => {
                body.write_u8(0)?;
                for unit in &units {
                    body.extend_from_slice(&unit.bytes);
                }
            }
            (Strategy::NetworkJson, _) => {
                let (prefix, suffix) = self.network_json_frame(&message_id.to_string(), group);
                body.extend_from_slice(prefix.as_bytes());
                join_json(&mut body, &units);
                body.extend_from_slice(suffix.as_bytes());
            }
            (Strategy::NetworkBinary, _) => {
                self.write_network_header(&mut body, NETWORK_KIND_DATA, group, &message_id)?;
                body.write_u16::<LittleEndian>(units.len() as u16)?;
                write_frames(&mut body, &units)?;
            }
        }

        Ok(WireMessage {
            message_id: message_id.to_string(),
            content_type: self.strategy.content_type(),
            body,
            timestamp: Utc::now(),
            notification_count,
            is_metadata: false,
        })
    }

    fn network_json_frame(&self, message_id: &str, group: &str) -> (String, String) {
        let mut prefix = format!(
            "{{\"MessageId\":{},\"MessageType\":\"ua-data\"",
            json_string(message_id)
        );
        if self.has(content_mask::PUBLISHER_ID) {
            prefix.push_str(&format!(",\"PublisherId\":{}", json_string(&self.publisher_id)));
        }
        if self.has(content_mask::WRITER_GROUP) {
            prefix.push_str(&format!(",\"DataSetWriterGroup\":{}", json_string(group)));
        }
        prefix.push_str(",\"Messages\":[");
        (prefix, "]}".to_string())
    }

    fn network_binary_header_len(&self, group: &str) -> usize {
        let mut len = 1 + 1 + 4 + 16 + 2;
        if self.has(content_mask::PUBLISHER_ID) {
            len += 2 + self.publisher_id.len();
        }
        if self.has(content_mask::WRITER_GROUP) {
            len += 2 + group.len();
        }
        len
    }

    fn write_network_header(
        &self,
        body: &mut Vec<u8>,
        kind: u8,
        group: &str,
        message_id: &Uuid,
    ) -> Result<(), EncodeError> {
        body.write_u8(NETWORK_VERSION)?;
        body.write_u8(kind)?;
        body.write_u32::<LittleEndian>(self.content_mask)?;
        if self.has(content_mask::PUBLISHER_ID) {
            write_str(body, "PublisherId", &self.publisher_id)?;
        }
        if self.has(content_mask::WRITER_GROUP) {
            write_str(body, "DataSetWriterGroup", group)?;
        }
        body.write_all(message_id.as_bytes())?;
        Ok(())
    }

    fn field_value(&self, notification: &Notification) -> Value {
        let mut value = Map::new();
        value.insert("Value".into(), notification.value.value.clone());
        if self.has(content_mask::SOURCE_TIMESTAMP) {
            if let Some(ts) = notification.value.source_timestamp {
                value.insert("SourceTimestamp".into(), timestamp_value(ts));
            }
        }
        if self.has(content_mask::STATUS) {
            value.insert("StatusCode".into(), Value::from(notification.value.status_code));
        }
        Value::Object(value)
    }

    fn sample_json(&self, batch: &NotificationBatch, notification: &Notification) -> Result<Vec<u8>, EncodeError> {
        if notification.node_id.is_empty() {
            return Err(EncodeError::MissingNodeId);
        }
        let mut sample = Map::new();
        sample.insert("NodeId".into(), Value::from(notification.node_id.as_str()));
        sample.insert("EndpointUrl".into(), Value::from(batch.endpoint_url.as_str()));
        if let Some(name) = &notification.display_name {
            sample.insert("DisplayName".into(), Value::from(name.as_str()));
        }
        sample.insert("Value".into(), self.field_value(notification));
        sample.insert("SequenceNumber".into(), Value::from(notification.sequence_number));
        if self.has(content_mask::TIMESTAMP) {
            sample.insert("Timestamp".into(), timestamp_value(batch.timestamp));
        }
        for (key, value) in &batch.extension_fields {
            sample.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(serde_json::to_vec(&Value::Object(sample))?)
    }

    fn sample_binary(&self, batch: &NotificationBatch, notification: &Notification) -> Result<Vec<u8>, EncodeError> {
        if notification.node_id.is_empty() {
            return Err(EncodeError::MissingNodeId);
        }
        let mut w = Vec::new();
        write_str(&mut w, "NodeId", &notification.node_id)?;
        write_str(&mut w, "EndpointUrl", &batch.endpoint_url)?;
        write_str(&mut w, "FieldName", &notification.field_name)?;
        w.write_u32::<LittleEndian>(notification.sequence_number)?;
        w.write_i64::<LittleEndian>(batch.timestamp.timestamp_millis())?;
        self.write_field(&mut w, notification)?;
        let extensions = serde_json::to_vec(&batch.extension_fields)?;
        w.write_u32::<LittleEndian>(extensions.len() as u32)?;
        w.write_all(&extensions)?;
        Ok(w)
    }

    fn write_field(&self, w: &mut Vec<u8>, notification: &Notification) -> Result<(), EncodeError> {
        if self.has(content_mask::STATUS) {
            w.write_u32::<LittleEndian>(notification.value.status_code)?;
        }
        if self.has(content_mask::SOURCE_TIMESTAMP) {
            let millis = notification
                .value
                .source_timestamp
                .map(|ts| ts.timestamp_millis())
                .unwrap_or(0);
            w.write_i64::<LittleEndian>(millis)?;
        }
        let value = serde_json::to_vec(&notification.value.value)?;
        w.write_u32::<LittleEndian>(value.len() as u32)?;
        w.write_all(&value)?;
        Ok(())
    }

    fn dataset_json(&self, batch: &NotificationBatch, dropped: &mut u64) -> Result<Unit, EncodeError> {
        let mut payload = Map::new();
        let mut included = 0usize;
        for notification in &batch.notifications {
            if notification.node_id.is_empty() {
                *dropped += 1;
                tracing::debug!(writer = %batch.writer_id, "Field dropped: {}", EncodeError::MissingNodeId);
                continue;
            }
            // A field changing twice within one data set keeps its latest value.
            if payload
                .insert(notification.field_name.clone(), self.field_value(notification))
                .is_some()
            {
                *dropped += 1;
                tracing::debug!(
                    writer = %batch.writer_id,
                    field = %notification.field_name,
                    "Earlier value of repeated field dropped"
                );
            } else {
                included += 1;
            }
        }

        let mut message = Map::new();
        message.insert("DataSetWriterId".into(), Value::from(batch.dataset_writer_id));
        message.insert("SequenceNumber".into(), Value::from(batch.sequence_number));
        message.insert("MessageType".into(), Value::from(batch.message_type.as_str()));
        if self.has(content_mask::METADATA_VERSION) {
            if let Some(version) = batch.metadata_version {
                message.insert(
                    "MetaDataVersion".into(),
                    serde_json::json!({
                        "MajorVersion": version.major,
                        "MinorVersion": version.minor,
                    }),
                );
            }
        }
        if self.has(content_mask::TIMESTAMP) {
            message.insert("Timestamp".into(), timestamp_value(batch.timestamp));
        }
        for (key, value) in &batch.extension_fields {
            payload.entry(key.clone()).or_insert_with(|| value.clone());
        }
        message.insert("Payload".into(), Value::Object(payload));

        Ok(Unit {
            bytes: serde_json::to_vec(&Value::Object(message))?,
            notifications: included,
        })
    }

    fn dataset_binary(&self, batch: &NotificationBatch, dropped: &mut u64) -> Result<Unit, EncodeError> {
        let mut fields = Vec::new();
        let mut included = 0usize;
        for notification in &batch.notifications {
            let mut field = Vec::new();
            let encoded = if notification.node_id.is_empty() {
                Err(EncodeError::MissingNodeId)
            } else {
                write_str(&mut field, "FieldName", &notification.field_name)
                    .and_then(|_| self.write_field(&mut field, notification))
            };
            match encoded {
                Ok(()) => {
                    fields.extend_from_slice(&field);
                    included += 1;
                }
                Err(e) => {
                    *dropped += 1;
                    tracing::debug!(writer = %batch.writer_id, "Field dropped: {}", e);
                }
            }
        }
        if included > u16::MAX as usize {
            return Err(EncodeError::FieldTooLong {
                field: "Payload",
                len: included,
            });
        }

        let mut w = Vec::new();
        w.write_u16::<LittleEndian>(batch.dataset_writer_id)?;
        w.write_u8(batch.message_type.as_u8())?;
        w.write_u32::<LittleEndian>(batch.sequence_number)?;
        if self.has(content_mask::TIMESTAMP) {
            w.write_i64::<LittleEndian>(batch.timestamp.timestamp_millis())?;
        }
        if self.has(content_mask::METADATA_VERSION) {
            let version = batch.metadata_version.unwrap_or_default();
            w.write_u32::<LittleEndian>(version.major)?;
            w.write_u32::<LittleEndian>(version.minor)?;
        }
        w.write_u16::<LittleEndian>(included as u16)?;
        w.write_all(&fields)?;

        Ok(Unit {
            bytes: w,
            notifications: included,
        })
    }

    fn metadata_message(&self, batch: &NotificationBatch) -> Result<WireMessage, EncodeError> {
        let metadata = batch.metadata.as_ref().ok_or(EncodeError::MissingMetadata)?;
        let message_id = Uuid::new_v4();
        let mut body = Vec::new();

        match self.strategy {
            Strategy::NetworkBinary => {
                self.write_network_header(&mut body, NETWORK_KIND_METADATA, &batch.writer_group_id, &message_id)?;
                body.write_u16::<LittleEndian>(batch.dataset_writer_id)?;
                body.write_u32::<LittleEndian>(batch.sequence_number)?;
                body.write_u32::<LittleEndian>(metadata.version.major)?;
                body.write_u32::<LittleEndian>(metadata.version.minor)?;
                let json = serde_json::to_vec(metadata)?;
                body.write_u32::<LittleEndian>(json.len() as u32)?;
                body.write_all(&json)?;
            }
            _ => {
                let mut message = Map::new();
                message.insert("MessageId".into(), Value::from(message_id.to_string()));
                message.insert("MessageType".into(), Value::from(MessageType::Metadata.as_str()));
                if self.has(content_mask::PUBLISHER_ID) {
                    message.insert("PublisherId".into(), Value::from(self.publisher_id.as_str()));
                }
                if self.has(content_mask::WRITER_GROUP) {
                    message.insert(
                        "DataSetWriterGroup".into(),
                        Value::from(batch.writer_group_id.as_str()),
                    );
                }
                message.insert("DataSetWriterId".into(), Value::from(batch.dataset_writer_id));
                message.insert("SequenceNumber".into(), Value::from(batch.sequence_number));
                message.insert("MetaData".into(), serde_json::to_value(metadata)?);
                body = serde_json::to_vec(&Value::Object(message))?;
            }
        }

        Ok(WireMessage {
            message_id: message_id.to_string(),
            content_type: self.strategy.content_type(),
            body,
            timestamp: Utc::now(),
            notification_count: 0,
            is_metadata: true,
        })
    }

    fn record(&self, out: &[WireMessage], processed: u64, dropped: u64, limit: usize) {
        let data: Vec<&WireMessage> = out.iter().filter(|m| !m.is_metadata).collect();
        let mut totals = self.totals.lock();
        totals.notifications_processed += processed;
        totals.notifications_dropped += dropped;
        totals.messages += out.len() as u64;
        totals.notifications_in_messages += out.iter().map(|m| m.notification_count as u64).sum::<u64>();
        totals.bytes += out.iter().map(|m| m.size() as u64).sum::<u64>();

        if limit != usize::MAX && !data.is_empty() {
            let total: usize = data.iter().map(|m| m.size()).sum();
            let minimum = total.div_ceil(limit).max(1);
            totals.split_ratio_sum += data.len() as f64 / minimum as f64;
            totals.split_samples += 1;
        }
        if dropped > 0 {
            tracing::warn!("Dropped {} notifications while encoding", dropped);
        }
    }

    /// Snapshot of the encoder diagnostics.
    pub fn stats(&self) -> EncoderStats {
        let totals = self.totals.lock();
        let per_message = |v: u64| {
            if totals.messages == 0 {
                0.0
            } else {
                v as f64 / totals.messages as f64
            }
        };
        EncoderStats {
            notifications_processed: totals.notifications_processed,
            notifications_dropped: totals.notifications_dropped,
            messages_processed: totals.messages,
            avg_notifications_per_message: per_message(totals.notifications_in_messages),
            avg_message_size: per_message(totals.bytes),
            split_ratio: if totals.split_samples == 0 {
                0.0
            } else {
                totals.split_ratio_sum / totals.split_samples as f64
            },
        }
    }
}

fn timestamp_value(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

fn json_string(s: &str) -> String {
    Value::from(s).to_string()
}

fn join_json(body: &mut Vec<u8>, units: &[Unit]) {
    for (i, unit) in units.iter().enumerate() {
        if i > 0 {
            body.push(b',');
        }
        body.extend_from_slice(&unit.bytes);
    }
}

fn write_frames(body: &mut Vec<u8>, units: &[Unit]) -> Result<(), EncodeError> {
    for unit in units {
        body.write_u32::<LittleEndian>(unit.bytes.len() as u32)?;
        body.write_all(&unit.bytes)?;
    }
    Ok(())
}

fn write_str(w: &mut Vec<u8>, field: &'static str, s: &str) -> Result<(), EncodeError> {
    if s.len() > u16::MAX as usize {
        return Err(EncodeError::FieldTooLong { field, len: s.len() });
    }
    w.write_u16::<LittleEndian>(s.len() as u16)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}
