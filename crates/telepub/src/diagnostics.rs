// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Writer group diagnostics and the metrics context attached to them.

use crate::encoder::EncoderStats;
use crate::pipeline::PipelineStatsSnapshot;
use crate::sink::SinkStatsSnapshot;
use crate::source::SourceCountersSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Dimensions attached to every diagnostics record (publisher, job, ...).
///
/// Passed explicitly to constructors; children inherit the parent's tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsContext {
    tags: BTreeMap<String, String>,
}

impl MetricsContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Copy of this context with one more tag.
    pub fn child(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.clone().with_tag(key, value)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }
}

impl fmt::Display for MetricsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.tags.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

/// Point-in-time diagnostics of one writer group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterGroupDiagnostics {
    pub writer_group_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub uptime_secs: u64,

    pub value_changes: u64,
    pub data_changes: u64,
    pub value_changes_last_minute: u64,
    pub data_changes_last_minute: u64,

    pub ingress_batches: u64,
    pub ingress_notifications: u64,
    pub ingress_dropped: u64,
    pub batches_emitted: u64,

    pub encoder_notifications_processed: u64,
    pub encoder_notifications_dropped: u64,
    pub encoder_messages: u64,
    pub encoder_encode_failures: u64,
    pub avg_notifications_per_message: f64,
    pub avg_message_size: f64,
    pub split_ratio: f64,

    pub outgress_pending: usize,
    pub sent_messages: u64,
    pub failed_messages: u64,
    pub bytes_sent: u64,
    pub sent_per_second: f64,
}

impl WriterGroupDiagnostics {
    /// Combine the component counters into one record.
    pub fn collect(
        writer_group_id: &str,
        source: &SourceCountersSnapshot,
        pipeline: &PipelineStatsSnapshot,
        encoder: &EncoderStats,
        sink: &SinkStatsSnapshot,
    ) -> Self {
        let sent_per_second = if pipeline.uptime_secs == 0 {
            0.0
        } else {
            sink.sent_count as f64 / pipeline.uptime_secs as f64
        };
        Self {
            writer_group_id: writer_group_id.to_string(),
            timestamp: Some(Utc::now()),
            uptime_secs: pipeline.uptime_secs,
            value_changes: source.value_changes,
            data_changes: source.data_changes,
            value_changes_last_minute: source.value_changes_last_minute,
            data_changes_last_minute: source.data_changes_last_minute,
            ingress_batches: pipeline.ingress_count,
            ingress_notifications: pipeline.ingress_notifications,
            ingress_dropped: pipeline.dropped_count,
            batches_emitted: pipeline.batches_emitted,
            encoder_notifications_processed: encoder.notifications_processed,
            encoder_notifications_dropped: encoder.notifications_dropped,
            encoder_messages: encoder.messages_processed,
            encoder_encode_failures: pipeline.encode_failures,
            avg_notifications_per_message: encoder.avg_notifications_per_message,
            avg_message_size: encoder.avg_message_size,
            split_ratio: encoder.split_ratio,
            outgress_pending: pipeline.pending_messages,
            sent_messages: sink.sent_count,
            failed_messages: sink.failed_count,
            bytes_sent: sink.bytes_sent,
            sent_per_second,
        }
    }

    /// Emit the record as one structured log line.
    pub fn log(&self, metrics: &MetricsContext) {
        tracing::info!(
            writer_group = %self.writer_group_id,
            metrics = %metrics,
            uptime_secs = self.uptime_secs,
            value_changes = self.value_changes,
            value_changes_per_minute = self.value_changes_last_minute,
            data_changes = self.data_changes,
            data_changes_per_minute = self.data_changes_last_minute,
            ingress = self.ingress_batches,
            dropped = self.ingress_dropped,
            encoded_notifications = self.encoder_notifications_processed,
            encoder_dropped = self.encoder_notifications_dropped,
            messages = self.encoder_messages,
            avg_notifications_per_message = self.avg_notifications_per_message,
            avg_message_size = self.avg_message_size,
            split_ratio = self.split_ratio,
            pending = self.outgress_pending,
            sent = self.sent_messages,
            failed = self.failed_messages,
            sent_per_second = self.sent_per_second,
            "Writer group diagnostics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_context_display() {
        let root = MetricsContext::new().with_tag("publisher", "pub-1");
        let child = root.child("job", "ABC");
        assert_eq!(root.to_string(), "publisher=pub-1");
        assert_eq!(child.to_string(), "job=ABC,publisher=pub-1");
        assert_eq!(child.tag("job"), Some("ABC"));
        assert!(root.tag("job").is_none());
    }

    #[test]
    fn test_collect_combines_counters() {
        let pipeline = PipelineStatsSnapshot {
            ingress_count: 10,
            dropped_count: 2,
            uptime_secs: 4,
            ..Default::default()
        };
        let sink = SinkStatsSnapshot {
            sent_count: 8,
            failed_count: 1,
            bytes_sent: 800,
        };
        let source = SourceCountersSnapshot {
            value_changes: 30,
            ..Default::default()
        };
        let diag = WriterGroupDiagnostics::collect(
            "line-1",
            &source,
            &pipeline,
            &EncoderStats::default(),
            &sink,
        );
        assert_eq!(diag.ingress_batches, 10);
        assert_eq!(diag.ingress_dropped, 2);
        assert_eq!(diag.value_changes, 30);
        assert_eq!(diag.sent_per_second, 2.0);
    }
}
