// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Published nodes to job conversion.
//!
//! Entries sharing a connection (endpoint, security, credentials, group)
//! become one job. Inside a job, nodes are grouped by
//! `(DataSetWriterId, publishing interval)`, deduplicated and split into
//! data set writers of at most `max_nodes_per_dataset` nodes.

use crate::entry::{OpcNode, PublishedNodesEntry};
use crate::error::ReconcileError;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use telepub::{
    content_hash, BatchSettings, ConnectionModel, DataSetWriterConfig, EngineConfig, JobModel,
    WriterGroupConfig,
};

/// One data set writer before naming.
struct DataSetBatch<'a> {
    header: &'a PublishedNodesEntry,
    writer_id: Option<&'a str>,
    interval: Duration,
    nodes: Vec<&'a OpcNode>,
}

/// Converts published nodes entries into jobs.
#[derive(Debug, Clone)]
pub struct JobConverter {
    engine: EngineConfig,
}

impl JobConverter {
    pub fn new(engine: EngineConfig) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Stable job id of a connection.
    pub fn job_id(connection: &ConnectionModel) -> Result<String, ReconcileError> {
        Ok(content_hash(&serde_json::to_vec(connection)?))
    }

    /// Convert entries into jobs, one per distinct connection.
    ///
    /// Entries without nodes contribute nothing.
    pub fn convert(&self, entries: &[PublishedNodesEntry]) -> Result<Vec<JobModel>, ReconcileError> {
        let started = Instant::now();
        let mut connections: Vec<(ConnectionModel, Vec<&PublishedNodesEntry>)> = Vec::new();
        for entry in entries.iter().filter(|e| e.has_nodes()) {
            let connection = entry.connection();
            match connections.iter_mut().find(|(c, _)| *c == connection) {
                Some((_, group)) => group.push(entry),
                None => connections.push((connection, vec![entry])),
            }
        }

        let mut jobs = Vec::with_capacity(connections.len());
        let mut total_nodes = 0;
        for (connection, group) in &connections {
            let batches = self.batches(group);
            if batches.is_empty() {
                continue;
            }
            let job = self.to_job(connection, group, &batches)?;
            for writer in &job.writer_group.writers {
                tracing::debug!(
                    job = %job.id,
                    writer = %writer.writer_id,
                    nodes = writer.items.len(),
                    "Data set writer converted"
                );
                total_nodes += writer.items.len();
            }
            jobs.push(job);
        }

        tracing::info!(
            jobs = jobs.len(),
            nodes = total_nodes,
            elapsed = ?started.elapsed(),
            "Converted published nodes entries to jobs"
        );
        Ok(jobs)
    }

    fn default_interval(&self) -> Duration {
        Duration::from_millis(self.engine.default_publishing_interval_ms)
    }

    /// Group the nodes of one connection into sized data set batches.
    fn batches<'a>(&self, group: &[&'a PublishedNodesEntry]) -> Vec<DataSetBatch<'a>> {
        let mut sets: Vec<DataSetBatch<'a>> = Vec::new();
        let mut seen: HashSet<(Option<&'a str>, Duration, &'a str)> = HashSet::new();

        for entry in group.iter().copied() {
            let writer_id = entry.data_set_writer_id.as_deref();
            for node in entry.opc_nodes() {
                let Some(node_id) = node.node_id() else {
                    tracing::warn!(endpoint = %entry.endpoint_url, "Skipping node without id");
                    continue;
                };
                let interval = node
                    .publishing_interval()
                    .or_else(|| entry.publishing_interval())
                    .unwrap_or_else(|| self.default_interval());
                if !seen.insert((writer_id, interval, node_id)) {
                    continue;
                }
                match sets
                    .iter_mut()
                    .find(|s| s.writer_id == writer_id && s.interval == interval)
                {
                    Some(set) => set.nodes.push(node),
                    None => sets.push(DataSetBatch {
                        header: entry,
                        writer_id,
                        interval,
                        nodes: vec![node],
                    }),
                }
            }
        }

        let max = self.engine.max_nodes_per_dataset.max(1);
        let mut batches = Vec::new();
        for set in sets {
            for chunk in set.nodes.chunks(max) {
                batches.push(DataSetBatch {
                    header: set.header,
                    writer_id: set.writer_id,
                    interval: set.interval,
                    nodes: chunk.to_vec(),
                });
            }
        }
        batches
    }

    fn to_job(
        &self,
        connection: &ConnectionModel,
        group: &[&PublishedNodesEntry],
        batches: &[DataSetBatch<'_>],
    ) -> Result<JobModel, ReconcileError> {
        let id = Self::job_id(connection)?;
        let first = group[0];

        let names = unique_writer_names(batches);
        let mut writer_group = WriterGroupConfig::new(
            connection
                .group
                .clone()
                .unwrap_or_else(|| connection.endpoint_url.clone()),
            self.engine.publisher_id.clone(),
        );
        writer_group.messaging_mode = first.messaging_mode.unwrap_or(self.engine.messaging_mode);
        writer_group.encoding = first.message_encoding.unwrap_or(self.engine.message_encoding);
        writer_group.batching = self.batching(first);

        for (index, (batch, name)) in batches.iter().zip(names).enumerate() {
            let dataset_writer_id = u16::try_from(index + 1).map_err(|_| {
                ReconcileError::Malformed(format!(
                    "too many data set writers for {}",
                    connection.endpoint_url
                ))
            })?;
            let header = batch.header;
            let mut writer = DataSetWriterConfig::new(
                name,
                dataset_writer_id,
                connection.clone(),
                batch.nodes.iter().map(|n| n.to_published_item()).collect(),
            );
            writer.dataset_name = header.data_set_name.clone();
            writer.dataset_class_id = header.data_set_class_id.clone();
            writer.publishing_interval_ms = millis(batch.interval);
            writer.key_frame_count = header
                .data_set_key_frame_count
                .unwrap_or(self.engine.default_key_frame_count);
            writer.metadata_send_interval_ms = header
                .metadata_update_time()
                .map(millis)
                .unwrap_or(self.engine.default_metadata_interval_ms);
            writer.send_keep_alive = header.send_keep_alive_data_set_messages.unwrap_or(false);
            writer.extension_fields = header.data_set_extension_fields.clone().unwrap_or_default();
            writer_group.writers.push(writer);
        }

        tracing::info!(
            job = %id,
            writer_group = %writer_group.writer_group_id,
            writers = writer_group.writers.len(),
            "Job converted"
        );
        Ok(JobModel::new(id, writer_group))
    }

    fn batching(&self, entry: &PublishedNodesEntry) -> BatchSettings {
        let mut batching = self.engine.batching;
        if let Some(size) = entry.batch_size {
            batching.batch_size = size.max(1);
        }
        if let Some(ms) = entry.batch_trigger_interval {
            batching.batch_trigger_interval_ms = ms;
        }
        batching
    }
}

/// Writer names unique within one job.
///
/// The configured writer id is used as is when it names a single batch.
/// Otherwise the publishing interval is appended, then the first node id,
/// then a counter as a last resort.
fn unique_writer_names(batches: &[DataSetBatch<'_>]) -> Vec<String> {
    let mut names = Vec::with_capacity(batches.len());
    let mut used = HashSet::new();

    for batch in batches {
        let same_id: Vec<&DataSetBatch<'_>> = batches
            .iter()
            .filter(|b| b.writer_id == batch.writer_id)
            .collect();
        let base = batch.writer_id.unwrap_or_default();
        let interval = millis(batch.interval).to_string();

        let mut name = if same_id.len() > 1 {
            let mut name = if base.is_empty() {
                interval
            } else {
                format!("{}_{}", base, interval)
            };
            if same_id.iter().filter(|b| b.interval == batch.interval).count() > 1 {
                if let Some(first) = batch.nodes.first().and_then(|n| n.node_id()) {
                    name = format!("{}_{}", name, first);
                }
            }
            name
        } else if base.is_empty() {
            interval
        } else {
            base.to_string()
        };

        if used.contains(&name) {
            let mut counter = 1;
            while used.contains(&format!("{}_{}", name, counter)) {
                counter += 1;
            }
            name = format!("{}_{}", name, counter);
        }
        used.insert(name.clone());
        names.push(name);
    }
    names
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}
