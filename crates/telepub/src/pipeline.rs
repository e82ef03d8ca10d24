// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Writer group dataflow pipeline.
//!
//! ```text
//!  submit() --try_send--> [batcher] --> [encoder] --> [sink] --> Transport
//!                             ^
//!                   trigger --+ (manual flush)
//! ```
//!
//! The batcher emits when it holds `batch_size` items, or once the trigger
//! interval has elapsed since the first item of the pending batch arrived.
//!
//! Each stage is a Tokio task connected by bounded channels. `submit` never
//! blocks: when the number of messages waiting for the sink reaches
//! `max_outgress_messages`, or the ingress queue is full, the item is dropped
//! and counted.

use crate::config::BatchSettings;
use crate::encoder::MessageEncoder;
use crate::message::{NotificationBatch, WireMessage};
use crate::sink::MessageSink;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Batches queued between batcher and encoder.
const ENCODER_QUEUE: usize = 16;

/// Messages the sink stage hands to the transport in one call.
const SINK_CHUNK: usize = 64;

/// Pipeline errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline requires a Tokio runtime")]
    NoRuntime,

    #[error("Pipeline already started")]
    AlreadyStarted,

    #[error("Pipeline stopped")]
    Stopped,
}

/// Pipeline counters.
#[derive(Debug)]
pub struct PipelineStats {
    /// Items offered to `submit`.
    pub ingress: AtomicU64,
    /// Notifications offered to `submit`.
    pub ingress_notifications: AtomicU64,
    /// Batches handed to the encoder.
    pub batches_emitted: AtomicU64,
    /// Items dropped at ingress.
    pub dropped: AtomicU64,
    /// Encoder calls that failed as a whole.
    pub encode_failures: AtomicU64,
    /// Messages waiting for the sink.
    pub pending: AtomicUsize,
    started_at: Mutex<Instant>,
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self {
            ingress: AtomicU64::new(0),
            ingress_notifications: AtomicU64::new(0),
            batches_emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            started_at: Mutex::new(Instant::now()),
        }
    }
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            ingress_count: self.ingress.load(Ordering::Relaxed),
            ingress_notifications: self.ingress_notifications.load(Ordering::Relaxed),
            batches_emitted: self.batches_emitted.load(Ordering::Relaxed),
            dropped_count: self.dropped.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            pending_messages: self.pending.load(Ordering::Relaxed),
            uptime_secs: self.started_at.lock().elapsed().as_secs(),
        }
    }
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatsSnapshot {
    pub ingress_count: u64,
    pub ingress_notifications: u64,
    pub batches_emitted: u64,
    pub dropped_count: u64,
    pub encode_failures: u64,
    pub pending_messages: usize,
    pub uptime_secs: u64,
}

/// Batching, encoding and delivery of one writer group.
pub struct DataFlowPipeline {
    writer_group_id: String,
    settings: BatchSettings,
    encoder: Arc<MessageEncoder>,
    sink: Arc<MessageSink>,
    ingress: RwLock<Option<mpsc::Sender<NotificationBatch>>>,
    force: Arc<Notify>,
    stats: Arc<PipelineStats>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl DataFlowPipeline {
    pub fn new(
        writer_group_id: impl Into<String>,
        settings: BatchSettings,
        encoder: Arc<MessageEncoder>,
        sink: Arc<MessageSink>,
    ) -> Self {
        Self {
            writer_group_id: writer_group_id.into(),
            settings,
            encoder,
            sink,
            ingress: RwLock::new(None),
            force: Arc::new(Notify::new()),
            stats: Arc::new(PipelineStats::default()),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the stage tasks on the current runtime.
    pub fn start(&self) -> Result<(), PipelineError> {
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
        let mut ingress = self.ingress.write();
        if ingress.is_some() {
            return Err(PipelineError::AlreadyStarted);
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Stopped);
        }

        let (ingress_tx, ingress_rx) = mpsc::channel(self.settings.max_outgress_messages.max(1));
        let (batch_tx, batch_rx) = mpsc::channel(ENCODER_QUEUE);
        let (message_tx, message_rx) = mpsc::channel(self.settings.max_outgress_messages.max(1));

        let mut tasks = self.tasks.lock();
        tasks.push(runtime.spawn(run_batcher(
            ingress_rx,
            batch_tx,
            self.settings.batch_size.max(1),
            self.settings.batch_trigger_interval(),
            self.force.clone(),
            self.stats.clone(),
        )));
        tasks.push(runtime.spawn(run_encoder(
            batch_rx,
            message_tx,
            self.encoder.clone(),
            self.settings,
            self.sink.max_message_size(),
            self.stats.clone(),
            self.writer_group_id.clone(),
        )));
        tasks.push(runtime.spawn(run_sink(message_rx, self.sink.clone(), self.stats.clone())));

        *ingress = Some(ingress_tx);
        tracing::info!(
            writer_group = %self.writer_group_id,
            batch_size = self.settings.batch_size,
            trigger_ms = self.settings.batch_trigger_interval_ms,
            "Pipeline started"
        );
        Ok(())
    }

    /// Offer a batch. Never blocks; returns `false` when the batch was dropped.
    pub fn submit(&self, batch: NotificationBatch) -> bool {
        self.stats.ingress.fetch_add(1, Ordering::Relaxed);
        self.stats
            .ingress_notifications
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        if self.stats.pending.load(Ordering::Relaxed) >= self.settings.max_outgress_messages {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(writer_group = %self.writer_group_id, "Outgress full, batch dropped");
            return false;
        }

        let ingress = self.ingress.read();
        let accepted = match ingress.as_ref() {
            Some(tx) => tx.try_send(batch).is_ok(),
            None => false,
        };
        if !accepted {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// Emit whatever the batcher holds now.
    pub fn trigger(&self) {
        self.force.notify_one();
    }

    /// Complete the batcher, then the encoder, then the sink, awaiting each.
    pub async fn stop(&self) {
        let was_running = self.ingress.write().take().is_some();
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(writer_group = %self.writer_group_id, "Pipeline task failed: {}", e);
            }
        }
        if was_running {
            tracing::info!(writer_group = %self.writer_group_id, "Pipeline stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ingress.read().is_some()
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    pub fn encoder(&self) -> &Arc<MessageEncoder> {
        &self.encoder
    }

    pub fn sink(&self) -> &Arc<MessageSink> {
        &self.sink
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Restart the uptime clock used for per-second rates.
    pub fn reset_diagnostics(&self) {
        *self.stats.started_at.lock() = Instant::now();
    }
}

async fn run_batcher(
    mut rx: mpsc::Receiver<NotificationBatch>,
    tx: mpsc::Sender<Vec<NotificationBatch>>,
    batch_size: usize,
    trigger: Option<Duration>,
    force: Arc<Notify>,
    stats: Arc<PipelineStats>,
) {
    let mut buffer: Vec<NotificationBatch> = Vec::with_capacity(batch_size);
    // Set while the buffer holds items, measured from the first one.
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let forced = tokio::select! {
            biased;
            item = rx.recv() => match item {
                Some(batch) => {
                    if buffer.is_empty() {
                        deadline = trigger.map(|t| tokio::time::Instant::now() + t);
                    }
                    buffer.push(batch);
                    false
                }
                None => break,
            },
            _ = force.notified() => true,
            _ = expired(deadline) => true,
        };

        if !buffer.is_empty() && (forced || buffer.len() >= batch_size) {
            deadline = None;
            let batch = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
            stats.batches_emitted.fetch_add(1, Ordering::Relaxed);
            if tx.send(batch).await.is_err() {
                return;
            }
        }
    }

    if !buffer.is_empty() {
        stats.batches_emitted.fetch_add(1, Ordering::Relaxed);
        let _ = tx.send(buffer).await;
    }
}

async fn run_encoder(
    mut rx: mpsc::Receiver<Vec<NotificationBatch>>,
    tx: mpsc::Sender<WireMessage>,
    encoder: Arc<MessageEncoder>,
    settings: BatchSettings,
    transport_limit: usize,
    stats: Arc<PipelineStats>,
    writer_group_id: String,
) {
    let max_message_size = settings.effective_max_message_size(transport_limit);
    let as_batch = settings.is_batching();

    while let Some(batches) = rx.recv().await {
        let messages = match encoder.encode(&batches, max_message_size, as_batch) {
            Ok(messages) => messages,
            Err(e) => {
                stats.encode_failures.fetch_add(1, Ordering::Relaxed);
                let count: usize = batches.iter().map(|b| b.len()).sum();
                tracing::error!(
                    writer_group = %writer_group_id,
                    "Encoding failed, {} notifications dropped: {}",
                    count,
                    e
                );
                Vec::new()
            }
        };

        for message in messages {
            stats.pending.fetch_add(1, Ordering::Relaxed);
            if tx.send(message).await.is_err() {
                stats.pending.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        }
    }
}

async fn run_sink(mut rx: mpsc::Receiver<WireMessage>, sink: Arc<MessageSink>, stats: Arc<PipelineStats>) {
    while let Some(first) = rx.recv().await {
        let mut chunk = vec![first];
        while chunk.len() < SINK_CHUNK {
            match rx.try_recv() {
                Ok(message) => chunk.push(message),
                Err(_) => break,
            }
        }
        sink.send_batch(&chunk);
        stats.pending.fetch_sub(chunk.len(), Ordering::Relaxed);
    }
}

async fn expired(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
