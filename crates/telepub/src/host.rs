// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Writer group host.
//!
//! [`WriterGroupHost::create`] builds the whole graph of one writer group
//! (encoder, sink, pipeline, subscription source) and returns a single handle
//! that is updated in place and disposed as a unit.

use crate::client::{SourceError, SubscriptionClient};
use crate::config::EngineConfig;
use crate::diagnostics::{MetricsContext, WriterGroupDiagnostics};
use crate::encoder::MessageEncoder;
use crate::message::NotificationBatch;
use crate::model::WriterGroupConfig;
use crate::pipeline::{DataFlowPipeline, PipelineError};
use crate::sink::{MessageSink, Transport};
use crate::source::{ListenerRegistration, SourceListener, WriterGroupSource};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Host errors.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Invalid writer group configuration: {0}")]
    InvalidConfig(String),
}

/// Collaborators shared by every host of a process.
#[derive(Clone)]
pub struct EngineContext {
    pub client: Arc<dyn SubscriptionClient>,
    pub transport: Arc<dyn Transport>,
    pub engine: EngineConfig,
    pub metrics: MetricsContext,
}

impl EngineContext {
    pub fn new(
        client: Arc<dyn SubscriptionClient>,
        transport: Arc<dyn Transport>,
        engine: EngineConfig,
    ) -> Self {
        let metrics = MetricsContext::new().with_tag("publisher", engine.publisher_id.clone());
        Self {
            client,
            transport,
            engine,
            metrics,
        }
    }
}

/// Forwards source batches into whichever pipeline is current.
struct PipelineListener {
    pipeline: Arc<ArcSwap<DataFlowPipeline>>,
}

impl SourceListener for PipelineListener {
    fn on_message(&self, batch: NotificationBatch) {
        self.pipeline.load().submit(batch);
    }

    fn on_counter_reset(&self) {
        self.pipeline.load().reset_diagnostics();
    }
}

struct HostShared {
    config: ArcSwap<WriterGroupConfig>,
    source: WriterGroupSource,
    pipeline: Arc<ArcSwap<DataFlowPipeline>>,
    metrics: MetricsContext,
}

impl HostShared {
    fn diagnostics(&self) -> WriterGroupDiagnostics {
        let pipeline = self.pipeline.load();
        WriterGroupDiagnostics::collect(
            &self.config.load().writer_group_id,
            &self.source.counters(),
            &pipeline.stats(),
            &pipeline.encoder().stats(),
            &pipeline.sink().stats(),
        )
    }
}

/// One running writer group.
pub struct WriterGroupHost {
    job_id: String,
    shared: Arc<HostShared>,
    context: EngineContext,
    registration: Mutex<Option<ListenerRegistration>>,
    cancel: CancellationToken,
}

impl WriterGroupHost {
    /// Build and start the writer group graph.
    pub async fn create(
        job_id: impl Into<String>,
        config: WriterGroupConfig,
        context: &EngineContext,
    ) -> Result<Self, HostError> {
        let job_id = job_id.into();
        validate(&config)?;

        let config = Arc::new(config);
        let pipeline = build_pipeline(&config, context);
        pipeline.start()?;
        let pipeline = Arc::new(ArcSwap::from_pointee(pipeline));

        let source = WriterGroupSource::new(config.clone(), context.client.clone());
        let registration = source.subscribe(Arc::new(PipelineListener {
            pipeline: pipeline.clone(),
        }));
        if let Err(e) = source.open() {
            drop(registration);
            pipeline.load_full().stop().await;
            return Err(e.into());
        }

        let metrics = context
            .metrics
            .child("job", job_id.clone())
            .with_tag("writer_group", config.writer_group_id.clone());
        let shared = Arc::new(HostShared {
            config: ArcSwap::new(config.clone()),
            source,
            pipeline,
            metrics,
        });

        let cancel = CancellationToken::new();
        if let Some(interval) = context.engine.diagnostics_interval() {
            let shared = shared.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    shared.diagnostics().log(&shared.metrics);
                }
            });
        }

        tracing::info!(
            job = %job_id,
            writer_group = %config.writer_group_id,
            writers = config.writers.len(),
            items = config.item_count(),
            "Writer group host created"
        );
        Ok(Self {
            job_id,
            shared,
            context: context.clone(),
            registration: Mutex::new(Some(registration)),
            cancel,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<WriterGroupConfig> {
        self.shared.config.load_full()
    }

    /// Apply a new configuration. Returns `Ok(false)` when nothing changed.
    ///
    /// The pipeline is rebuilt only when encoding or batching changed; the
    /// source is updated writer by writer.
    pub async fn update(&self, config: WriterGroupConfig) -> Result<bool, HostError> {
        let current = self.shared.config.load_full();
        if *current == config {
            return Ok(false);
        }
        validate(&config)?;
        let config = Arc::new(config);

        if current.pipeline_differs(&config) {
            let pipeline = build_pipeline(&config, &self.context);
            pipeline.start()?;
            let previous = self.shared.pipeline.swap(Arc::new(pipeline));
            previous.stop().await;
            tracing::info!(job = %self.job_id, "Pipeline rebuilt");
        }

        // Stored only once every writer is running, so that a failed update
        // is retried when the same configuration is applied again.
        self.shared.source.update(config.clone())?;
        self.shared.config.store(config);
        tracing::info!(job = %self.job_id, "Writer group host updated");
        Ok(true)
    }

    /// Current diagnostics.
    pub fn diagnostics(&self) -> WriterGroupDiagnostics {
        self.shared.diagnostics()
    }

    /// Close the source and drain the pipeline.
    pub async fn dispose(self) {
        self.cancel.cancel();
        self.registration.lock().take();
        self.shared.source.close();
        self.shared.pipeline.load_full().stop().await;
        tracing::info!(job = %self.job_id, "Writer group host disposed");
    }
}

impl Drop for WriterGroupHost {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn build_pipeline(config: &WriterGroupConfig, context: &EngineContext) -> DataFlowPipeline {
    let publisher_id = if config.publisher_id.is_empty() {
        context.engine.publisher_id.clone()
    } else {
        config.publisher_id.clone()
    };
    let encoder = Arc::new(MessageEncoder::new(
        config.messaging_mode,
        config.encoding,
        publisher_id,
    ));
    let sink = Arc::new(MessageSink::new(context.transport.clone()));
    DataFlowPipeline::new(config.writer_group_id.clone(), config.batching, encoder, sink)
}

fn validate(config: &WriterGroupConfig) -> Result<(), HostError> {
    if config.batching.batch_size == 0 {
        return Err(HostError::InvalidConfig("batch size must be at least 1".into()));
    }
    if config.batching.max_outgress_messages == 0 {
        return Err(HostError::InvalidConfig(
            "max outgress messages must be at least 1".into(),
        ));
    }
    let mut seen = HashSet::new();
    for writer in &config.writers {
        if !seen.insert(writer.writer_id.as_str()) {
            return Err(HostError::InvalidConfig(format!(
                "duplicate writer {}",
                writer.writer_id
            )));
        }
    }
    Ok(())
}
