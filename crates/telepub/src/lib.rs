// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! telepub: industrial telemetry publishing engine
//!
//! Subscribes to data source change notifications, batches and encodes them
//! into wire messages and forwards them to an upstream transport.
//!
//! # Architecture
//!
//! ```text
//!  JobOrchestrator <--pull/heartbeat-- Worker
//!                                        |
//!                              WriterGroupController (change feed)
//!                                        |
//!                              WriterGroupHost (one per job)
//!                         +--------------+---------------+
//!                 WriterGroupSource            DataFlowPipeline
//!                 (subscriptions,        batcher -> encoder -> sink
//!                  key frames, metadata)                      |
//!                                                         Transport
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use telepub::{
//!     EngineConfig, EngineContext, JobModel, LogTransport, SimulatedSubscriptionClient,
//!     WriterGroupConfig, WriterGroupController,
//! };
//!
//! # async fn run(group: WriterGroupConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = EngineContext::new(
//!     Arc::new(SimulatedSubscriptionClient::new()),
//!     Arc::new(LogTransport),
//!     EngineConfig::default(),
//! );
//! let controller = WriterGroupController::start(ctx);
//! controller.apply(vec![JobModel::new("job-1", group)]).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod encoder;
pub mod host;
pub mod job;
pub mod message;
pub mod model;
pub mod pipeline;
pub mod rate;
pub mod sink;
pub mod source;
pub mod worker;

pub use client::{
    DataChange, MockSubscription, MockSubscriptionClient, SimulatedSubscriptionClient,
    SourceError, Subscription, SubscriptionCallback, SubscriptionClient,
};
pub use config::{BatchSettings, ConfigError, EngineConfig, MessageEncoding, MessagingMode};
pub use controller::{ControllerError, JobFailure, WriterGroupController};
pub use diagnostics::{MetricsContext, WriterGroupDiagnostics};
pub use encoder::{content_mask, EncodeError, EncoderStats, MessageEncoder};
pub use host::{EngineContext, HostError, WriterGroupHost};
pub use job::{
    content_hash, decide_heartbeat, HeartbeatInstruction, HeartbeatRequest, HeartbeatResponse,
    JobDiagnosticInfo, JobModel, JobOrchestrator, JobRequest, MockJobOrchestrator,
    OrchestratorError,
};
pub use message::{
    DataSetMetaData, DataValue, FieldMetaData, MessageType, MetaDataVersion, Notification,
    NotificationBatch, SequenceNumber, WireMessage,
};
pub use model::{AuthMode, ConnectionModel, DataSetWriterConfig, PublishedItem, WriterGroupConfig};
pub use pipeline::{DataFlowPipeline, PipelineError, PipelineStatsSnapshot};
pub use rate::RateCounter;
pub use sink::{
    FileTransport, LogTransport, MessageSink, MockTransport, SinkStatsSnapshot, Transport,
    TransportError,
};
pub use source::{ListenerRegistration, SourceCountersSnapshot, SourceListener, WriterGroupSource};
pub use worker::{Worker, WorkerConfig};
