// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! telepub-orchestrator: published nodes configuration and job distribution
//!
//! Turns a JSON published nodes file into jobs for [`telepub::Worker`]s and
//! keeps both in sync:
//!
//! ```text
//!  publishednodes.json <--persist-- configuration API (methods)
//!          |
//!   PublishedNodesWatcher (mtime poll)
//!          |
//!   PublishedNodesReconciler --JobConverter--> jobs
//!          |                                     |
//!          +---- JobOrchestrator (pull / heartbeat) --> Worker
//! ```

pub mod config;
pub mod converter;
pub mod entry;
pub mod error;
pub mod methods;
pub mod reconciler;
pub mod schema;
pub mod watcher;

pub use config::{ConfigError, OrchestratorConfig, TransportConfig};
pub use converter::JobConverter;
pub use entry::{parse_entries, LegacyNodeId, OpcNode, PublishedNodesEntry};
pub use error::{ApiError, ReconcileError, SchemaError};
pub use methods::{invoke, Method};
pub use reconciler::{PublishedNodesReconciler, ReloadOutcome};
pub use schema::{SchemaValidator, PUBLISHED_NODES_SCHEMA};
pub use watcher::PublishedNodesWatcher;
