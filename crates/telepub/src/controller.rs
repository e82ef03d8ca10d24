// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Writer group change feed.
//!
//! All job set changes go through one queue with a single consumer task that
//! owns the host table. Callers enqueue the desired job list and await the
//! outcome. The published writer group list only changes when every job of
//! a request was applied.

use crate::diagnostics::WriterGroupDiagnostics;
use crate::host::{EngineContext, HostError, WriterGroupHost};
use crate::job::JobModel;
use crate::model::WriterGroupConfig;
use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const COMMAND_QUEUE: usize = 64;

/// One failed job of an apply request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub job_id: String,
    pub message: String,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.job_id, self.message)
    }
}

/// Controller errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{} job(s) failed: {}", .0.len(), join_failures(.0))]
    Aggregate(Vec<JobFailure>),

    #[error("Controller stopped")]
    Stopped,
}

fn join_failures(failures: &[JobFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

enum Command {
    Apply {
        jobs: Vec<JobModel>,
        reply: oneshot::Sender<Result<u64, ControllerError>>,
    },
    Diagnostics {
        reply: oneshot::Sender<Vec<WriterGroupDiagnostics>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the change feed consumer.
pub struct WriterGroupController {
    tx: mpsc::Sender<Command>,
    groups: Arc<ArcSwap<Vec<Arc<WriterGroupConfig>>>>,
    version: Arc<AtomicU64>,
}

impl WriterGroupController {
    /// Spawn the consumer task on the current runtime.
    pub fn start(context: EngineContext) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let groups = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let version = Arc::new(AtomicU64::new(0));

        let consumer = Consumer {
            context,
            hosts: HashMap::new(),
            groups: groups.clone(),
            version: version.clone(),
        };
        tokio::spawn(consumer.run(rx));

        Self { tx, groups, version }
    }

    /// Make `jobs` the running job set. Resolves to the new version.
    pub async fn apply(&self, jobs: Vec<JobModel>) -> Result<u64, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Apply { jobs, reply })
            .await
            .map_err(|_| ControllerError::Stopped)?;
        rx.await.map_err(|_| ControllerError::Stopped)?
    }

    /// Diagnostics of every running writer group.
    pub async fn diagnostics(&self) -> Result<Vec<WriterGroupDiagnostics>, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Diagnostics { reply })
            .await
            .map_err(|_| ControllerError::Stopped)?;
        rx.await.map_err(|_| ControllerError::Stopped)
    }

    /// Dispose every host and stop the consumer.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Writer groups of the last fully applied job set.
    pub fn writer_groups(&self) -> Arc<Vec<Arc<WriterGroupConfig>>> {
        self.groups.load_full()
    }

    /// Number of apply requests processed.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

struct Consumer {
    context: EngineContext,
    hosts: HashMap<String, WriterGroupHost>,
    groups: Arc<ArcSwap<Vec<Arc<WriterGroupConfig>>>>,
    version: Arc<AtomicU64>,
}

impl Consumer {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Apply { jobs, reply } => {
                    let result = self.apply(jobs).await;
                    let _ = reply.send(result);
                }
                Command::Diagnostics { reply } => {
                    let diagnostics = self.hosts.values().map(|h| h.diagnostics()).collect();
                    let _ = reply.send(diagnostics);
                }
                Command::Shutdown { reply } => {
                    self.dispose_all().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
        self.dispose_all().await;
    }

    async fn apply(&mut self, jobs: Vec<JobModel>) -> Result<u64, ControllerError> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let desired: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();

        let removed: Vec<String> = self
            .hosts
            .keys()
            .filter(|id| !desired.contains(id.as_str()))
            .cloned()
            .collect();
        for id in removed {
            if let Some(host) = self.hosts.remove(&id) {
                host.dispose().await;
            }
        }

        let mut failures = Vec::new();
        for job in &jobs {
            let result = match self.hosts.get(&job.id) {
                Some(host) => host.update(job.writer_group.clone()).await.map(|_| ()),
                None => {
                    match WriterGroupHost::create(job.id.clone(), job.writer_group.clone(), &self.context)
                        .await
                    {
                        Ok(host) => {
                            self.hosts.insert(job.id.clone(), host);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
            };
            if let Err(e) = result {
                failures.push(failure(&job.id, &e));
            }
        }

        if !failures.is_empty() {
            tracing::error!(
                version,
                failed = failures.len(),
                "Writer group change partially applied"
            );
            return Err(ControllerError::Aggregate(failures));
        }

        let groups: Vec<Arc<WriterGroupConfig>> = jobs
            .iter()
            .filter_map(|j| self.hosts.get(&j.id).map(|h| h.config()))
            .collect();
        self.groups.store(Arc::new(groups));
        tracing::info!(version, jobs = jobs.len(), "Writer group change applied");
        Ok(version)
    }

    async fn dispose_all(&mut self) {
        for (_, host) in self.hosts.drain() {
            host.dispose().await;
        }
        self.groups.store(Arc::new(Vec::new()));
    }
}

fn failure(job_id: &str, error: &HostError) -> JobFailure {
    tracing::warn!(job = %job_id, "Failed to apply job: {}", error);
    JobFailure {
        job_id: job_id.to_string(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockSubscriptionClient;
    use crate::config::{BatchSettings, EngineConfig};
    use crate::model::{ConnectionModel, DataSetWriterConfig, PublishedItem};
    use crate::sink::MockTransport;

    fn context() -> (EngineContext, Arc<MockSubscriptionClient>) {
        let client = Arc::new(MockSubscriptionClient::new());
        let mut engine = EngineConfig::default();
        engine.diagnostics_interval_secs = 0;
        (
            EngineContext::new(client.clone(), Arc::new(MockTransport::new()), engine),
            client,
        )
    }

    fn job(id: &str, writer: &str) -> JobModel {
        let group = WriterGroupConfig::new(id, "pub").writer(DataSetWriterConfig::new(
            writer,
            1,
            ConnectionModel::new(format!("opc.tcp://{}:4840", id)),
            vec![PublishedItem::new("ns=2;s=A")],
        ));
        JobModel::new(id, group)
    }

    #[tokio::test]
    async fn test_apply_creates_updates_and_removes() {
        let (ctx, client) = context();
        let controller = WriterGroupController::start(ctx);

        let v1 = controller.apply(vec![job("J1", "a"), job("J2", "b")]).await.unwrap();
        assert_eq!(v1, 1);
        assert_eq!(controller.writer_groups().len(), 2);
        assert_eq!(client.created_count(), 2);

        let v2 = controller.apply(vec![job("J1", "a")]).await.unwrap();
        assert_eq!(v2, 2);
        assert_eq!(controller.writer_groups().len(), 1);
        assert_eq!(client.open_writers(), vec!["a".to_string()]);
        // unchanged job: no new subscription
        assert_eq!(client.created_count(), 2);

        controller.shutdown().await;
        assert!(client.open_writers().is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_published_list() {
        let (ctx, client) = context();
        let controller = WriterGroupController::start(ctx);
        controller.apply(vec![job("J1", "a")]).await.unwrap();

        let mut broken = job("J2", "b");
        broken.writer_group.batching = BatchSettings::default().with_batch_size(0);
        let result = controller.apply(vec![job("J1", "a"), broken]).await;

        match result {
            Err(ControllerError::Aggregate(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].job_id, "J2");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(controller.writer_groups().len(), 1);
        assert_eq!(controller.version(), 2);
        assert_eq!(client.open_writers(), vec!["a".to_string()]);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_diagnostics_per_host() {
        let (ctx, _client) = context();
        let controller = WriterGroupController::start(ctx);
        controller.apply(vec![job("J1", "a"), job("J2", "b")]).await.unwrap();
        assert_eq!(controller.diagnostics().await.unwrap().len(), 2);
        controller.shutdown().await;
        assert!(matches!(
            controller.diagnostics().await,
            Err(ControllerError::Stopped)
        ));
    }
}
