// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker supervisor.
//!
//! Pulls a job from a [`JobOrchestrator`], runs it through the
//! [`WriterGroupController`] and heartbeats until cancelled.

use crate::controller::WriterGroupController;
use crate::job::{
    HeartbeatInstruction, HeartbeatRequest, JobDiagnosticInfo, JobModel, JobOrchestrator,
    JobRequest, OrchestratorError,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Delay between heartbeats (and between pulls while idle).
    pub heartbeat_interval: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

struct RunningJob {
    job: JobModel,
    /// `None` until the job was applied without failures.
    hash: Option<String>,
}

/// Worker loop: pull, run, heartbeat.
pub struct Worker {
    config: WorkerConfig,
    orchestrator: Arc<dyn JobOrchestrator>,
    controller: Arc<WriterGroupController>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        orchestrator: Arc<dyn JobOrchestrator>,
        controller: Arc<WriterGroupController>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            orchestrator,
            controller,
            cancel,
        }
    }

    /// Run until the cancellation token fires. The running job is torn
    /// down before returning.
    pub async fn run(self) {
        let mut current: Option<RunningJob> = None;
        let mut changes = self.orchestrator.changes();
        tracing::info!(worker = %self.config.worker_id, "Worker started");

        loop {
            let outcome = match &current {
                None => self.pull(&mut current).await,
                Some(running) => {
                    let request = self.heartbeat_request(running).await;
                    self.heartbeat(request, &mut current).await
                }
            };
            match outcome {
                Err(OrchestratorError::Cancelled) => break,
                Err(e) => tracing::warn!(worker = %self.config.worker_id, "Orchestrator call failed: {}", e),
                Ok(()) => {}
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = wait_for_change(&mut changes) => {}
            }
        }

        if current.is_some() {
            if let Err(e) = self.controller.apply(Vec::new()).await {
                tracing::warn!(worker = %self.config.worker_id, "Failed to stop job: {}", e);
            }
        }
        tracing::info!(worker = %self.config.worker_id, "Worker stopped");
    }

    async fn pull(&self, current: &mut Option<RunningJob>) -> Result<(), OrchestratorError> {
        let request = JobRequest {
            worker_id: self.config.worker_id.clone(),
        };
        if let Some(job) = self.call(move |o| o.get_available_job(&request)).await? {
            self.activate(job, current).await?;
        }
        Ok(())
    }

    async fn heartbeat(
        &self,
        request: HeartbeatRequest,
        current: &mut Option<RunningJob>,
    ) -> Result<(), OrchestratorError> {
        let response = self.call(move |o| o.heartbeat(&request)).await?;
        match (response.instruction, response.job) {
            (HeartbeatInstruction::Keep, _) => {}
            (HeartbeatInstruction::Update, Some(job)) => {
                tracing::info!(worker = %self.config.worker_id, job = %job.id, "Job updated");
                self.activate(job, current).await?;
            }
            (HeartbeatInstruction::Update, None) => {
                tracing::warn!(worker = %self.config.worker_id, "Update without job ignored");
            }
            (HeartbeatInstruction::CancelProcessing, next) => {
                tracing::info!(worker = %self.config.worker_id, "Job processing cancelled");
                if let Err(e) = self.controller.apply(Vec::new()).await {
                    tracing::warn!(worker = %self.config.worker_id, "Failed to stop job: {}", e);
                }
                *current = None;
                if let Some(job) = next {
                    self.activate(job, current).await?;
                }
            }
        }
        Ok(())
    }

    async fn activate(&self, job: JobModel, current: &mut Option<RunningJob>) -> Result<(), OrchestratorError> {
        let hash = job
            .hash()
            .map_err(|e| OrchestratorError::InvalidRequest(e.to_string()))?;
        let hash = match self.controller.apply(vec![job.clone()]).await {
            Ok(version) => {
                tracing::info!(worker = %self.config.worker_id, job = %job.id, version, "Job running");
                Some(hash)
            }
            // Partially running; without a hash the next heartbeat answers
            // with an update and the failed writers are retried.
            Err(e) => {
                tracing::error!(worker = %self.config.worker_id, job = %job.id, "Job failed to start: {}", e);
                None
            }
        };
        *current = Some(RunningJob { job, hash });
        Ok(())
    }

    async fn heartbeat_request(&self, running: &RunningJob) -> HeartbeatRequest {
        let writer_groups = self.controller.diagnostics().await.unwrap_or_default();
        HeartbeatRequest {
            worker_id: self.config.worker_id.clone(),
            job_id: Some(running.job.id.clone()),
            job_hash: running.hash.clone(),
            diagnostics: Some(JobDiagnosticInfo {
                job_id: running.job.id.clone(),
                worker_id: self.config.worker_id.clone(),
                timestamp: Utc::now(),
                writer_groups,
            }),
        }
    }

    /// Run a blocking orchestrator call, failing fast on cancellation.
    async fn call<T, F>(&self, f: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&dyn JobOrchestrator) -> Result<T, OrchestratorError> + Send + 'static,
        T: Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let orchestrator = self.orchestrator.clone();
        let task = tokio::task::spawn_blocking(move || f(orchestrator.as_ref()));
        tokio::select! {
            _ = self.cancel.cancelled() => Err(OrchestratorError::Cancelled),
            result = task => result.map_err(|e| OrchestratorError::Unavailable(e.to_string()))?,
        }
    }
}

async fn wait_for_change(changes: &mut Option<watch::Receiver<u64>>) {
    match changes {
        Some(rx) => {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockSubscriptionClient;
    use crate::config::EngineConfig;
    use crate::host::EngineContext;
    use crate::job::MockJobOrchestrator;
    use crate::model::{ConnectionModel, DataSetWriterConfig, PublishedItem, WriterGroupConfig};
    use crate::sink::MockTransport;

    fn job(id: &str, writer: &str) -> JobModel {
        let group = WriterGroupConfig::new(id, "pub").writer(DataSetWriterConfig::new(
            writer,
            1,
            ConnectionModel::new("opc.tcp://plc:4840"),
            vec![PublishedItem::new("ns=2;s=A")],
        ));
        JobModel::new(id, group)
    }

    struct Fixture {
        client: Arc<MockSubscriptionClient>,
        orchestrator: Arc<MockJobOrchestrator>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn_worker() -> Fixture {
        let client = Arc::new(MockSubscriptionClient::new());
        let mut engine = EngineConfig::default();
        engine.diagnostics_interval_secs = 0;
        let ctx = EngineContext::new(client.clone(), Arc::new(MockTransport::new()), engine);
        let controller = Arc::new(WriterGroupController::start(ctx));
        let orchestrator = Arc::new(MockJobOrchestrator::new());
        let cancel = CancellationToken::new();
        let worker = Worker::new(
            WorkerConfig::new("worker-1").heartbeat_interval(Duration::from_millis(20)),
            orchestrator.clone(),
            controller,
            cancel.clone(),
        );
        let handle = tokio::spawn(worker.run());
        Fixture {
            client,
            orchestrator,
            cancel,
            handle,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_pulls_and_runs_job() {
        let f = spawn_worker();
        f.orchestrator.assign(Some(job("J1", "a")));
        settle().await;
        assert_eq!(f.client.open_writers(), vec!["a".to_string()]);

        let heartbeats = f.orchestrator.heartbeats();
        assert!(!heartbeats.is_empty());
        assert_eq!(heartbeats[0].job_id.as_deref(), Some("J1"));
        assert!(heartbeats[0].diagnostics.is_some());

        f.cancel.cancel();
        f.handle.await.unwrap();
        assert!(f.client.open_writers().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_applies_update_and_cancel() {
        let f = spawn_worker();
        f.orchestrator.assign(Some(job("J1", "a")));
        settle().await;

        f.orchestrator.assign(Some(job("J1", "b")));
        settle().await;
        assert_eq!(f.client.open_writers(), vec!["b".to_string()]);

        f.orchestrator.assign(None);
        settle().await;
        assert!(f.client.open_writers().is_empty());

        f.cancel.cancel();
        f.handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_retries_job_that_failed_to_start() {
        let f = spawn_worker();
        f.client.set_fail_create(true);
        f.orchestrator.assign(Some(job("J1", "a")));
        settle().await;
        assert!(f.client.open_writers().is_empty());
        assert!(f.orchestrator.heartbeats().iter().any(|h| h.job_hash.is_none()));

        f.client.set_fail_create(false);
        settle().await;
        assert_eq!(f.client.open_writers(), vec!["a".to_string()]);

        f.cancel.cancel();
        f.handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_survives_unavailable_orchestrator() {
        let f = spawn_worker();
        f.orchestrator.set_unavailable(true);
        f.orchestrator.assign(Some(job("J1", "a")));
        settle().await;
        assert!(f.client.open_writers().is_empty());

        f.orchestrator.set_unavailable(false);
        settle().await;
        assert_eq!(f.client.open_writers(), vec!["a".to_string()]);

        f.cancel.cancel();
        f.handle.await.unwrap();
    }
}
