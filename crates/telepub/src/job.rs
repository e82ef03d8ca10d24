// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Jobs and the worker/orchestrator protocol.
//!
//! A worker pulls a job with [`JobOrchestrator::get_available_job`] and then
//! heartbeats with the id and hash of what it runs. The orchestrator answers
//! with a [`HeartbeatInstruction`], decided by [`decide_heartbeat`].

use crate::diagnostics::WriterGroupDiagnostics;
use crate::model::WriterGroupConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;

/// Uppercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(bytes))
}

/// A complete writer group configuration assigned as one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobModel {
    /// Stable id derived from the connection identity.
    pub id: String,
    pub writer_group: WriterGroupConfig,
}

impl JobModel {
    pub fn new(id: impl Into<String>, writer_group: WriterGroupConfig) -> Self {
        Self {
            id: id.into(),
            writer_group,
        }
    }

    /// Content hash over the canonical JSON form.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        Ok(content_hash(&serde_json::to_vec(self)?))
    }
}

/// Lifecycle decision returned by a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatInstruction {
    Keep,
    Update,
    CancelProcessing,
}

/// Diagnostics reported by a worker for the job it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDiagnosticInfo {
    pub job_id: String,
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub writer_groups: Vec<WriterGroupDiagnostics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub job_hash: Option<String>,
    #[serde(default)]
    pub diagnostics: Option<JobDiagnosticInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub instruction: HeartbeatInstruction,
    #[serde(default)]
    pub job: Option<JobModel>,
    pub timestamp: DateTime<Utc>,
}

impl HeartbeatResponse {
    pub fn new(instruction: HeartbeatInstruction, job: Option<JobModel>) -> Self {
        Self {
            instruction,
            job,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub worker_id: String,
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Orchestrator unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Job distribution service seen by workers.
pub trait JobOrchestrator: Send + Sync {
    /// The worker's assigned job, or a newly assigned one, or none.
    fn get_available_job(&self, request: &JobRequest) -> Result<Option<JobModel>, OrchestratorError>;

    /// Report liveness and get the lifecycle decision.
    fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, OrchestratorError>;

    /// Generation bumped on every job set change, if the orchestrator has one.
    fn changes(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

/// Heartbeat decision for a worker whose assigned job is `assigned`.
///
/// - no current job on the worker: `Keep`
/// - same id and hash: `Keep`
/// - same id, other hash: `Update` with the assigned job
/// - other id: `CancelProcessing` with the assigned job
/// - nothing assigned: `CancelProcessing` without a job
pub fn decide_heartbeat(
    assigned: Option<&JobModel>,
    request: &HeartbeatRequest,
) -> Result<HeartbeatResponse, OrchestratorError> {
    let Some(job_id) = request.job_id.as_deref() else {
        return Ok(HeartbeatResponse::new(HeartbeatInstruction::Keep, None));
    };
    let Some(job) = assigned else {
        return Ok(HeartbeatResponse::new(HeartbeatInstruction::CancelProcessing, None));
    };

    if job.id != job_id {
        return Ok(HeartbeatResponse::new(
            HeartbeatInstruction::CancelProcessing,
            Some(job.clone()),
        ));
    }
    let hash = job
        .hash()
        .map_err(|e| OrchestratorError::Unavailable(e.to_string()))?;
    if request.job_hash.as_deref() == Some(hash.as_str()) {
        Ok(HeartbeatResponse::new(HeartbeatInstruction::Keep, None))
    } else {
        Ok(HeartbeatResponse::new(HeartbeatInstruction::Update, Some(job.clone())))
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Single-job orchestrator for tests.
pub struct MockJobOrchestrator {
    assigned: Mutex<Option<JobModel>>,
    heartbeats: Mutex<Vec<HeartbeatRequest>>,
    unavailable: Mutex<bool>,
    generation: watch::Sender<u64>,
}

impl Default for MockJobOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockJobOrchestrator {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            assigned: Mutex::new(None),
            heartbeats: Mutex::new(Vec::new()),
            unavailable: Mutex::new(false),
            generation,
        }
    }

    /// Replace the assigned job and notify watchers.
    pub fn assign(&self, job: Option<JobModel>) {
        *self.assigned.lock() = job;
        self.generation.send_modify(|g| *g += 1);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    /// Heartbeats received so far.
    pub fn heartbeats(&self) -> Vec<HeartbeatRequest> {
        self.heartbeats.lock().clone()
    }

    fn check(&self) -> Result<(), OrchestratorError> {
        if *self.unavailable.lock() {
            return Err(OrchestratorError::Unavailable("mock".into()));
        }
        Ok(())
    }
}

impl JobOrchestrator for MockJobOrchestrator {
    fn get_available_job(&self, _request: &JobRequest) -> Result<Option<JobModel>, OrchestratorError> {
        self.check()?;
        Ok(self.assigned.lock().clone())
    }

    fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, OrchestratorError> {
        self.check()?;
        self.heartbeats.lock().push(request.clone());
        decide_heartbeat(self.assigned.lock().as_ref(), request)
    }

    fn changes(&self) -> Option<watch::Receiver<u64>> {
        Some(self.generation.subscribe())
    }
}
