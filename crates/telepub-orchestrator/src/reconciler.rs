// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Published nodes reconciler.
//!
//! Owns the published nodes entries loaded from the configuration file and
//! the job sets derived from them:
//!
//! ```text
//!  file change --> refresh_from_file --+
//!                                      |   config lock (entries, hash)
//!  publish / unpublish / add_or_update-+-> JobConverter
//!                                      |   jobs lock (assigned, available, diagnostics)
//!  workers <-- get_available_job / heartbeat
//! ```
//!
//! The config lock is always taken before the jobs lock.

use crate::config::OrchestratorConfig;
use crate::converter::JobConverter;
use crate::entry::{parse_entries, OpcNode, PublishedNodesEntry};
use crate::error::{ApiError, ReconcileError, SchemaError};
use crate::schema::SchemaValidator;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use telepub::{
    content_hash, decide_heartbeat, HeartbeatRequest, HeartbeatResponse, JobDiagnosticInfo,
    JobModel, JobOrchestrator, JobRequest, OrchestratorError,
};
use tokio::sync::watch;

/// Attempts made to read the file before giving up on a reload.
pub const READ_ATTEMPTS: u32 = 3;

const NULL_OR_EMPTY_NODES: &str = "null or empty OpcNodes is provided in request";

/// Result of one [`PublishedNodesReconciler::refresh_from_file`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Content hash equals the last loaded one.
    Unchanged,
    /// New content loaded into `jobs` jobs.
    Reloaded { jobs: usize },
    /// Empty content or deleted file; everything cleared.
    Cleared,
    /// Malformed content; last good configuration kept.
    Aborted,
    /// Reading failed on every attempt; last good configuration kept.
    Failed,
    /// Unexpected failure; configuration reset to empty.
    Reset,
}

#[derive(Default)]
struct ConfigState {
    entries: Vec<PublishedNodesEntry>,
    last_hash: Option<String>,
}

#[derive(Default)]
struct JobState {
    /// worker id -> job
    assigned: HashMap<String, JobModel>,
    /// job id -> job
    available: BTreeMap<String, JobModel>,
    /// job id -> last reported diagnostics
    diagnostics: HashMap<String, JobDiagnosticInfo>,
}

impl JobState {
    fn clear(&mut self) {
        self.assigned.clear();
        self.available.clear();
        self.diagnostics.clear();
    }

    fn owner(&self, job_id: &str) -> Option<String> {
        self.assigned
            .iter()
            .find(|(_, job)| job.id == job_id)
            .map(|(worker, _)| worker.clone())
    }

    /// Replace an assigned job in place or put it into the pool.
    fn upsert(&mut self, job: JobModel) {
        match self.owner(&job.id) {
            Some(worker) => {
                self.assigned.insert(worker, job);
            }
            None => {
                self.available.insert(job.id.clone(), job);
            }
        }
    }

    /// Replace a job only if it is already known.
    fn replace_existing(&mut self, job: JobModel) -> bool {
        if let Some(worker) = self.owner(&job.id) {
            self.assigned.insert(worker, job);
            return true;
        }
        if let Some(slot) = self.available.get_mut(&job.id) {
            *slot = job;
            return true;
        }
        false
    }

    fn remove(&mut self, job_id: &str) -> bool {
        if let Some(worker) = self.owner(job_id) {
            self.assigned.remove(&worker);
            self.diagnostics.remove(job_id);
            return true;
        }
        self.available.remove(job_id).is_some()
    }
}

/// Logs method entry and, on drop, the elapsed time.
struct MethodTimer {
    method: &'static str,
    started: Instant,
}

impl MethodTimer {
    fn start(method: &'static str) -> Self {
        tracing::info!("{} method triggered", method);
        Self {
            method,
            started: Instant::now(),
        }
    }
}

impl Drop for MethodTimer {
    fn drop(&mut self) {
        tracing::info!("{} method finished in {:?}", self.method, self.started.elapsed());
    }
}

/// Reconciles the published nodes file with the job sets served to workers.
pub struct PublishedNodesReconciler {
    path: PathBuf,
    schema_path: Option<PathBuf>,
    retry_delay: Duration,
    converter: JobConverter,
    config: Mutex<ConfigState>,
    jobs: Mutex<JobState>,
    generation: watch::Sender<u64>,
}

impl PublishedNodesReconciler {
    /// Reconciler for the file at `path`. Nothing is loaded until
    /// [`refresh_from_file`](Self::refresh_from_file) is called.
    pub fn new(path: impl Into<PathBuf>, converter: JobConverter) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            path: path.into(),
            schema_path: None,
            retry_delay: Duration::from_millis(500),
            converter,
            config: Mutex::new(ConfigState::default()),
            jobs: Mutex::new(JobState::default()),
            generation,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let mut reconciler = Self::new(
            config.published_nodes_path.clone(),
            JobConverter::new(config.engine.clone()),
        )
        .retry_delay(config.retry_delay());
        reconciler.schema_path = config.schema_path.clone();
        reconciler
    }

    /// Validate the file against the schema at `path` when it exists.
    pub fn schema(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema_path = Some(path.into());
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current entries.
    pub fn entries(&self) -> Vec<PublishedNodesEntry> {
        self.config.lock().entries.clone()
    }

    /// Jobs assigned to workers, keyed by worker id.
    pub fn assigned_jobs(&self) -> HashMap<String, JobModel> {
        self.jobs.lock().assigned.clone()
    }

    /// Jobs waiting for a worker.
    pub fn available_jobs(&self) -> Vec<JobModel> {
        self.jobs.lock().available.values().cloned().collect()
    }

    /// Total number of jobs.
    pub fn job_count(&self) -> usize {
        let state = self.jobs.lock();
        state.assigned.len() + state.available.len()
    }

    /// Generation counter, bumped after every job set change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn notify(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    // ------------------------------------------------------------------
    // File reload
    // ------------------------------------------------------------------

    /// Reload the file if its content changed.
    ///
    /// Blocks for up to `READ_ATTEMPTS - 1` retry delays when the file
    /// cannot be read.
    pub fn refresh_from_file(&self) -> ReloadOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let mut config = self.config.lock();
                self.try_refresh(&mut config)
            };
            match result {
                Ok(outcome) => return outcome,
                Err(e) if e.is_transient() => {
                    if attempt < READ_ATTEMPTS {
                        tracing::warn!(
                            file = %self.path.display(),
                            attempt,
                            "Error while loading published nodes: {}. Retrying...",
                            e
                        );
                        std::thread::sleep(self.retry_delay);
                    } else {
                        tracing::error!(
                            file = %self.path.display(),
                            "Error while loading published nodes: {}. Retry expired, giving up.",
                            e
                        );
                        return ReloadOutcome::Failed;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        file = %self.path.display(),
                        "Error while reloading published nodes: {}. Resetting the configuration.",
                        e
                    );
                    self.clear_all();
                    return ReloadOutcome::Reset;
                }
            }
        }
    }

    /// The file disappeared: drop every entry and job.
    pub fn on_file_deleted(&self) {
        tracing::info!(file = %self.path.display(), "Published nodes file deleted, clearing configuration");
        self.clear_all();
    }

    fn clear_all(&self) {
        let mut config = self.config.lock();
        config.entries.clear();
        config.last_hash = None;
        self.jobs.lock().clear();
        self.notify();
    }

    fn try_refresh(&self, config: &mut ConfigState) -> Result<ReloadOutcome, ReconcileError> {
        let content = std::fs::read_to_string(&self.path)?;
        let hash = (!content.trim().is_empty()).then(|| content_hash(content.as_bytes()));
        if hash == config.last_hash {
            tracing::debug!(file = %self.path.display(), "Content hash unchanged, nothing to do");
            return Ok(ReloadOutcome::Unchanged);
        }
        tracing::info!(
            file = %self.path.display(),
            last_hash = config.last_hash.as_deref().unwrap_or(""),
            new_hash = hash.as_deref().unwrap_or(""),
            "Published nodes file changed, reloading"
        );

        let Some(hash) = hash else {
            config.entries.clear();
            config.last_hash = None;
            self.jobs.lock().clear();
            self.notify();
            return Ok(ReloadOutcome::Cleared);
        };

        let mut entries = match self.load_entries(&content) {
            Ok(entries) => entries,
            Err(e) if e.is_malformed() => {
                tracing::warn!(
                    file = %self.path.display(),
                    "Failed to parse published nodes: {}, aborting reload",
                    e
                );
                return Ok(ReloadOutcome::Aborted);
            }
            Err(e) => return Err(e),
        };
        entries.retain(PublishedNodesEntry::has_nodes);

        let jobs = self.converter.convert(&entries)?;
        let count = jobs.len();
        config.entries = entries;
        config.last_hash = Some(hash);
        self.replace_jobs(jobs);
        self.notify();
        Ok(ReloadOutcome::Reloaded { jobs: count })
    }

    fn load_entries(&self, content: &str) -> Result<Vec<PublishedNodesEntry>, ReconcileError> {
        if let Some(validator) = self.schema_validator()? {
            validator.validate_str(content)?;
        }
        parse_entries(content)
    }

    fn schema_validator(&self) -> Result<Option<SchemaValidator>, ReconcileError> {
        let Some(path) = &self.schema_path else {
            return Ok(None);
        };
        if !path.exists() {
            tracing::info!(
                schema = %path.display(),
                "Validation schema file does not exist, skipping validation"
            );
            return Ok(None);
        }
        match SchemaValidator::from_file(path) {
            Ok(validator) => Ok(Some(validator)),
            Err(SchemaError::Io(e)) => {
                tracing::warn!(
                    schema = %path.display(),
                    "Failed to read schema file: {}. Loading without validation.",
                    e
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Swap in a freshly converted job set, keeping worker assignments of
    /// jobs that survive.
    fn replace_jobs(&self, jobs: Vec<JobModel>) {
        let mut state = self.jobs.lock();
        let owners: HashMap<String, String> = state
            .assigned
            .iter()
            .map(|(worker, job)| (job.id.clone(), worker.clone()))
            .collect();

        let mut assigned = HashMap::new();
        let mut available = BTreeMap::new();
        let mut diagnostics = HashMap::new();
        for job in jobs {
            tracing::info!(
                job = %job.id,
                writer_group = %job.writer_group.writer_group_id,
                writers = job.writer_group.writers.len(),
                "Job loaded"
            );
            match owners.get(&job.id) {
                Some(worker) => {
                    if let Some(info) = state.diagnostics.remove(&job.id) {
                        diagnostics.insert(job.id.clone(), info);
                    }
                    assigned.insert(worker.clone(), job);
                }
                None => {
                    available.insert(job.id.clone(), job);
                }
            }
        }
        state.assigned = assigned;
        state.available = available;
        state.diagnostics = diagnostics;
    }

    /// Write `entries` to the file, then make them current and remember the
    /// new hash. On failure the current entries are left as they were.
    fn persist(&self, config: &mut ConfigState, entries: Vec<PublishedNodesEntry>) -> Result<(), ApiError> {
        let content = serde_json::to_string_pretty(&entries)
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        std::fs::write(&self.path, &content).map_err(|e| ApiError::bad_request(e.to_string()))?;
        config.entries = entries;
        config.last_hash = Some(content_hash(content.as_bytes()));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Configuration API
    // ------------------------------------------------------------------

    /// Add nodes to the matching data set, or add the entry as a new data set.
    pub fn publish_nodes(&self, request: PublishedNodesEntry) -> Result<(), ApiError> {
        let _timer = MethodTimer::start("PublishNodes");
        if !request.has_nodes() {
            return Err(ApiError::bad_request(NULL_OR_EMPTY_NODES));
        }

        let mut config = self.config.lock();
        let mut entries = config.entries.clone();
        let now = Utc::now();
        let mut data_set_found = false;
        let mut groups = Vec::new();
        for entry in entries.iter_mut() {
            if !entry.has_same_group(&request) {
                continue;
            }
            if entry.has_same_data_set(&request) {
                let nodes = entry.opc_nodes.get_or_insert_with(Vec::new);
                for node in request.opc_nodes() {
                    if nodes.iter().any(|n| n.is_same(node)) {
                        tracing::debug!(
                            node = node.node_id().unwrap_or_default(),
                            endpoint = %request.endpoint_url,
                            "Node already published"
                        );
                    } else {
                        nodes.push(node.clone());
                    }
                }
                entry.tag = request.tag.clone();
                entry.last_change_date_time = Some(now);
                data_set_found = true;
            }
            groups.push(entry.clone());
        }
        if !data_set_found {
            let mut entry = request.clone();
            entry.last_change_date_time = Some(now);
            groups.push(entry.clone());
            entries.push(entry);
        }

        let jobs = self.converter.convert(&groups)?;
        self.persist(&mut config, entries)?;
        let found = !jobs.is_empty();
        {
            let mut state = self.jobs.lock();
            for job in jobs {
                state.upsert(job);
            }
        }
        if !found {
            return Err(ApiError::not_found(format!(
                "Endpoint not found: {}",
                request.endpoint_url
            )));
        }
        self.notify();
        Ok(())
    }

    /// Remove nodes from the matching data set. A request without nodes
    /// removes the whole data set.
    pub fn unpublish_nodes(&self, request: PublishedNodesEntry) -> Result<(), ApiError> {
        let _timer = MethodTimer::start("UnpublishNodes");
        let purge = !request.has_nodes();
        let job_id = JobConverter::job_id(&request.connection())?;

        let mut config = self.config.lock();
        let mut missing: Vec<&OpcNode> = request.opc_nodes().iter().collect();
        let mut matched = false;
        for entry in config.entries.iter().filter(|e| e.has_same_data_set(&request)) {
            matched = true;
            missing.retain(|node| !entry.opc_nodes().iter().any(|n| n.is_same(node)));
        }
        if !matched {
            return Err(ApiError::not_found(format!(
                "Endpoint not found: {}",
                request.endpoint_url
            )));
        }
        if !missing.is_empty() {
            let ids: Vec<&str> = missing.iter().filter_map(|n| n.node_id()).collect();
            return Err(ApiError::not_found(format!("Nodes not found: {}", ids.join(", "))));
        }

        let mut entries = config.entries.clone();
        let now = Utc::now();
        let mut groups = Vec::new();
        for entry in entries.iter_mut() {
            if !entry.has_same_group(&request) {
                continue;
            }
            if entry.has_same_data_set(&request) {
                if purge {
                    entry.opc_nodes = Some(Vec::new());
                } else {
                    if let Some(nodes) = entry.opc_nodes.as_mut() {
                        nodes.retain(|n| !request.opc_nodes().iter().any(|r| r.is_same(n)));
                    }
                    entry.tag = request.tag.clone();
                }
                entry.last_change_date_time = Some(now);
            }
            groups.push(entry.clone());
        }
        entries.retain(PublishedNodesEntry::has_nodes);

        let jobs = self.converter.convert(&groups)?;
        self.persist(&mut config, entries)?;
        let found = {
            let mut state = self.jobs.lock();
            let mut found = false;
            for job in jobs {
                found |= state.replace_existing(job);
            }
            // every node of the connection is gone: drop its job
            found || state.remove(&job_id)
        };
        if !found {
            return Err(ApiError::not_found(format!(
                "Endpoint not found: {}",
                request.endpoint_url
            )));
        }
        self.notify();
        Ok(())
    }

    /// Remove every node of the matching data set, or everything when no
    /// endpoint is given.
    pub fn unpublish_all_nodes(&self, request: Option<&PublishedNodesEntry>) -> Result<(), ApiError> {
        let _timer = MethodTimer::start("UnpublishAllNodes");
        let mut config = self.config.lock();

        let Some(request) = request.filter(|r| !r.endpoint_url.is_empty()) else {
            self.persist(&mut config, Vec::new())?;
            self.jobs.lock().clear();
            self.notify();
            return Ok(());
        };

        let job_id = JobConverter::job_id(&request.connection())?;
        let mut entries = config.entries.clone();
        let now = Utc::now();
        let mut found = false;
        let mut groups = Vec::new();
        for entry in entries.iter_mut() {
            if !entry.has_same_group(request) {
                continue;
            }
            if entry.has_same_data_set(request) {
                entry.opc_nodes = Some(Vec::new());
                entry.last_change_date_time = Some(now);
                found = true;
            }
            groups.push(entry.clone());
        }
        if !found {
            return Err(ApiError::not_found(format!(
                "Endpoint or node not found: {}",
                request.endpoint_url
            )));
        }
        entries.retain(PublishedNodesEntry::has_nodes);

        let jobs = self.converter.convert(&groups)?;
        self.persist(&mut config, entries)?;
        let found = {
            let mut state = self.jobs.lock();
            let mut found = false;
            for job in jobs {
                found |= state.replace_existing(job);
            }
            found || state.remove(&job_id)
        };
        if !found {
            return Err(ApiError::not_found(format!(
                "Endpoint not found: {}",
                request.endpoint_url
            )));
        }
        self.notify();
        Ok(())
    }

    /// Replace the nodes of each data set in `request`. Entries without
    /// nodes remove their data set, which must exist.
    pub fn add_or_update_endpoints(&self, request: Vec<PublishedNodesEntry>) -> Result<(), ApiError> {
        let _timer = MethodTimer::start("AddOrUpdateEndpoints");
        for i in 1..request.len() {
            for j in 0..i {
                if request[i].has_same_data_set(&request[j]) {
                    return Err(ApiError::bad_request(format!(
                        "Request contains two entries for the same endpoint at index {} and {}",
                        j, i
                    )));
                }
            }
        }

        let mut config = self.config.lock();
        let removals: Vec<&PublishedNodesEntry> = request.iter().filter(|e| !e.has_nodes()).collect();
        for removal in &removals {
            if !config.entries.iter().any(|e| e.has_same_data_set(removal)) {
                return Err(ApiError::not_found(format!(
                    "Endpoint not found: {}",
                    removal.endpoint_url
                )));
            }
        }

        let mut entries = config.entries.clone();
        let now = Utc::now();
        let mut groups = Vec::new();
        let mut matched = vec![false; request.len()];
        for entry in entries.iter_mut() {
            let mut group_found = false;
            for (k, update) in request.iter().enumerate() {
                if !entry.has_same_group(update) {
                    continue;
                }
                group_found = true;
                if entry.has_same_data_set(update) {
                    // nodes go to the first matching entry, later duplicates are emptied
                    if !update.has_nodes() || matched[k] {
                        entry.opc_nodes = Some(Vec::new());
                    } else {
                        entry.opc_nodes = update.opc_nodes.clone();
                    }
                    matched[k] = true;
                    entry.tag = update.tag.clone();
                    entry.last_change_date_time = Some(now);
                    break;
                }
            }
            if group_found {
                groups.push(entry.clone());
            }
        }
        for (update, _) in request.iter().zip(&matched).filter(|(_, m)| !**m) {
            let mut entry = update.clone();
            entry.last_change_date_time = Some(now);
            groups.push(entry.clone());
            entries.push(entry);
        }
        entries.retain(PublishedNodesEntry::has_nodes);

        let jobs = self.converter.convert(&groups)?;
        let removed_ids = removals
            .iter()
            .map(|r| JobConverter::job_id(&r.connection()))
            .collect::<Result<Vec<_>, _>>()?;
        self.persist(&mut config, entries)?;
        {
            let mut state = self.jobs.lock();
            let mut processed = HashSet::new();
            for job in jobs {
                processed.insert(job.id.clone());
                state.upsert(job);
            }
            for id in removed_ids.iter().filter(|id| !processed.contains(*id)) {
                state.remove(id);
            }
        }
        self.notify();
        Ok(())
    }

    /// Entry headers without nodes.
    pub fn get_configured_endpoints(&self) -> Vec<PublishedNodesEntry> {
        let _timer = MethodTimer::start("GetConfiguredEndpoints");
        self.config
            .lock()
            .entries
            .iter()
            .map(PublishedNodesEntry::header)
            .collect()
    }

    /// Nodes of every entry matching the data set of `request`.
    pub fn get_configured_nodes_on_endpoint(
        &self,
        request: &PublishedNodesEntry,
    ) -> Result<Vec<OpcNode>, ApiError> {
        let _timer = MethodTimer::start("GetConfiguredNodesOnEndpoint");
        let config = self.config.lock();
        let mut found = false;
        let mut nodes = Vec::new();
        for entry in config.entries.iter().filter(|e| e.has_same_data_set(request)) {
            found = true;
            nodes.extend(entry.opc_nodes().iter().cloned());
        }
        if !found {
            return Err(ApiError::not_found(format!(
                "Endpoint not found: {}",
                request.endpoint_url
            )));
        }
        Ok(nodes)
    }

    /// Diagnostics last reported for each assigned job.
    pub fn get_diagnostic_info(&self) -> Vec<JobDiagnosticInfo> {
        let _timer = MethodTimer::start("GetDiagnosticInfo");
        self.jobs.lock().diagnostics.values().cloned().collect()
    }
}

impl JobOrchestrator for PublishedNodesReconciler {
    fn get_available_job(&self, request: &JobRequest) -> Result<Option<JobModel>, OrchestratorError> {
        if request.worker_id.is_empty() {
            return Err(OrchestratorError::InvalidRequest("worker id is empty".into()));
        }
        let mut state = self.jobs.lock();
        if let Some(job) = state.assigned.get(&request.worker_id) {
            return Ok(Some(job.clone()));
        }
        let Some((_, job)) = state.available.pop_first() else {
            return Ok(None);
        };
        tracing::info!(worker = %request.worker_id, job = %job.id, "Job assigned");
        state.assigned.insert(request.worker_id.clone(), job.clone());
        Ok(Some(job))
    }

    fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, OrchestratorError> {
        if request.worker_id.is_empty() {
            return Err(OrchestratorError::InvalidRequest("worker id is empty".into()));
        }
        let mut state = self.jobs.lock();
        let response = decide_heartbeat(state.assigned.get(&request.worker_id), request)?;

        if let Some(info) = &request.diagnostics {
            if state.assigned.values().any(|job| job.id == info.job_id) {
                state.diagnostics.insert(info.job_id.clone(), info.clone());
            }
        }
        tracing::debug!(
            worker = %request.worker_id,
            instruction = ?response.instruction,
            job = request.job_id.as_deref().unwrap_or(""),
            "Heartbeat handled"
        );
        Ok(response)
    }

    fn changes(&self) -> Option<watch::Receiver<u64>> {
        Some(self.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PUBLISHED_NODES_SCHEMA;
    use telepub::{EngineConfig, HeartbeatInstruction};
    use tempfile::TempDir;

    const TWO_ENDPOINTS: &str = r#"[
        { "EndpointUrl": "opc.tcp://a:4840", "OpcNodes": [ { "Id": "i=1" }, { "Id": "i=2" } ] },
        { "EndpointUrl": "opc.tcp://b:4840", "DataSetWriterGroup": "g", "OpcNodes": [ { "Id": "i=3" } ] }
    ]"#;

    struct Fixture {
        _dir: TempDir,
        path: PathBuf,
        reconciler: PublishedNodesReconciler,
    }

    fn fixture(content: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("publishednodes.json");
        std::fs::write(&path, content).unwrap();
        let reconciler = PublishedNodesReconciler::new(&path, JobConverter::new(EngineConfig::default()))
            .retry_delay(Duration::from_millis(1));
        Fixture {
            _dir: dir,
            path,
            reconciler,
        }
    }

    fn worker(id: &str) -> JobRequest {
        JobRequest { worker_id: id.into() }
    }

    fn heartbeat(worker: &str, job: &JobModel) -> HeartbeatRequest {
        HeartbeatRequest {
            worker_id: worker.into(),
            job_id: Some(job.id.clone()),
            job_hash: Some(job.hash().unwrap()),
            diagnostics: None,
        }
    }

    fn group_entry(nodes: &[&str]) -> PublishedNodesEntry {
        PublishedNodesEntry::new("opc.tcp://plc:4840")
            .group("G")
            .writer("w1")
            .nodes(nodes.iter().map(|n| OpcNode::new(*n)))
    }

    #[test]
    fn test_reload_builds_jobs_and_dedups_by_hash() {
        let f = fixture(TWO_ENDPOINTS);
        assert_eq!(f.reconciler.refresh_from_file(), ReloadOutcome::Reloaded { jobs: 2 });
        assert_eq!(f.reconciler.available_jobs().len(), 2);

        let before = std::fs::read_to_string(&f.path).unwrap();
        assert_eq!(f.reconciler.refresh_from_file(), ReloadOutcome::Unchanged);
        assert_eq!(f.reconciler.job_count(), 2);
        assert_eq!(std::fs::read_to_string(&f.path).unwrap(), before);
    }

    #[test]
    fn test_malformed_content_keeps_last_good() {
        let f = fixture(TWO_ENDPOINTS);
        f.reconciler.refresh_from_file();

        std::fs::write(&f.path, "[{ not json").unwrap();
        assert_eq!(f.reconciler.refresh_from_file(), ReloadOutcome::Aborted);
        assert_eq!(f.reconciler.job_count(), 2);
        assert_eq!(f.reconciler.entries().len(), 2);

        std::fs::write(
            &f.path,
            r#"[{ "EndpointUrl": "opc.tcp://a:4840", "NodeId": { "Identifier": "i=1" }, "OpcNodes": [ { "Id": "i=2" } ] }]"#,
        )
        .unwrap();
        assert_eq!(f.reconciler.refresh_from_file(), ReloadOutcome::Aborted);
        assert_eq!(f.reconciler.job_count(), 2);
    }

    #[test]
    fn test_empty_content_and_delete_clear_everything() {
        let f = fixture(TWO_ENDPOINTS);
        f.reconciler.refresh_from_file();
        std::fs::write(&f.path, "  ").unwrap();
        assert_eq!(f.reconciler.refresh_from_file(), ReloadOutcome::Cleared);
        assert_eq!(f.reconciler.job_count(), 0);

        std::fs::write(&f.path, TWO_ENDPOINTS).unwrap();
        assert_eq!(f.reconciler.refresh_from_file(), ReloadOutcome::Reloaded { jobs: 2 });
        f.reconciler.on_file_deleted();
        assert_eq!(f.reconciler.job_count(), 0);
        assert!(f.reconciler.entries().is_empty());
    }

    #[test]
    fn test_unreadable_file_retries_then_fails() {
        let f = fixture(TWO_ENDPOINTS);
        f.reconciler.refresh_from_file();
        std::fs::remove_file(&f.path).unwrap();
        std::fs::create_dir(&f.path).unwrap();
        assert_eq!(f.reconciler.refresh_from_file(), ReloadOutcome::Failed);
        assert_eq!(f.reconciler.job_count(), 2);
    }

    #[test]
    fn test_legacy_entries_and_nodeless_entries() {
        let f = fixture(
            r#"[
                { "EndpointUrl": "opc.tcp://a:4840", "NodeId": { "Identifier": "i=2258" } },
                { "EndpointUrl": "opc.tcp://b:4840", "OpcNodes": [] }
            ]"#,
        );
        assert_eq!(f.reconciler.refresh_from_file(), ReloadOutcome::Reloaded { jobs: 1 });
        let entries = f.reconciler.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].opc_nodes()[0].id.as_deref(), Some("i=2258"));
    }

    #[test]
    fn test_schema_violation_aborts_reload() {
        let f = fixture(r#"[{ "EndpointUrl": "http://not-opc", "OpcNodes": [ { "Id": "i=1" } ] }]"#);
        let schema = f.path.with_file_name("schema.json");
        std::fs::write(&schema, PUBLISHED_NODES_SCHEMA).unwrap();
        let reconciler = PublishedNodesReconciler::new(&f.path, JobConverter::new(EngineConfig::default()))
            .schema(&schema);
        assert_eq!(reconciler.refresh_from_file(), ReloadOutcome::Aborted);

        // a missing schema file disables validation
        std::fs::remove_file(&schema).unwrap();
        assert_eq!(reconciler.refresh_from_file(), ReloadOutcome::Reloaded { jobs: 1 });
    }

    #[test]
    fn test_pull_and_heartbeat_lifecycle() {
        let f = fixture(TWO_ENDPOINTS);
        f.reconciler.refresh_from_file();
        let r = &f.reconciler;

        let job = r.get_available_job(&worker("w1")).unwrap().unwrap();
        assert_eq!(r.get_available_job(&worker("w1")).unwrap(), Some(job.clone()));
        let other = r.get_available_job(&worker("w2")).unwrap().unwrap();
        assert_ne!(job.id, other.id);
        assert_eq!(r.get_available_job(&worker("w3")).unwrap(), None);

        let response = r.heartbeat(&heartbeat("w1", &job)).unwrap();
        assert_eq!(response.instruction, HeartbeatInstruction::Keep);

        // the worker runs the job of w2: cancel and hand out its own
        let response = r.heartbeat(&heartbeat("w1", &other)).unwrap();
        assert_eq!(response.instruction, HeartbeatInstruction::CancelProcessing);
        assert_eq!(response.job, Some(job));

        let response = r.heartbeat(&heartbeat("w3", &other)).unwrap();
        assert_eq!(response.instruction, HeartbeatInstruction::CancelProcessing);
        assert!(response.job.is_none());
    }

    #[test]
    fn test_reload_updates_assigned_job_in_place() {
        let f = fixture(TWO_ENDPOINTS);
        f.reconciler.refresh_from_file();
        let job = f.reconciler.get_available_job(&worker("w1")).unwrap().unwrap();

        let changed = TWO_ENDPOINTS.replace(r#"{ "Id": "i=2" }"#, r#"{ "Id": "i=2" }, { "Id": "i=9" }"#);
        let changed = changed.replace(r#"{ "Id": "i=3" }"#, r#"{ "Id": "i=3" }, { "Id": "i=8" }"#);
        std::fs::write(&f.path, changed).unwrap();
        assert_eq!(f.reconciler.refresh_from_file(), ReloadOutcome::Reloaded { jobs: 2 });

        let assigned = f.reconciler.assigned_jobs();
        let updated = &assigned["w1"];
        assert_eq!(updated.id, job.id);
        assert_ne!(updated.hash().unwrap(), job.hash().unwrap());

        let response = f.reconciler.heartbeat(&heartbeat("w1", &job)).unwrap();
        assert_eq!(response.instruction, HeartbeatInstruction::Update);
        assert_eq!(response.job.as_ref(), Some(updated));
    }

    #[test]
    fn test_heartbeat_stores_diagnostics_of_assigned_jobs() {
        let f = fixture(TWO_ENDPOINTS);
        f.reconciler.refresh_from_file();
        let job = f.reconciler.get_available_job(&worker("w1")).unwrap().unwrap();

        let mut request = heartbeat("w1", &job);
        request.diagnostics = Some(JobDiagnosticInfo {
            job_id: job.id.clone(),
            worker_id: "w1".into(),
            timestamp: Utc::now(),
            writer_groups: Vec::new(),
        });
        f.reconciler.heartbeat(&request).unwrap();

        request.diagnostics = Some(JobDiagnosticInfo {
            job_id: "unknown".into(),
            worker_id: "w1".into(),
            timestamp: Utc::now(),
            writer_groups: Vec::new(),
        });
        f.reconciler.heartbeat(&request).unwrap();

        let info = f.reconciler.get_diagnostic_info();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].job_id, job.id);
    }

    #[test]
    fn test_publish_then_unpublish_leaves_remaining_node() {
        let f = fixture("[]");
        let r = &f.reconciler;
        let mut changes = r.subscribe();

        r.publish_nodes(group_entry(&["n1", "n2"])).unwrap();
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();
        assert_eq!(r.job_count(), 1);

        r.unpublish_nodes(group_entry(&["n2"])).unwrap();
        let nodes = r.get_configured_nodes_on_endpoint(&group_entry(&[])).unwrap();
        let ids: Vec<_> = nodes.iter().filter_map(|n| n.node_id()).collect();
        assert_eq!(ids, vec!["n1"]);
        assert!(changes.has_changed().unwrap());

        let job = &r.available_jobs()[0];
        assert_eq!(job.writer_group.writers.len(), 1);
        assert_eq!(job.writer_group.writers[0].items.len(), 1);

        // the persisted file round-trips without a reload
        assert_eq!(r.refresh_from_file(), ReloadOutcome::Unchanged);
        let persisted = parse_entries(&std::fs::read_to_string(&f.path).unwrap()).unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(persisted[0].last_change_date_time.is_some());
    }

    #[test]
    fn test_publish_adds_only_new_nodes() {
        let f = fixture("[]");
        f.reconciler.publish_nodes(group_entry(&["n1"])).unwrap();
        f.reconciler.publish_nodes(group_entry(&["n1", "n2"])).unwrap();
        let nodes = f.reconciler.get_configured_nodes_on_endpoint(&group_entry(&[])).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(f.reconciler.entries().len(), 1);
    }

    #[test]
    fn test_publish_rejects_empty_nodes() {
        let f = fixture("[]");
        let err = f.reconciler.publish_nodes(group_entry(&[])).unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.message, "null or empty OpcNodes is provided in request");
    }

    #[test]
    fn test_unpublish_errors() {
        let f = fixture("[]");
        f.reconciler.publish_nodes(group_entry(&["n1"])).unwrap();

        let err = f
            .reconciler
            .unpublish_nodes(PublishedNodesEntry::new("opc.tcp://other:4840").nodes([OpcNode::new("n1")]))
            .unwrap_err();
        assert_eq!(err, ApiError::not_found("Endpoint not found: opc.tcp://other:4840"));

        let err = f.reconciler.unpublish_nodes(group_entry(&["n7"])).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.message.contains("n7"));
        assert_eq!(f.reconciler.entries()[0].opc_nodes().len(), 1);
    }

    #[test]
    fn test_failed_write_leaves_entries_and_jobs_untouched() {
        let f = fixture("[]");
        let r = &f.reconciler;
        r.publish_nodes(group_entry(&["n1"])).unwrap();
        let job = r.available_jobs()[0].clone();
        let mut changes = r.subscribe();

        // a directory in place of the file makes every write fail
        std::fs::remove_file(&f.path).unwrap();
        std::fs::create_dir(&f.path).unwrap();

        assert!(r.publish_nodes(group_entry(&["n2"])).is_err());
        assert!(r.unpublish_nodes(group_entry(&["n1"])).is_err());
        assert!(r.unpublish_all_nodes(None).is_err());
        assert!(r
            .add_or_update_endpoints(vec![PublishedNodesEntry::new("opc.tcp://new:4840").nodes([OpcNode::new("i=1")])])
            .is_err());

        let entries = r.entries();
        assert_eq!(entries.len(), 1);
        let ids: Vec<_> = entries[0].opc_nodes().iter().filter_map(|n| n.node_id()).collect();
        assert_eq!(ids, vec!["n1"]);
        assert_eq!(r.available_jobs(), vec![job]);
        assert!(!changes.has_changed().unwrap());
    }

    #[test]
    fn test_unpublish_last_node_removes_job() {
        let f = fixture("[]");
        f.reconciler.publish_nodes(group_entry(&["n1"])).unwrap();
        let job = f.reconciler.get_available_job(&worker("w1")).unwrap().unwrap();

        f.reconciler.unpublish_nodes(group_entry(&["n1"])).unwrap();
        assert_eq!(f.reconciler.job_count(), 0);
        assert!(f.reconciler.entries().is_empty());
        let response = f.reconciler.heartbeat(&heartbeat("w1", &job)).unwrap();
        assert_eq!(response.instruction, HeartbeatInstruction::CancelProcessing);
    }

    #[test]
    fn test_unpublish_all_nodes() {
        let f = fixture(TWO_ENDPOINTS);
        f.reconciler.refresh_from_file();

        let err = f
            .reconciler
            .unpublish_all_nodes(Some(&PublishedNodesEntry::new("opc.tcp://x:4840")))
            .unwrap_err();
        assert_eq!(err, ApiError::not_found("Endpoint or node not found: opc.tcp://x:4840"));

        f.reconciler
            .unpublish_all_nodes(Some(&PublishedNodesEntry::new("opc.tcp://a:4840")))
            .unwrap();
        assert_eq!(f.reconciler.job_count(), 1);
        assert_eq!(f.reconciler.entries().len(), 1);

        f.reconciler.unpublish_all_nodes(None).unwrap();
        assert_eq!(f.reconciler.job_count(), 0);
        assert_eq!(std::fs::read_to_string(&f.path).unwrap().trim(), "[]");
    }

    #[test]
    fn test_add_or_update_endpoints() {
        let f = fixture("[]");
        let r = &f.reconciler;
        r.publish_nodes(group_entry(&["n1", "n2"])).unwrap();

        let err = r
            .add_or_update_endpoints(vec![group_entry(&["a"]), group_entry(&["b"])])
            .unwrap_err();
        assert_eq!(
            err,
            ApiError::bad_request("Request contains two entries for the same endpoint at index 0 and 1")
        );

        let err = r
            .add_or_update_endpoints(vec![PublishedNodesEntry::new("opc.tcp://gone:4840")])
            .unwrap_err();
        assert!(err.is_not_found());

        let other = PublishedNodesEntry::new("opc.tcp://b:4840").nodes([OpcNode::new("x")]);
        r.add_or_update_endpoints(vec![group_entry(&["n3"]), other]).unwrap();
        let nodes = r.get_configured_nodes_on_endpoint(&group_entry(&[])).unwrap();
        assert_eq!(nodes, vec![OpcNode::new("n3")]);
        assert_eq!(r.job_count(), 2);

        r.add_or_update_endpoints(vec![group_entry(&[])]).unwrap();
        assert_eq!(r.job_count(), 1);
        assert!(r.get_configured_nodes_on_endpoint(&group_entry(&[])).is_err());
    }

    #[test]
    fn test_configured_endpoints_are_headers() {
        let f = fixture(TWO_ENDPOINTS);
        f.reconciler.refresh_from_file();
        let endpoints = f.reconciler.get_configured_endpoints();
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints.iter().all(|e| e.opc_nodes.is_none()));
        assert_eq!(endpoints[1].data_set_writer_group.as_deref(), Some("g"));
    }

    #[test]
    fn test_orchestrator_exposes_changes() {
        let f = fixture(TWO_ENDPOINTS);
        let rx = f.reconciler.changes().unwrap();
        f.reconciler.refresh_from_file();
        assert_eq!(*rx.borrow(), 1);
    }
}
