// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Orchestration integration tests
//!
//! Drive real workers against a file-backed reconciler:
//! - configuration API changes reach the running writer groups
//! - file edits picked up by the watcher reach the running writer groups
//! - identical content is a no-op, malformed content keeps the last good state

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telepub::{
    EngineConfig, EngineContext, HeartbeatInstruction, HeartbeatRequest, JobOrchestrator,
    JobRequest, MockSubscriptionClient, MockTransport, Worker, WorkerConfig,
    WriterGroupController,
};
use telepub_orchestrator::{
    JobConverter, OpcNode, PublishedNodesEntry, PublishedNodesReconciler, PublishedNodesWatcher,
    ReloadOutcome,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const ENDPOINT: &str = "opc.tcp://plc:4840";

struct Fixture {
    _dir: TempDir,
    path: PathBuf,
    reconciler: Arc<PublishedNodesReconciler>,
    client: Arc<MockSubscriptionClient>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

fn engine() -> EngineConfig {
    let mut engine = EngineConfig::default();
    engine.diagnostics_interval_secs = 0;
    engine
}

fn spawn(content: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("publishednodes.json");
    std::fs::write(&path, content).unwrap();

    let reconciler = Arc::new(
        PublishedNodesReconciler::new(&path, JobConverter::new(engine()))
            .retry_delay(Duration::from_millis(1)),
    );
    reconciler.refresh_from_file();

    let client = Arc::new(MockSubscriptionClient::new());
    let ctx = EngineContext::new(client.clone(), Arc::new(MockTransport::new()), engine());
    let controller = Arc::new(WriterGroupController::start(ctx));
    let cancel = CancellationToken::new();
    let worker = Worker::new(
        WorkerConfig::new("worker-1").heartbeat_interval(Duration::from_millis(50)),
        reconciler.clone(),
        controller,
        cancel.clone(),
    );
    let handle = tokio::spawn(worker.run());

    Fixture {
        _dir: dir,
        path,
        reconciler,
        client,
        cancel,
        handle,
    }
}

fn entry(writer: &str, nodes: &[&str]) -> PublishedNodesEntry {
    PublishedNodesEntry::new(ENDPOINT)
        .writer(writer)
        .nodes(nodes.iter().map(|n| OpcNode::new(*n)))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..50 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn api_changes_reach_running_writers() {
    let f = spawn("[]");
    settle().await;
    assert!(f.client.open_writers().is_empty());

    f.reconciler.publish_nodes(entry("line1", &["n1", "n2"])).unwrap();
    assert!(eventually(|| f.client.open_writers() == vec!["line1".to_string()]).await);
    assert!(f.reconciler.assigned_jobs().contains_key("worker-1"));

    f.reconciler.publish_nodes(entry("line2", &["n3"])).unwrap();
    assert!(
        eventually(|| f.client.open_writers() == vec!["line1".to_string(), "line2".to_string()])
            .await
    );

    f.reconciler.unpublish_nodes(entry("line1", &["n2"])).unwrap();
    let nodes = f.reconciler.get_configured_nodes_on_endpoint(&entry("line1", &[])).unwrap();
    assert_eq!(nodes, vec![OpcNode::new("n1")]);

    f.reconciler.unpublish_all_nodes(None).unwrap();
    assert!(eventually(|| f.client.open_writers().is_empty()).await);
    assert!(f.reconciler.assigned_jobs().is_empty());

    f.cancel.cancel();
    f.handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_edits_reach_running_writers() {
    let f = spawn(r#"[{ "EndpointUrl": "opc.tcp://plc:4840", "DataSetWriterId": "a", "OpcNodes": [ { "Id": "n1" } ] }]"#);
    let mut watcher = PublishedNodesWatcher::new(f.reconciler.clone(), Duration::from_millis(20));
    watcher.start().unwrap();
    assert!(eventually(|| f.client.open_writers() == vec!["a".to_string()]).await);

    std::fs::write(
        &f.path,
        r#"[{ "EndpointUrl": "opc.tcp://plc:4840", "DataSetWriterId": "b", "OpcNodes": [ { "Id": "n1" } ] }]"#,
    )
    .unwrap();
    assert!(eventually(|| f.client.open_writers() == vec!["b".to_string()]).await);

    std::fs::remove_file(&f.path).unwrap();
    assert!(eventually(|| f.client.open_writers().is_empty()).await);

    watcher.stop();
    f.cancel.cancel();
    f.handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_and_malformed_content_keep_state() {
    let content = r#"[{ "EndpointUrl": "opc.tcp://plc:4840", "DataSetWriterId": "a", "OpcNodes": [ { "Id": "n1" } ] }]"#;
    let f = spawn(content);
    assert!(eventually(|| f.client.open_writers() == vec!["a".to_string()]).await);
    let created = f.client.created_count();
    let mut changes = f.reconciler.subscribe();

    std::fs::write(&f.path, content).unwrap();
    assert_eq!(f.reconciler.refresh_from_file(), ReloadOutcome::Unchanged);

    std::fs::write(&f.path, "[{ \"EndpointUrl\": ").unwrap();
    assert_eq!(f.reconciler.refresh_from_file(), ReloadOutcome::Aborted);
    assert!(!changes.has_changed().unwrap());

    settle().await;
    assert_eq!(f.client.open_writers(), vec!["a".to_string()]);
    assert_eq!(f.client.created_count(), created);

    f.cancel.cancel();
    f.handle.await.unwrap();
}

#[test]
fn heartbeat_protocol_against_reconciler() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("publishednodes.json");
    std::fs::write(&path, "[]").unwrap();
    let reconciler = PublishedNodesReconciler::new(&path, JobConverter::new(engine()));

    assert_eq!(
        reconciler
            .get_available_job(&JobRequest { worker_id: "w".into() })
            .unwrap(),
        None
    );

    reconciler.publish_nodes(entry("a", &["n1"])).unwrap();
    let job = reconciler
        .get_available_job(&JobRequest { worker_id: "w".into() })
        .unwrap()
        .unwrap();
    let request = HeartbeatRequest {
        worker_id: "w".into(),
        job_id: Some(job.id.clone()),
        job_hash: Some(job.hash().unwrap()),
        diagnostics: None,
    };
    assert_eq!(
        reconciler.heartbeat(&request).unwrap().instruction,
        HeartbeatInstruction::Keep
    );

    reconciler.publish_nodes(entry("a", &["n2"])).unwrap();
    let response = reconciler.heartbeat(&request).unwrap();
    assert_eq!(response.instruction, HeartbeatInstruction::Update);
    assert_eq!(response.job.unwrap().writer_group.writers[0].items.len(), 2);

    reconciler.unpublish_all_nodes(None).unwrap();
    let response = reconciler.heartbeat(&request).unwrap();
    assert_eq!(response.instruction, HeartbeatInstruction::CancelProcessing);
    assert!(response.job.is_none());
}
