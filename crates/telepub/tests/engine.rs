// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine integration tests
//!
//! Jobs applied through the change feed, data changes pushed through a mock
//! subscription, messages observed on the transport.

use byteorder::{LittleEndian, ReadBytesExt};
use serde_json::json;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;
use telepub::{
    BatchSettings, ConnectionModel, DataSetWriterConfig, EngineConfig, EngineContext,
    FileTransport, JobModel, MockSubscriptionClient, MockTransport, PublishedItem, Transport,
    WriterGroupConfig, WriterGroupController,
};

fn engine() -> EngineConfig {
    let mut engine = EngineConfig::default();
    engine.diagnostics_interval_secs = 0;
    engine
}

fn writer(id: &str, dataset_writer_id: u16, node: &str) -> DataSetWriterConfig {
    DataSetWriterConfig::new(
        id,
        dataset_writer_id,
        ConnectionModel::new("opc.tcp://plc:4840"),
        vec![PublishedItem::new(node)],
    )
}

fn job(writers: Vec<DataSetWriterConfig>) -> JobModel {
    let mut group = WriterGroupConfig::new("line-1", "pub");
    group.batching = BatchSettings::default()
        .with_batch_size(1)
        .with_trigger_interval_ms(0);
    group.writers = writers;
    JobModel::new("job-1", group)
}

fn start(transport: Arc<dyn Transport>) -> (WriterGroupController, Arc<MockSubscriptionClient>) {
    let client = Arc::new(MockSubscriptionClient::new());
    let controller = WriterGroupController::start(EngineContext::new(client.clone(), transport, engine()));
    (controller, client)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn job_lifecycle_through_change_feed() {
    let transport = Arc::new(MockTransport::new());
    let (controller, client) = start(transport.clone());

    controller.apply(vec![job(vec![writer("a", 1, "ns=2;s=A")])]).await.unwrap();
    assert_eq!(client.open_writers(), vec!["a".to_string()]);
    assert!(client.push("a", &[("ns=2;s=A", json!(21.5))]));
    settle().await;
    let data: Vec<_> = transport.messages().into_iter().filter(|m| !m.is_metadata).collect();
    assert_eq!(data.len(), 1);
    assert!(serde_json::from_slice::<serde_json::Value>(&data[0].body).is_ok());

    controller
        .apply(vec![job(vec![writer("a", 1, "ns=2;s=A"), writer("b", 2, "ns=2;s=B")])])
        .await
        .unwrap();
    assert_eq!(client.open_writers(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(controller.writer_groups()[0].writers.len(), 2);

    controller.apply(Vec::new()).await.unwrap();
    assert!(client.open_writers().is_empty());
    assert!(controller.writer_groups().is_empty());
    assert!(!client.push("a", &[("ns=2;s=A", json!(1))]));

    controller.shutdown().await;
}

#[tokio::test]
async fn file_transport_writes_length_prefixed_records() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("messages.bin");
    let transport = Arc::new(FileTransport::open(&path).unwrap());
    let (controller, client) = start(transport);

    controller.apply(vec![job(vec![writer("a", 1, "ns=2;s=A")])]).await.unwrap();
    client.push("a", &[("ns=2;s=A", json!(1))]);
    client.push("a", &[("ns=2;s=A", json!(2))]);
    settle().await;
    controller.shutdown().await;

    let bytes = std::fs::read(&path).unwrap();
    let mut cursor = Cursor::new(bytes.as_slice());
    let mut records = 0;
    while (cursor.position() as usize) < bytes.len() {
        let len = cursor.read_u32::<LittleEndian>().unwrap() as usize;
        let mut body = vec![0u8; len];
        cursor.read_exact(&mut body).unwrap();
        records += 1;
    }
    assert!(records >= 2);
}
