// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Abstract data source interface.
//!
//! The protocol stack (sessions, monitored items, wire codec) lives outside
//! this crate. The subscription source only talks to it through the traits
//! below, so tests and the demo binary can plug in [`MockSubscriptionClient`]
//! or [`SimulatedSubscriptionClient`].

use crate::message::{
    DataSetMetaData, DataValue, FieldMetaData, MetaDataVersion, Notification,
};
use crate::model::DataSetWriterConfig;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors reported by the data source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Connection to {0} failed")]
    Connection(String),

    #[error("Snapshot not available: {0}")]
    SnapshotUnavailable(String),

    #[error("Source requires a Tokio runtime")]
    NoRuntime,

    #[error("Source closed")]
    Closed,
}

/// Raw change notification delivered by a subscription.
#[derive(Debug, Clone)]
pub struct DataChange {
    pub notifications: Vec<Notification>,

    /// Schema version observed by the stack, if it tracks one.
    pub metadata_version: Option<MetaDataVersion>,
}

/// Receives raw subscription events.
pub trait SubscriptionCallback: Send + Sync {
    /// Called for every data change or event publish.
    fn on_data_change(&self, change: DataChange);

    /// Called when the subscription publishes a keep-alive.
    fn on_keep_alive(&self);
}

/// One live subscription of the protocol stack.
pub trait Subscription: Send + Sync {
    /// Stack-assigned subscription id.
    fn id(&self) -> &str;

    /// Apply a changed writer configuration in place.
    fn apply(&self, writer: &DataSetWriterConfig) -> Result<(), SourceError>;

    /// Last known value of every monitored item.
    fn key_frame(&self) -> Result<Vec<Notification>, SourceError>;

    /// Current data set schema.
    fn metadata(&self) -> Result<DataSetMetaData, SourceError>;

    /// Tear the subscription down. No callbacks are delivered afterwards.
    fn close(&self);
}

/// Factory for subscriptions.
pub trait SubscriptionClient: Send + Sync {
    /// Create a subscription for `writer`, delivering events to `callback`.
    fn create_subscription(
        &self,
        writer: &DataSetWriterConfig,
        callback: Arc<dyn SubscriptionCallback>,
    ) -> Result<Arc<dyn Subscription>, SourceError>;
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Mock client for tests: subscriptions are driven by hand through
/// [`MockSubscriptionClient::push`].
#[derive(Default)]
pub struct MockSubscriptionClient {
    subscriptions: Mutex<HashMap<String, Arc<MockSubscription>>>,
    created: AtomicU32,
    fail_create: AtomicBool,
}

impl MockSubscriptionClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create_subscription` calls fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Number of subscriptions created so far.
    pub fn created_count(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    /// Live subscription for a writer.
    pub fn subscription(&self, writer_id: &str) -> Option<Arc<MockSubscription>> {
        self.subscriptions.lock().get(writer_id).cloned()
    }

    /// Writers with an open subscription.
    pub fn open_writers(&self) -> Vec<String> {
        let mut writers: Vec<_> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|(_, s)| !s.is_closed())
            .map(|(w, _)| w.clone())
            .collect();
        writers.sort();
        writers
    }

    /// Deliver `(node_id, value)` pairs as one data change of `writer_id`.
    ///
    /// Returns `false` when the writer has no open subscription.
    pub fn push(&self, writer_id: &str, values: &[(&str, serde_json::Value)]) -> bool {
        match self.subscription(writer_id) {
            Some(sub) if !sub.is_closed() => {
                sub.push(values, None);
                true
            }
            _ => false,
        }
    }
}

impl SubscriptionClient for MockSubscriptionClient {
    fn create_subscription(
        &self,
        writer: &DataSetWriterConfig,
        callback: Arc<dyn SubscriptionCallback>,
    ) -> Result<Arc<dyn Subscription>, SourceError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SourceError::Connection(writer.connection.endpoint_url.clone()));
        }
        let number = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let sub = Arc::new(MockSubscription {
            id: format!("mock-{}", number),
            writer: Mutex::new(writer.clone()),
            callback,
            last_values: Mutex::new(BTreeMap::new()),
            version: Mutex::new(MetaDataVersion::new(1, 0)),
            sequence: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            fail_snapshot: AtomicBool::new(false),
            applied: AtomicU32::new(0),
        });
        self.subscriptions
            .lock()
            .insert(writer.writer_id.clone(), sub.clone());
        Ok(sub)
    }
}

/// Subscription created by [`MockSubscriptionClient`].
pub struct MockSubscription {
    id: String,
    writer: Mutex<DataSetWriterConfig>,
    callback: Arc<dyn SubscriptionCallback>,
    last_values: Mutex<BTreeMap<String, DataValue>>,
    version: Mutex<MetaDataVersion>,
    sequence: AtomicU32,
    closed: AtomicBool,
    fail_snapshot: AtomicBool,
    applied: AtomicU32,
}

impl MockSubscription {
    /// Deliver a data change, optionally tagged with a schema version.
    pub fn push(&self, values: &[(&str, serde_json::Value)], version: Option<MetaDataVersion>) {
        if self.is_closed() {
            return;
        }
        let notifications: Vec<_> = {
            let writer = self.writer.lock();
            let mut last = self.last_values.lock();
            values
                .iter()
                .map(|(node_id, value)| {
                    let data = DataValue::good(value.clone());
                    last.insert(node_id.to_string(), data.clone());
                    self.notification(&writer, node_id, data)
                })
                .collect()
        };
        if let Some(version) = version {
            *self.version.lock() = version;
        }
        self.callback.on_data_change(DataChange {
            notifications,
            metadata_version: version,
        });
    }

    /// Deliver a keep-alive.
    pub fn keep_alive(&self) {
        if !self.is_closed() {
            self.callback.on_keep_alive();
        }
    }

    /// Make `key_frame` and `metadata` fail.
    pub fn set_fail_snapshot(&self, fail: bool) {
        self.fail_snapshot.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of in-place configuration updates applied.
    pub fn applied_count(&self) -> u32 {
        self.applied.load(Ordering::SeqCst)
    }

    fn notification(
        &self,
        writer: &DataSetWriterConfig,
        node_id: &str,
        value: DataValue,
    ) -> Notification {
        let item = writer.items.iter().find(|i| i.node_id == node_id);
        Notification {
            subscription_id: self.id.clone(),
            node_id: node_id.to_string(),
            display_name: item.and_then(|i| i.display_name.clone()),
            field_name: item
                .map(|i| i.field_name().to_string())
                .unwrap_or_else(|| node_id.to_string()),
            value,
            sequence_number: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            is_heartbeat: false,
        }
    }
}

impl Subscription for MockSubscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn apply(&self, writer: &DataSetWriterConfig) -> Result<(), SourceError> {
        *self.writer.lock() = writer.clone();
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn key_frame(&self) -> Result<Vec<Notification>, SourceError> {
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(SourceError::SnapshotUnavailable(self.id.clone()));
        }
        let writer = self.writer.lock();
        let last = self.last_values.lock();
        Ok(last
            .iter()
            .map(|(node_id, value)| self.notification(&writer, node_id, value.clone()))
            .collect())
    }

    fn metadata(&self) -> Result<DataSetMetaData, SourceError> {
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(SourceError::SnapshotUnavailable(self.id.clone()));
        }
        Ok(metadata_for(&self.writer.lock(), *self.version.lock()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn metadata_for(writer: &DataSetWriterConfig, version: MetaDataVersion) -> DataSetMetaData {
    DataSetMetaData {
        name: writer
            .dataset_name
            .clone()
            .unwrap_or_else(|| writer.writer_id.clone()),
        version,
        fields: writer
            .items
            .iter()
            .map(|i| FieldMetaData {
                name: i.field_name().to_string(),
                node_id: i.node_id.clone(),
            })
            .collect(),
    }
}

// ============================================================================
// Simulated data source
// ============================================================================

/// Client producing synthetic values on each writer's publishing interval.
///
/// Every item publishes a saw-tooth counter. Used by the binary when no real
/// protocol stack is wired in.
#[derive(Default)]
pub struct SimulatedSubscriptionClient {
    created: AtomicU32,
}

impl SimulatedSubscriptionClient {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionClient for SimulatedSubscriptionClient {
    fn create_subscription(
        &self,
        writer: &DataSetWriterConfig,
        callback: Arc<dyn SubscriptionCallback>,
    ) -> Result<Arc<dyn Subscription>, SourceError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| SourceError::NoRuntime)?;
        let number = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::new(MockSubscription {
            id: format!("sim-{}", number),
            writer: Mutex::new(writer.clone()),
            callback,
            last_values: Mutex::new(BTreeMap::new()),
            version: Mutex::new(MetaDataVersion::new(1, 0)),
            sequence: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            fail_snapshot: AtomicBool::new(false),
            applied: AtomicU32::new(0),
        });
        let cancel = CancellationToken::new();
        let period = Duration::from_millis(writer.publishing_interval_ms.max(10));

        let generator = inner.clone();
        let token = cancel.clone();
        handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tick = tick.wrapping_add(1);
                let node_ids: Vec<String> = generator
                    .writer
                    .lock()
                    .items
                    .iter()
                    .map(|i| i.node_id.clone())
                    .collect();
                let values: Vec<(&str, serde_json::Value)> = node_ids
                    .iter()
                    .enumerate()
                    .map(|(n, id)| (id.as_str(), serde_json::json!((tick + n as u64) % 100)))
                    .collect();
                generator.push(&values, None);
            }
        });

        Ok(Arc::new(SimulatedSubscription { inner, cancel }))
    }
}

struct SimulatedSubscription {
    inner: Arc<MockSubscription>,
    cancel: CancellationToken,
}

impl Subscription for SimulatedSubscription {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn apply(&self, writer: &DataSetWriterConfig) -> Result<(), SourceError> {
        self.inner.apply(writer)
    }

    fn key_frame(&self) -> Result<Vec<Notification>, SourceError> {
        self.inner.key_frame()
    }

    fn metadata(&self) -> Result<DataSetMetaData, SourceError> {
        self.inner.metadata()
    }

    fn close(&self) {
        self.cancel.cancel();
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionModel, PublishedItem};

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<DataChange>>,
        keep_alives: AtomicU32,
    }

    impl SubscriptionCallback for Recorder {
        fn on_data_change(&self, change: DataChange) {
            self.changes.lock().push(change);
        }

        fn on_keep_alive(&self) {
            self.keep_alives.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn writer() -> DataSetWriterConfig {
        let mut item = PublishedItem::new("ns=2;s=Temp");
        item.display_name = Some("Temp".into());
        DataSetWriterConfig::new(
            "w1",
            1,
            ConnectionModel::new("opc.tcp://plc:4840"),
            vec![item],
        )
    }

    #[test]
    fn test_mock_push_and_key_frame() {
        let client = MockSubscriptionClient::new();
        let recorder = Arc::new(Recorder::default());
        let sub = client
            .create_subscription(&writer(), recorder.clone())
            .unwrap();

        assert!(client.push("w1", &[("ns=2;s=Temp", serde_json::json!(21.5))]));
        assert!(client.push("w1", &[("ns=2;s=Temp", serde_json::json!(22.0))]));
        assert!(!client.push("unknown", &[]));

        let changes = recorder.changes.lock();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].notifications[0].field_name, "Temp");
        assert_eq!(changes[1].notifications[0].sequence_number, 2);
        drop(changes);

        let snapshot = sub.key_frame().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].value.value, serde_json::json!(22.0));
    }

    #[test]
    fn test_mock_close_stops_delivery() {
        let client = MockSubscriptionClient::new();
        let recorder = Arc::new(Recorder::default());
        let sub = client
            .create_subscription(&writer(), recorder.clone())
            .unwrap();
        sub.close();
        assert!(!client.push("w1", &[("ns=2;s=Temp", serde_json::json!(1))]));
        assert!(client.open_writers().is_empty());
        assert!(recorder.changes.lock().is_empty());
    }

    #[test]
    fn test_mock_metadata_follows_version() {
        let client = MockSubscriptionClient::new();
        let recorder = Arc::new(Recorder::default());
        let sub = client
            .create_subscription(&writer(), recorder.clone())
            .unwrap();
        assert_eq!(sub.metadata().unwrap().version, MetaDataVersion::new(1, 0));

        client
            .subscription("w1")
            .unwrap()
            .push(&[("ns=2;s=Temp", serde_json::json!(1))], Some(MetaDataVersion::new(1, 3)));
        let metadata = sub.metadata().unwrap();
        assert_eq!(metadata.version, MetaDataVersion::new(1, 3));
        assert_eq!(metadata.fields[0].name, "Temp");
    }

    #[test]
    fn test_mock_create_failure() {
        let client = MockSubscriptionClient::new();
        client.set_fail_create(true);
        let result = client.create_subscription(&writer(), Arc::new(Recorder::default()));
        assert!(matches!(result, Err(SourceError::Connection(_))));
        assert_eq!(client.created_count(), 0);
    }

    #[tokio::test]
    async fn test_simulated_client_publishes() {
        let client = SimulatedSubscriptionClient::new();
        let recorder = Arc::new(Recorder::default());
        let mut config = writer();
        config.publishing_interval_ms = 10;
        let sub = client.create_subscription(&config, recorder.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        sub.close();
        assert!(!recorder.changes.lock().is_empty());
    }

    #[test]
    fn test_simulated_client_requires_runtime() {
        let client = SimulatedSubscriptionClient::new();
        let result = client.create_subscription(&writer(), Arc::new(Recorder::default()));
        assert!(matches!(result, Err(SourceError::NoRuntime)));
    }
}
