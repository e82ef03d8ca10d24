// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Writer group subscription source.
//!
//! Turns raw subscription events into [`NotificationBatch`]es:
//!
//! - assigns per-writer sequence numbers (data and metadata counted separately)
//! - substitutes key frames every N deltas or on a key frame interval
//! - emits metadata on an interval and whenever the schema version changes
//! - keeps value/data change totals and one-minute rates
//!
//! Batches are delivered to registered [`SourceListener`]s. Registration
//! returns a guard; dropping it (or closing the source) unregisters.

use crate::client::{
    DataChange, SourceError, Subscription, SubscriptionCallback, SubscriptionClient,
};
use crate::message::{MessageType, MetaDataVersion, Notification, NotificationBatch, SequenceNumber};
use crate::model::{DataSetWriterConfig, WriterGroupConfig};
use crate::rate::RateCounter;
use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Totals are reset once either reaches this value.
pub const COUNTER_RESET_THRESHOLD: u64 = u64::MAX - 10_000;

/// Receives batches produced by a [`WriterGroupSource`].
pub trait SourceListener: Send + Sync {
    /// Called for every emitted batch, in emission order per writer.
    fn on_message(&self, batch: NotificationBatch);

    /// Called after the change counters were reset.
    fn on_counter_reset(&self) {}
}

#[derive(Default)]
struct ListenerSet {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Arc<dyn SourceListener>)>>,
}

impl ListenerSet {
    fn snapshot(&self) -> Vec<Arc<dyn SourceListener>> {
        self.entries.read().iter().map(|(_, l)| l.clone()).collect()
    }

    fn emit(&self, batch: NotificationBatch) {
        let listeners = self.snapshot();
        if let Some((last, rest)) = listeners.split_last() {
            for listener in rest {
                listener.on_message(batch.clone());
            }
            last.on_message(batch);
        }
    }

    fn counter_reset(&self) {
        for listener in self.snapshot() {
            listener.on_counter_reset();
        }
    }

    fn remove(&self, id: u64) {
        self.entries.write().retain(|(entry, _)| *entry != id);
    }
}

/// Keeps a listener registered until dropped.
#[must_use = "dropping the registration unsubscribes the listener"]
pub struct ListenerRegistration {
    id: u64,
    set: Weak<ListenerSet>,
}

impl ListenerRegistration {
    /// Unregister now.
    pub fn unsubscribe(self) {}
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.remove(self.id);
        }
    }
}

/// Value and data change totals with one-minute rates.
#[derive(Debug, Clone, Default)]
struct ChangeCounters {
    value_changes: u64,
    data_changes: u64,
    value_rate: RateCounter,
    data_rate: RateCounter,
}

impl ChangeCounters {
    /// Record one data change carrying `values` notifications.
    /// Returns `true` when the totals were reset.
    fn record(&mut self, values: u64, now: i64) -> bool {
        self.value_changes = self.value_changes.saturating_add(values);
        self.data_changes = self.data_changes.saturating_add(1);
        self.value_rate.increment_at(values, now);
        self.data_rate.increment_at(1, now);

        if self.value_changes >= COUNTER_RESET_THRESHOLD
            || self.data_changes >= COUNTER_RESET_THRESHOLD
        {
            self.value_changes = 0;
            self.data_changes = 0;
            return true;
        }
        false
    }

    fn snapshot(&mut self, now: i64) -> SourceCountersSnapshot {
        SourceCountersSnapshot {
            value_changes: self.value_changes,
            data_changes: self.data_changes,
            value_changes_last_minute: self.value_rate.last_minute_at(now),
            data_changes_last_minute: self.data_rate.last_minute_at(now),
        }
    }
}

/// Snapshot of the source counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCountersSnapshot {
    pub value_changes: u64,
    pub data_changes: u64,
    pub value_changes_last_minute: u64,
    pub data_changes_last_minute: u64,
}

struct SourceShared {
    writer_group_id: String,
    listeners: Arc<ListenerSet>,
    counters: Mutex<ChangeCounters>,
}

struct WriterState {
    data_seq: SequenceNumber,
    metadata_seq: SequenceNumber,
    frame_count: u64,
    last_metadata: Option<MetaDataVersion>,
    last_key_frame: Instant,
}

/// Per-writer state shared between the subscription callback and the timers.
struct WriterContext {
    shared: Arc<SourceShared>,
    config: RwLock<DataSetWriterConfig>,
    subscription: RwLock<Option<Arc<dyn Subscription>>>,
    state: Mutex<WriterState>,
    closed: AtomicBool,
}

impl WriterContext {
    fn new(shared: Arc<SourceShared>, config: DataSetWriterConfig) -> Self {
        Self {
            shared,
            config: RwLock::new(config),
            subscription: RwLock::new(None),
            state: Mutex::new(WriterState {
                data_seq: SequenceNumber::new(),
                metadata_seq: SequenceNumber::new(),
                frame_count: 0,
                last_metadata: None,
                last_key_frame: Instant::now(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    fn subscription(&self) -> Result<Arc<dyn Subscription>, SourceError> {
        self.subscription.read().clone().ok_or(SourceError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn batch(
        &self,
        sequence_number: u32,
        message_type: MessageType,
        notifications: Vec<Notification>,
        metadata_version: Option<MetaDataVersion>,
    ) -> NotificationBatch {
        let config = self.config.read();
        NotificationBatch {
            writer_id: config.writer_id.clone(),
            dataset_writer_id: config.dataset_writer_id,
            writer_group_id: self.shared.writer_group_id.clone(),
            endpoint_url: config.connection.endpoint_url.clone(),
            sequence_number,
            message_type,
            notifications,
            metadata: None,
            metadata_version,
            timestamp: Utc::now(),
            extension_fields: config.extension_fields.clone(),
        }
    }

    /// Fetch and emit the data set metadata. Unless `force`d, nothing is sent
    /// when the version equals the last one sent.
    fn emit_metadata(&self, state: &mut WriterState, force: bool) -> Result<bool, SourceError> {
        let metadata = self.subscription()?.metadata()?;
        if !force && state.last_metadata == Some(metadata.version) {
            return Ok(false);
        }
        state.last_metadata = Some(metadata.version);
        let sequence = state.metadata_seq.next();
        let mut batch = self.batch(
            sequence,
            MessageType::Metadata,
            Vec::new(),
            Some(metadata.version),
        );
        batch.metadata = Some(metadata);
        self.shared.listeners.emit(batch);
        Ok(true)
    }

    /// Fetch a full snapshot and emit it as a key frame.
    fn emit_key_frame(&self, state: &mut WriterState) -> Result<bool, SourceError> {
        state.last_key_frame = Instant::now();
        let snapshot = self.subscription()?.key_frame()?;
        if snapshot.is_empty() {
            return Ok(false);
        }
        let sequence = state.data_seq.next();
        let batch = self.batch(sequence, MessageType::KeyFrame, snapshot, state.last_metadata);
        self.shared.listeners.emit(batch);
        Ok(true)
    }
}

impl SubscriptionCallback for WriterContext {
    fn on_data_change(&self, change: DataChange) {
        if self.is_closed() {
            return;
        }

        let reset = self
            .shared
            .counters
            .lock()
            .record(change.notifications.len() as u64, Utc::now().timestamp());
        if reset {
            tracing::info!(
                writer_group = %self.shared.writer_group_id,
                "Change counters reached their limit and were reset"
            );
            self.shared.listeners.counter_reset();
        }

        let mut state = self.state.lock();

        if let Some(version) = change.metadata_version {
            if state.last_metadata != Some(version) {
                if let Err(e) = self.emit_metadata(&mut state, false) {
                    tracing::warn!(
                        writer_group = %self.shared.writer_group_id,
                        "Failed to emit metadata for version {}.{}: {}",
                        version.major,
                        version.minor,
                        e
                    );
                }
            }
        }

        let key_frame_count = u64::from(self.config.read().key_frame_count);
        state.frame_count = state.frame_count.wrapping_add(1);
        if key_frame_count > 0 && state.frame_count % key_frame_count == 0 {
            match self.emit_key_frame(&mut state) {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => tracing::debug!("Key frame unavailable, sending delta: {}", e),
            }
        }

        let sequence = state.data_seq.next();
        let version = change.metadata_version.or(state.last_metadata);
        let batch = self.batch(sequence, MessageType::DeltaFrame, change.notifications, version);
        self.shared.listeners.emit(batch);
    }

    fn on_keep_alive(&self) {
        if self.is_closed() || !self.config.read().send_keep_alive {
            return;
        }
        let mut state = self.state.lock();
        let sequence = state.data_seq.next();
        let batch = self.batch(
            sequence,
            MessageType::KeepAlive,
            Vec::new(),
            state.last_metadata,
        );
        self.shared.listeners.emit(batch);
    }
}

async fn key_frame_timer(ctx: Arc<WriterContext>, period: Duration, token: CancellationToken) {
    loop {
        let due = ctx.state.lock().last_key_frame + period;
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep_until(due) => {}
        }

        let mut state = ctx.state.lock();
        // Re-armed by a count triggered key frame in the meantime.
        if state.last_key_frame + period > Instant::now() {
            continue;
        }
        if let Err(e) = ctx.emit_key_frame(&mut state) {
            tracing::debug!("Key frame push failed, retrying next tick: {}", e);
        }
    }
}

async fn metadata_timer(ctx: Arc<WriterContext>, period: Duration, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }

        let mut state = ctx.state.lock();
        if let Err(e) = ctx.emit_metadata(&mut state, true) {
            tracing::warn!(
                writer_group = %ctx.shared.writer_group_id,
                "Metadata push failed, retrying next tick: {}",
                e
            );
        }
    }
}

/// One open writer: its subscription and its timers.
struct WriterHandle {
    ctx: Arc<WriterContext>,
    timers: CancellationToken,
}

impl WriterHandle {
    fn open(
        shared: &Arc<SourceShared>,
        config: &DataSetWriterConfig,
        client: &Arc<dyn SubscriptionClient>,
        runtime: &Handle,
        parent: &CancellationToken,
    ) -> Result<Self, SourceError> {
        let ctx = Arc::new(WriterContext::new(shared.clone(), config.clone()));
        let subscription = client.create_subscription(config, ctx.clone())?;
        *ctx.subscription.write() = Some(subscription);

        let handle = Self {
            ctx,
            timers: parent.child_token(),
        };
        handle.spawn_timers(config, runtime);
        tracing::debug!(writer = %config.writer_id, "Writer opened");
        Ok(handle)
    }

    fn spawn_timers(&self, config: &DataSetWriterConfig, runtime: &Handle) {
        if let Some(period) = config.key_frame_interval() {
            runtime.spawn(key_frame_timer(self.ctx.clone(), period, self.timers.clone()));
        }
        if let Some(period) = config.metadata_send_interval() {
            runtime.spawn(metadata_timer(self.ctx.clone(), period, self.timers.clone()));
        }
    }

    /// Apply a changed configuration in place.
    ///
    /// Returns `Ok(false)` when the configuration is unchanged.
    fn update(
        &mut self,
        config: &DataSetWriterConfig,
        runtime: &Handle,
        parent: &CancellationToken,
    ) -> Result<bool, SourceError> {
        let previous = self.ctx.config.read().clone();
        if previous == *config {
            return Ok(false);
        }

        self.ctx.subscription()?.apply(config)?;
        *self.ctx.config.write() = config.clone();
        // Key frame counting restarts with every applied change.
        self.ctx.state.lock().frame_count = 0;

        if previous.timers_differ(config) {
            self.timers.cancel();
            self.timers = parent.child_token();
            self.spawn_timers(config, runtime);
        }
        tracing::debug!(writer = %config.writer_id, "Writer updated");
        Ok(true)
    }

    fn close(&self) {
        self.ctx.closed.store(true, Ordering::SeqCst);
        self.timers.cancel();
        if let Some(subscription) = self.ctx.subscription.write().take() {
            subscription.close();
        }
    }
}

/// Subscription source of one writer group.
pub struct WriterGroupSource {
    shared: Arc<SourceShared>,
    client: Arc<dyn SubscriptionClient>,
    config: ArcSwap<WriterGroupConfig>,
    writers: Mutex<HashMap<String, WriterHandle>>,
    cancel: CancellationToken,
    opened: AtomicBool,
}

impl WriterGroupSource {
    /// Create a source (not yet opened).
    pub fn new(config: Arc<WriterGroupConfig>, client: Arc<dyn SubscriptionClient>) -> Self {
        Self {
            shared: Arc::new(SourceShared {
                writer_group_id: config.writer_group_id.clone(),
                listeners: Arc::new(ListenerSet::default()),
                counters: Mutex::new(ChangeCounters::default()),
            }),
            client,
            config: ArcSwap::new(config),
            writers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            opened: AtomicBool::new(false),
        }
    }

    /// Register a listener for emitted batches.
    pub fn subscribe(&self, listener: Arc<dyn SourceListener>) -> ListenerRegistration {
        let id = self.shared.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.listeners.entries.write().push((id, listener));
        ListenerRegistration {
            id,
            set: Arc::downgrade(&self.shared.listeners),
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.entries.read().len()
    }

    /// Open a subscription for every writer.
    ///
    /// Must be called from within a Tokio runtime. On failure the writers
    /// opened so far are closed again.
    pub fn open(&self) -> Result<(), SourceError> {
        let runtime = Handle::try_current().map_err(|_| SourceError::NoRuntime)?;
        if self.opened.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let config = self.config.load_full();
        let mut writers = self.writers.lock();
        for writer in &config.writers {
            match WriterHandle::open(&self.shared, writer, &self.client, &runtime, &self.cancel) {
                Ok(handle) => {
                    writers.insert(writer.writer_id.clone(), handle);
                }
                Err(e) => {
                    for (_, handle) in writers.drain() {
                        handle.close();
                    }
                    self.opened.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        tracing::info!(
            writer_group = %config.writer_group_id,
            writers = writers.len(),
            "Subscription source opened"
        );
        Ok(())
    }

    /// Switch to a new configuration, diffing writers by id.
    ///
    /// Removed writers are closed, changed ones updated in place (or
    /// recreated when their connection changed), new ones opened. Every
    /// writer is attempted; the first failure is returned and the previous
    /// configuration stays current, so applying the same configuration again
    /// retries the writers that failed. Unchanged writers are left alone.
    pub fn update(&self, config: Arc<WriterGroupConfig>) -> Result<(), SourceError> {
        if !self.opened.load(Ordering::SeqCst) {
            self.config.store(config);
            return Ok(());
        }
        let runtime = Handle::try_current().map_err(|_| SourceError::NoRuntime)?;

        let desired: HashSet<&str> = config.writers.iter().map(|w| w.writer_id.as_str()).collect();
        let mut writers = self.writers.lock();
        let mut first_error = None;

        writers.retain(|writer_id, handle| {
            let keep = desired.contains(writer_id.as_str());
            if !keep {
                handle.close();
                tracing::debug!(writer = %writer_id, "Writer removed");
            }
            keep
        });

        for writer in &config.writers {
            let same_connection = writers
                .get(&writer.writer_id)
                .map(|h| h.ctx.config.read().connection == writer.connection);

            let result = if same_connection == Some(true) {
                match writers.get_mut(&writer.writer_id) {
                    Some(handle) => handle.update(writer, &runtime, &self.cancel).map(|_| ()),
                    None => Ok(()),
                }
            } else {
                // New writer, or its connection changed: start over.
                if let Some(handle) = writers.remove(&writer.writer_id) {
                    handle.close();
                }
                WriterHandle::open(&self.shared, writer, &self.client, &runtime, &self.cancel)
                    .map(|h| {
                        writers.insert(writer.writer_id.clone(), h);
                    })
            };
            if let Err(e) = result {
                tracing::warn!(writer = %writer.writer_id, "Writer update failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        tracing::info!(
            writer_group = %config.writer_group_id,
            writers = writers.len(),
            "Subscription source updated"
        );
        self.config.store(config.clone());
        Ok(())
    }

    /// Close every writer and drop all listeners.
    pub fn close(&self) {
        self.cancel.cancel();
        for (_, handle) in self.writers.lock().drain() {
            handle.close();
        }
        self.shared.listeners.entries.write().clear();
        if self.opened.swap(false, Ordering::SeqCst) {
            tracing::info!(
                writer_group = %self.shared.writer_group_id,
                "Subscription source closed"
            );
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<WriterGroupConfig> {
        self.config.load_full()
    }

    /// Number of open writers.
    pub fn writer_count(&self) -> usize {
        self.writers.lock().len()
    }

    /// Change totals and rates.
    pub fn counters(&self) -> SourceCountersSnapshot {
        self.shared.counters.lock().snapshot(Utc::now().timestamp())
    }
}

impl Drop for WriterGroupSource {
    fn drop(&mut self) {
        self.close();
    }
}
