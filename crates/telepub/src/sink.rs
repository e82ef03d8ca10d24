// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message sink and upstream transports.
//!
//! The sink hands encoded messages to a [`Transport`] and keeps delivery
//! statistics. It never retries and never propagates transport failures.

use crate::message::WireMessage;
use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Counters are reset once they reach this value.
pub const SENT_RESET_THRESHOLD: u64 = u64::MAX - 10_000;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Transport closed")]
    Closed,
}

/// Upstream message transport.
pub trait Transport: Send + Sync {
    /// Deliver messages, all or nothing.
    fn send(&self, messages: &[WireMessage]) -> Result<(), TransportError>;

    /// Largest message the transport accepts (0 = no limit).
    fn max_message_size(&self) -> usize {
        0
    }

    /// Transport name for logs.
    fn name(&self) -> &str;
}

/// Sink delivery statistics.
#[derive(Debug, Default)]
pub struct SinkStats {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub bytes: AtomicU64,
}

impl SinkStats {
    pub fn snapshot(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            sent_count: self.sent.load(Ordering::Relaxed),
            failed_count: self.failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sink statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkStatsSnapshot {
    pub sent_count: u64,
    pub failed_count: u64,
    pub bytes_sent: u64,
}

/// Delivers wire messages to a transport.
pub struct MessageSink {
    transport: Arc<dyn Transport>,
    stats: SinkStats,
}

impl MessageSink {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            stats: SinkStats::default(),
        }
    }

    /// Largest message the transport accepts (0 = no limit).
    pub fn max_message_size(&self) -> usize {
        self.transport.max_message_size()
    }

    /// Send one message. Returns whether delivery succeeded.
    pub fn send(&self, message: WireMessage) -> bool {
        self.send_batch(std::slice::from_ref(&message))
    }

    /// Send messages in one transport call. Returns whether delivery succeeded.
    pub fn send_batch(&self, messages: &[WireMessage]) -> bool {
        if messages.is_empty() {
            return true;
        }
        match self.transport.send(messages) {
            Ok(()) => {
                let bytes: u64 = messages.iter().map(|m| m.size() as u64).sum();
                self.stats.bytes.fetch_add(bytes, Ordering::Relaxed);
                self.record_sent(messages.len() as u64);
                true
            }
            Err(e) => {
                self.stats
                    .failed
                    .fetch_add(messages.len() as u64, Ordering::Relaxed);
                tracing::error!(
                    transport = self.transport.name(),
                    "Failed to send {} message(s): {}",
                    messages.len(),
                    e
                );
                false
            }
        }
    }

    fn record_sent(&self, count: u64) {
        let sent = self.stats.sent.fetch_add(count, Ordering::Relaxed) + count;
        if sent >= SENT_RESET_THRESHOLD {
            self.stats.sent.store(0, Ordering::Relaxed);
            tracing::info!(
                transport = self.transport.name(),
                "Sent message counter reached its limit and was reset"
            );
        }
    }

    pub fn stats(&self) -> SinkStatsSnapshot {
        self.stats.snapshot()
    }
}

// ============================================================================
// Transports
// ============================================================================

/// Appends messages to a file as length-prefixed records:
/// `len (u32 LE) | body`.
pub struct FileTransport {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileTransport {
    /// Open (or create) `path` for appending.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Transport for FileTransport {
    fn send(&self, messages: &[WireMessage]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock();
        for message in messages {
            if message.size() > u32::MAX as usize {
                return Err(TransportError::Rejected(format!(
                    "message {} too large ({} bytes)",
                    message.message_id,
                    message.size()
                )));
            }
            writer.write_u32::<LittleEndian>(message.size() as u32)?;
            writer.write_all(&message.body)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Logs every message at debug level and discards it.
#[derive(Debug, Default)]
pub struct LogTransport;

impl Transport for LogTransport {
    fn send(&self, messages: &[WireMessage]) -> Result<(), TransportError> {
        for message in messages {
            tracing::debug!(
                message_id = %message.message_id,
                content_type = message.content_type,
                bytes = message.size(),
                notifications = message.notification_count,
                "Message published"
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Records every delivered message.
#[derive(Default)]
pub struct MockTransport {
    messages: Mutex<Vec<WireMessage>>,
    calls: AtomicU64,
    fail: AtomicBool,
    max_message_size: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport advertising a message size limit.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            ..Self::default()
        }
    }

    /// Make subsequent sends fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Messages delivered so far.
    pub fn messages(&self) -> Vec<WireMessage> {
        self.messages.lock().clone()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().len()
    }

    /// Number of `send` calls, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn send(&self, messages: &[WireMessage]) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("mock failure".into()));
        }
        self.messages.lock().extend_from_slice(messages);
        Ok(())
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn name(&self) -> &str {
        "mock"
    }
}
