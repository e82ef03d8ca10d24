// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Published nodes file watcher.
//!
//! Polls the file's modification time and length and asks the reconciler to
//! reload when either changes. A file that disappears clears the
//! configuration; a file that reappears is loaded again.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use telepub_orchestrator::{JobConverter, PublishedNodesReconciler, PublishedNodesWatcher};
//!
//! let reconciler = Arc::new(PublishedNodesReconciler::new(
//!     "publishednodes.json",
//!     JobConverter::new(Default::default()),
//! ));
//! reconciler.refresh_from_file();
//!
//! let mut watcher = PublishedNodesWatcher::new(reconciler, Duration::from_secs(1));
//! watcher.start().unwrap();
//! // ...
//! watcher.stop();
//! ```

use crate::reconciler::{PublishedNodesReconciler, ReloadOutcome};
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

/// What the watcher compares between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

/// Background watcher driving [`PublishedNodesReconciler::refresh_from_file`].
pub struct PublishedNodesWatcher {
    reconciler: Arc<PublishedNodesReconciler>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    /// Outcome of the last reload triggered by the watcher.
    last_outcome: Arc<Mutex<Option<ReloadOutcome>>>,
}

impl PublishedNodesWatcher {
    /// Create a watcher (not yet started).
    pub fn new(reconciler: Arc<PublishedNodesReconciler>, poll_interval: Duration) -> Self {
        Self {
            reconciler,
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            last_outcome: Arc::new(Mutex::new(None)),
        }
    }

    /// Start polling in a background thread.
    ///
    /// Fails if the watcher is already running or the file does not exist.
    pub fn start(&mut self) -> Result<(), String> {
        if self.running.load(Ordering::SeqCst) {
            return Err("Watcher is already running".to_string());
        }
        let path = self.reconciler.path().to_path_buf();
        if !path.exists() {
            return Err(format!("File not found: {}", path.display()));
        }

        self.running.store(true, Ordering::SeqCst);

        let reconciler = self.reconciler.clone();
        let poll_interval = self.poll_interval;
        let running = self.running.clone();
        let last_outcome = self.last_outcome.clone();
        let initial = stamp(&path);

        let handle = thread::Builder::new()
            .name("telepub-nodes-watcher".to_string())
            .spawn(move || {
                let mut last = initial;

                while running.load(Ordering::SeqCst) {
                    thread::sleep(poll_interval);
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }

                    let current = stamp(&path);
                    if current == last {
                        continue;
                    }
                    let previous = last;
                    last = current;

                    let outcome = match (previous, current) {
                        (Some(_), None) => {
                            reconciler.on_file_deleted();
                            ReloadOutcome::Cleared
                        }
                        (_, Some(_)) => reconciler.refresh_from_file(),
                        (None, None) => continue,
                    };
                    tracing::debug!(file = %path.display(), ?outcome, "Published nodes file change handled");
                    *last_outcome.lock() = Some(outcome);
                }
            })
            .map_err(|e| format!("Failed to spawn watcher thread: {}", e))?;

        self.thread = Some(handle);
        Ok(())
    }

    /// Signal the thread to stop and wait for it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Outcome of the last reload, `None` before the first change.
    pub fn last_outcome(&self) -> Option<ReloadOutcome> {
        *self.last_outcome.lock()
    }
}

impl Drop for PublishedNodesWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// File stamp, `None` if the file is gone or unreadable.
fn stamp(path: &Path) -> Option<FileStamp> {
    fs::metadata(path).ok().map(|m| FileStamp {
        modified: m.modified().ok(),
        len: m.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::JobConverter;
    use std::path::PathBuf;
    use telepub::EngineConfig;
    use tempfile::TempDir;

    const ONE_NODE: &str = r#"[{ "EndpointUrl": "opc.tcp://a:4840", "OpcNodes": [ { "Id": "i=1" } ] }]"#;
    const TWO_NODES: &str =
        r#"[{ "EndpointUrl": "opc.tcp://a:4840", "OpcNodes": [ { "Id": "i=1" }, { "Id": "i=2" } ] }]"#;

    fn reconciler(path: &Path) -> Arc<PublishedNodesReconciler> {
        Arc::new(
            PublishedNodesReconciler::new(path, JobConverter::new(EngineConfig::default()))
                .retry_delay(Duration::from_millis(1)),
        )
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_watcher_create() {
        let watcher = PublishedNodesWatcher::new(
            reconciler(Path::new("/tmp/nonexistent.json")),
            Duration::from_millis(100),
        );
        assert!(!watcher.is_running());
        assert!(watcher.last_outcome().is_none());
    }

    #[test]
    fn test_watcher_start_nonexistent_file() {
        let mut watcher = PublishedNodesWatcher::new(
            reconciler(Path::new("/tmp/definitely_not_a_real_file_12345.json")),
            Duration::from_millis(100),
        );
        assert!(watcher.start().is_err());
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_watcher_double_start_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pn.json");
        fs::write(&path, ONE_NODE).unwrap();

        let mut watcher = PublishedNodesWatcher::new(reconciler(&path), Duration::from_millis(50));
        watcher.start().expect("first start");
        assert!(watcher.start().is_err());
        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_watcher_reloads_on_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pn.json");
        fs::write(&path, ONE_NODE).unwrap();
        let reconciler = reconciler(&path);
        reconciler.refresh_from_file();

        let mut watcher = PublishedNodesWatcher::new(reconciler.clone(), Duration::from_millis(20));
        watcher.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        fs::write(&path, TWO_NODES).unwrap();
        assert!(wait_for(|| reconciler
            .entries()
            .first()
            .map_or(false, |e| e.opc_nodes().len() == 2)));
        assert!(wait_for(|| watcher.last_outcome() == Some(ReloadOutcome::Reloaded { jobs: 1 })));
        watcher.stop();
    }

    #[test]
    fn test_watcher_clears_on_delete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pn.json");
        fs::write(&path, ONE_NODE).unwrap();
        let reconciler = reconciler(&path);
        reconciler.refresh_from_file();
        assert_eq!(reconciler.job_count(), 1);

        let mut watcher = PublishedNodesWatcher::new(reconciler.clone(), Duration::from_millis(20));
        watcher.start().unwrap();

        fs::remove_file(&path).unwrap();
        assert!(wait_for(|| reconciler.job_count() == 0));

        fs::write(&path, TWO_NODES).unwrap();
        assert!(wait_for(|| reconciler.job_count() == 1));
        watcher.stop();
    }

    #[test]
    fn test_watcher_drop_stops_thread() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pn.json");
        fs::write(&path, ONE_NODE).unwrap();

        let running_flag;
        {
            let mut watcher = PublishedNodesWatcher::new(reconciler(&path), Duration::from_millis(50));
            watcher.start().unwrap();
            running_flag = watcher.running.clone();
            assert!(running_flag.load(Ordering::SeqCst));
        }
        assert!(!running_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stamp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pn.json");
        assert!(stamp(&path).is_none());
        fs::write(&path, ONE_NODE).unwrap();
        assert_eq!(stamp(&path).map(|s| s.len), Some(ONE_NODE.len() as u64));
        assert!(stamp(&PathBuf::from("/tmp/this_file_does_not_exist_xyz.json")).is_none());
    }
}
