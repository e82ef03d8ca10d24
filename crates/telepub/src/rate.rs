// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-minute rate counters.
//!
//! A ring of 60 one-second buckets indexed by `unix_seconds % 60`. Buckets
//! skipped since the last write are zeroed lazily on the next access, so the
//! sum always covers the trailing 60 seconds only.

use chrono::Utc;

const BUCKETS: usize = 60;

/// Sliding one-minute counter.
#[derive(Debug, Clone)]
pub struct RateCounter {
    buckets: [u64; BUCKETS],
    last_write: Option<i64>,
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateCounter {
    pub fn new() -> Self {
        Self {
            buckets: [0; BUCKETS],
            last_write: None,
        }
    }

    /// Add `delta` at the current wall clock second.
    pub fn increment(&mut self, delta: u64) {
        self.increment_at(delta, Utc::now().timestamp());
    }

    /// Add `delta` at `now` (unix seconds).
    pub fn increment_at(&mut self, delta: u64, now: i64) {
        self.sweep(now);
        let index = bucket_index(now);
        self.buckets[index] = self.buckets[index].saturating_add(delta);
    }

    /// Sum over the trailing minute ending now.
    pub fn last_minute(&mut self) -> u64 {
        self.last_minute_at(Utc::now().timestamp())
    }

    /// Sum over the trailing minute ending at `now` (unix seconds).
    pub fn last_minute_at(&mut self, now: i64) -> u64 {
        self.sweep(now);
        self.buckets.iter().fold(0u64, |acc, b| acc.saturating_add(*b))
    }

    /// Zero every bucket.
    pub fn clear(&mut self) {
        self.buckets = [0; BUCKETS];
        self.last_write = None;
    }

    fn sweep(&mut self, now: i64) {
        let Some(last) = self.last_write else {
            self.buckets = [0; BUCKETS];
            self.last_write = Some(now);
            return;
        };

        // Clock went backwards, nothing to expire.
        if now <= last {
            return;
        }

        let elapsed = now - last;
        if elapsed >= BUCKETS as i64 {
            self.buckets = [0; BUCKETS];
        } else {
            let from = bucket_index(last);
            for step in 1..=elapsed as usize {
                self.buckets[(from + step) % BUCKETS] = 0;
            }
        }
        self.last_write = Some(now);
    }
}

fn bucket_index(now: i64) -> usize {
    now.rem_euclid(BUCKETS as i64) as usize
}
