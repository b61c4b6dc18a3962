// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Lamport primitives: the scalar logical clock and the mutual-exclusion
//! request queue. Both are thread-safe behind a single mutex each.

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Scalar Lamport clock.
///
/// Provides a total order consistent with causal order across all protocol
/// messages that carry a timestamp field.
#[derive(Debug, Default)]
pub struct LamportClock {
    lc: Mutex<u64>,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by one and return the new value.
    pub fn tick(&self) -> u64 {
        let mut lc = self.lc.lock();
        *lc += 1;
        debug!(lc = *lc, "lamport clock tick");
        *lc
    }

    /// Fold an observed timestamp into the clock: if `ts >= clock`, the
    /// clock jumps to `ts + 1`. Older timestamps are a no-op.
    pub fn observe(&self, ts: u64) {
        let mut lc = self.lc.lock();
        if ts >= *lc {
            *lc = ts + 1;
            debug!(lc = *lc, "lamport clock observed event");
        }
    }

    /// Current value without advancing.
    pub fn now(&self) -> u64 {
        *self.lc.lock()
    }
}

/// Error returned when a timestamp is offered to the queue twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timestamp {0} already in mutex queue, duplicate request?")]
pub struct DuplicateTimestamp(pub u64);

/// Priority queue of outstanding lock requests, ordered by
/// `(timestamp, uid)` lexicographically.
///
/// Timestamps are unique within the queue; inserting a duplicate is
/// rejected. The head of the queue is the request currently entitled to the
/// critical section.
#[derive(Debug, Default)]
pub struct LamportQueue {
    entries: Mutex<Vec<(u64, u32)>>,
}

impl LamportQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request. Returns whether the request became the new head.
    pub fn add(&self, ts: u64, uid: u32) -> Result<bool, DuplicateTimestamp> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|&(queued, _)| queued == ts) {
            return Err(DuplicateTimestamp(ts));
        }
        entries.push((ts, uid));
        entries.sort_unstable();
        debug!(ts, uid, queue = ?entries, "lock request queued");
        Ok(entries[0] == (ts, uid))
    }

    /// Head of the queue without removing it.
    pub fn peek(&self) -> Option<(u64, u32)> {
        self.entries.lock().first().copied()
    }

    /// Remove and return the head of the queue.
    pub fn pop(&self) -> Option<(u64, u32)> {
        let mut entries = self.entries.lock();
        if entries.is_empty() {
            return None;
        }
        let head = entries.remove(0);
        debug!(ts = head.0, uid = head.1, "lock request released");
        Some(head)
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
