// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cooperative shutdown signal.
//!
//! One signal is shared by the dispatcher, the engine and every extension
//! worker. Triggering is idempotent; tasks observe the signal on their next
//! suspension point, so shutdown is best-effort and in-flight messages may
//! be lost.

use std::sync::Arc;
use tokio::sync::watch;

/// Clonable handle on the node-wide shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Trigger shutdown. Safe to call from any task, any number of times.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether shutdown has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is triggered.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // All senders gone counts as shutdown.
                return;
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
