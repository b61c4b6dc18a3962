// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Outbound message transport.
//!
//! Protocol code never dials sockets itself; it sends through the
//! [`Transport`] trait. Production nodes use [`TcpTransport`]; tests and
//! in-process simulations wire a cluster together with a [`MemoryHub`].
//! Both stamp a fresh request identifier on every send.

use crate::error::{Result, WireError};
use crate::message::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// Dial timeout for outbound connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Unary outbound send. One message per connection; no retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: &str, msg: Message) -> Result<()>;
}

/// TCP transport: dial with a fixed timeout, write one JSON frame, close.
pub struct TcpTransport {
    dial_timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { dial_timeout: DIAL_TIMEOUT }
    }

    pub fn with_dial_timeout(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, target: &str, mut msg: Message) -> Result<()> {
        msg.stamp_request_id();
        debug!(req_id = %msg.uuid, target, "dialing peer");

        let mut stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| WireError::DialTimeout {
                target: target.to_string(),
                timeout_ms: self.dial_timeout.as_millis() as u64,
            })??;

        let frame = msg.encode()?;
        stream.write_all(&frame).await?;
        stream.shutdown().await?;

        debug!(
            msg_direction = "outgoing",
            req_id = %msg.uuid,
            src_uid = msg.src_uid,
            msg_type = %msg.msg_type,
            payload = %msg.payload,
            target,
            "sent"
        );
        Ok(())
    }
}

/// In-process message fabric.
///
/// Peers register a connect string and receive everything sent to it through
/// an unbounded queue. Used by the scenario tests and by single-process
/// cluster simulations; delivery is immediate and never lossy, which makes
/// protocol runs deterministic given a message order.
#[derive(Clone, Default)]
pub struct MemoryHub {
    routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr` and return the inbound queue for the peer behind it.
    /// Re-registering an address replaces the previous route.
    pub fn register(&self, addr: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(addr.to_string(), tx);
        rx
    }

    /// Transport handle that routes into this hub.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport { hub: self.clone() })
    }
}

struct MemoryTransport {
    hub: MemoryHub,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, target: &str, mut msg: Message) -> Result<()> {
        msg.stamp_request_id();
        let tx = self
            .hub
            .routes
            .lock()
            .get(target)
            .cloned()
            .ok_or_else(|| WireError::Unroutable(target.to_string()))?;
        tx.send(msg)
            .map_err(|_| WireError::PeerGone(target.to_string()))
    }
}
