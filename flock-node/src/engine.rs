// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! The routing engine.
//!
//! A single consumer reads the inbound FIFO and routes each message to the
//! extension registered for its type. Handlers run serially in FIFO order,
//! so extension state sees one inbound message at a time; only the
//! extensions' own worker tasks run alongside, and they synchronise on the
//! extension's state lock.

use crate::error::{ProtocolError, Result};
use async_trait::async_trait;
use flock_topology::Neighbourhood;
use flock_wire::{Message, MessageType, ShutdownSignal, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Everything an extension needs to act on behalf of its node: identity,
/// topology, the outbound transport and the node-wide shutdown signal.
pub struct NodeContext {
    pub uid: u32,
    pub neighbourhood: Arc<Neighbourhood>,
    pub transport: Arc<dyn Transport>,
    pub shutdown: ShutdownSignal,
}

impl NodeContext {
    pub fn new(
        uid: u32,
        neighbourhood: Arc<Neighbourhood>,
        transport: Arc<dyn Transport>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            uid,
            neighbourhood,
            transport,
            shutdown,
        }
    }

    /// Send to a neighbour by UID.
    pub async fn send_to(&self, uid: u32, msg: Message) -> Result<()> {
        let addr = self
            .neighbourhood
            .connect(uid)
            .ok_or(ProtocolError::UnknownPeer(uid))?;
        self.transport.send(addr, msg).await?;
        Ok(())
    }

    /// Send to a neighbour, logging instead of propagating failures. The
    /// network is lossy by assumption; callers that flood or broadcast use
    /// this and carry on.
    pub async fn send_or_log(&self, uid: u32, msg: Message) {
        if let Err(err) = self.send_to(uid, msg).await {
            warn!(uid = self.uid, peer = uid, error = %err, "send failed");
        }
    }

    /// Sleep for `duration` unless shutdown fires first. Returns false on
    /// shutdown; worker loops use this as their exit condition.
    pub async fn sleep_unless_shutdown(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.triggered() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Send the same message to every direct neighbour.
    pub async fn broadcast(&self, msg: &Message) -> usize {
        let mut total = 0;
        let peers: Vec<u32> = self.neighbourhood.neighbours().map(|(uid, _)| uid).collect();
        for peer in peers {
            self.send_or_log(peer, msg.clone()).await;
            total += 1;
        }
        total
    }
}

/// A protocol extension: an independent state machine keyed by message type.
///
/// `handle` is invoked serially from the engine loop. `preflight` runs once
/// before the engine starts and may spawn long-running worker tasks; workers
/// communicate with the rest of the cluster only by sending messages.
#[async_trait]
pub trait Extension: Send + Sync {
    /// The message type this extension consumes.
    fn message_type(&self) -> MessageType;

    /// Spawn background workers. Default: nothing to do.
    async fn preflight(&self, ctx: Arc<NodeContext>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Handle one inbound message.
    async fn handle(&self, ctx: &NodeContext, msg: &Message) -> Result<()>;
}

/// Message router for one node.
pub struct Engine {
    ctx: Arc<NodeContext>,
    extensions: HashMap<MessageType, Arc<dyn Extension>>,
}

impl Engine {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            ctx,
            extensions: HashMap::new(),
        }
    }

    /// Shared handle on the node context, for wiring workers and tests.
    pub fn context(&self) -> Arc<NodeContext> {
        Arc::clone(&self.ctx)
    }

    /// Register an extension. Not hot-swappable: registration happens before
    /// `run`, and a later registration for the same type replaces the
    /// earlier one.
    pub fn register(&mut self, extension: Arc<dyn Extension>) {
        let msg_type = extension.message_type();
        if self.extensions.insert(msg_type, extension).is_some() {
            warn!(uid = self.ctx.uid, %msg_type, "extension replaced");
        }
    }

    /// Run every extension's preflight, spawning their workers.
    pub async fn preflight(&self) -> Result<()> {
        for extension in self.extensions.values() {
            extension.preflight(Arc::clone(&self.ctx)).await?;
        }
        Ok(())
    }

    /// Consume the inbound FIFO until shutdown. Handler errors are logged
    /// and never abort the node.
    pub async fn run(self, mut rx: mpsc::Receiver<Message>) {
        info!(uid = self.ctx.uid, "starting node engine");
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.triggered() => break,
                inbound = rx.recv() => match inbound {
                    Some(msg) => self.dispatch(&msg).await,
                    None => break,
                },
            }
        }
        info!(uid = self.ctx.uid, "node shutdown complete");
    }

    async fn dispatch(&self, msg: &Message) {
        info!(
            msg_direction = "incoming",
            uid = self.ctx.uid,
            req_id = %msg.uuid,
            src_uid = msg.src_uid,
            msg_type = %msg.msg_type,
            payload = %msg.payload,
            "<<<"
        );

        let Some(extension) = self.extensions.get(&msg.msg_type) else {
            warn!(
                uid = self.ctx.uid,
                msg_type = %msg.msg_type,
                req_id = %msg.uuid,
                "no extension registered for message type"
            );
            return;
        };

        debug!(uid = self.ctx.uid, req_id = %msg.uuid, "dispatching");
        if let Err(err) = extension.handle(&self.ctx, msg).await {
            error!(
                uid = self.ctx.uid,
                req_id = %msg.uuid,
                error = %err,
                "failed handling incoming message"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_topology::ClusterConfig;
    use flock_wire::MemoryHub;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Recorder {
        msg_type: MessageType,
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Extension for Recorder {
        fn message_type(&self) -> MessageType {
            self.msg_type
        }

        async fn handle(&self, _ctx: &NodeContext, msg: &Message) -> Result<()> {
            self.seen.lock().push(msg.payload.clone());
            if self.fail {
                return Err(ProtocolError::invariant("recorder set to fail"));
            }
            Ok(())
        }
    }

    fn test_context() -> Arc<NodeContext> {
        let config = ClusterConfig::parse("1 a:1\n2 a:2\n").unwrap();
        let neighbourhood = Arc::new(Neighbourhood::from_config(1, &config).unwrap());
        let hub = MemoryHub::new();
        Arc::new(NodeContext::new(
            1,
            neighbourhood,
            hub.transport(),
            ShutdownSignal::new(),
        ))
    }

    #[tokio::test]
    async fn routes_by_message_type_and_survives_handler_errors() {
        let ctx = test_context();
        let mut engine = Engine::new(Arc::clone(&ctx));
        let rumor = Arc::new(Recorder {
            msg_type: MessageType::Rumor,
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let control = Arc::new(Recorder {
            msg_type: MessageType::Control,
            seen: Mutex::new(Vec::new()),
            fail: false,
        });
        engine.register(rumor.clone());
        engine.register(control.clone());

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(engine.run(rx));

        // The failing rumor handler must not stop the engine.
        tx.send(Message::new(2, MessageType::Rumor, "1;a")).await.unwrap();
        tx.send(Message::new(2, MessageType::Banking, "marker;x")).await.unwrap();
        tx.send(Message::new(2, MessageType::Control, "STARTUP")).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("engine exits when channel closes")
            .unwrap();

        assert_eq!(*rumor.seen.lock(), vec!["1;a".to_string()]);
        assert_eq!(*control.seen.lock(), vec!["STARTUP".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_stops_the_engine() {
        let ctx = test_context();
        let shutdown = ctx.shutdown.clone();
        let engine = Engine::new(ctx);
        let (_tx, rx) = mpsc::channel::<Message>(1);
        let handle = tokio::spawn(engine.run(rx));

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("engine exits on shutdown")
            .unwrap();
    }
}
