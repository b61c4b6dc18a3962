// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! The `CONTROL` extension: cluster startup, shutdown, and operator-driven
//! message distribution.

use crate::engine::{Extension, NodeContext};
use crate::error::Result;
use crate::payload::{ControlPayload, DiscoveryPayload};
use async_trait::async_trait;
use flock_wire::{Message, MessageType};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Handles `STARTUP`, `SHUTDOWN` and `DISTRIBUTE <type> <payload>`.
#[derive(Default)]
pub struct ControlExtension {
    started: AtomicBool,
}

impl ControlExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn startup(&self, ctx: &NodeContext) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(uid = ctx.uid, "node already started");
            return;
        }
        info!(uid = ctx.uid, "initiated node startup");

        let hello = Message::new(ctx.uid, MessageType::Discovery, DiscoveryPayload::Hello.to_string());
        let peers: Vec<u32> = ctx.neighbourhood.neighbours().map(|(uid, _)| uid).collect();
        for peer in peers {
            debug!(uid = ctx.uid, peer, "sending HELLO");
            ctx.send_or_log(peer, hello.clone()).await;
        }
    }

    async fn distribute(&self, ctx: &NodeContext, msg_type: MessageType, payload: String) {
        info!(uid = ctx.uid, %msg_type, payload, "distributing message to all neighbours");
        let msg = Message::new(ctx.uid, msg_type, payload);
        ctx.broadcast(&msg).await;
    }
}

#[async_trait]
impl Extension for ControlExtension {
    fn message_type(&self) -> MessageType {
        MessageType::Control
    }

    async fn handle(&self, ctx: &NodeContext, msg: &Message) -> Result<()> {
        debug!(uid = ctx.uid, req_id = %msg.uuid, "handling control message");
        match ControlPayload::parse(&msg.payload)? {
            ControlPayload::Startup => self.startup(ctx).await,
            ControlPayload::Shutdown => {
                info!(uid = ctx.uid, req_id = %msg.uuid, "initiated node shutdown");
                ctx.shutdown.trigger();
            }
            ControlPayload::Distribute { msg_type, payload } => {
                self.distribute(ctx, msg_type, payload).await
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_topology::{ClusterConfig, Neighbourhood};
    use flock_wire::{MemoryHub, ShutdownSignal};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn two_node_setup() -> (NodeContext, mpsc::UnboundedReceiver<Message>, ControlExtension) {
        let config = ClusterConfig::parse("1 a:1\n2 a:2\n").unwrap();
        let hub = MemoryHub::new();
        let peer_rx = hub.register("a:2");
        let ctx = NodeContext::new(
            1,
            Arc::new(Neighbourhood::from_config(1, &config).unwrap()),
            hub.transport(),
            ShutdownSignal::new(),
        );
        (ctx, peer_rx, ControlExtension::new())
    }

    #[tokio::test]
    async fn startup_sends_hello_to_every_neighbour_once() {
        let (ctx, mut peer_rx, control) = two_node_setup();

        let startup = Message::new(0, MessageType::Control, "STARTUP");
        control.handle(&ctx, &startup).await.unwrap();
        let hello = peer_rx.try_recv().unwrap();
        assert_eq!(hello.msg_type, MessageType::Discovery);
        assert_eq!(hello.payload, "HELLO");
        assert_eq!(hello.src_uid, 1);

        // Duplicate STARTUP is a no-op.
        control.handle(&ctx, &startup).await.unwrap();
        assert!(peer_rx.try_recv().is_err());
        assert!(control.is_started());
    }

    #[tokio::test]
    async fn shutdown_triggers_the_signal() {
        let (ctx, _peer_rx, control) = two_node_setup();
        control
            .handle(&ctx, &Message::new(0, MessageType::Control, "SHUTDOWN"))
            .await
            .unwrap();
        assert!(ctx.shutdown.is_triggered());
    }

    #[tokio::test]
    async fn distribute_fans_out_the_embedded_message() {
        let (ctx, mut peer_rx, control) = two_node_setup();
        control
            .handle(&ctx, &Message::new(0, MessageType::Control, "DISTRIBUTE RUMOR 2;hello"))
            .await
            .unwrap();
        let fanned = peer_rx.try_recv().unwrap();
        assert_eq!(fanned.msg_type, MessageType::Rumor);
        assert_eq!(fanned.payload, "2;hello");
        assert_eq!(fanned.src_uid, 1);
    }

    #[tokio::test]
    async fn malformed_control_payload_is_an_error() {
        let (ctx, _peer_rx, control) = two_node_setup();
        let result = control
            .handle(&ctx, &Message::new(0, MessageType::Control, "REBOOT"))
            .await;
        assert!(result.is_err());
    }
}
