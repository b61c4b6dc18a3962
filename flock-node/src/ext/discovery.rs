// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! The `DISCOVERY` extension: neighbours announce themselves with `HELLO`
//! after startup. Registration feeds operational telemetry only; no reply
//! is sent.

use crate::engine::{Extension, NodeContext};
use crate::error::Result;
use crate::payload::DiscoveryPayload;
use async_trait::async_trait;
use flock_wire::{Message, MessageType};
use tracing::info;

#[derive(Default)]
pub struct DiscoveryExtension;

impl DiscoveryExtension {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Extension for DiscoveryExtension {
    fn message_type(&self) -> MessageType {
        MessageType::Discovery
    }

    async fn handle(&self, ctx: &NodeContext, msg: &Message) -> Result<()> {
        let DiscoveryPayload::Hello = DiscoveryPayload::parse(&msg.payload)?;
        ctx.neighbourhood.mark_registered(msg.src_uid);
        info!(
            uid = ctx.uid,
            src_uid = msg.src_uid,
            req_id = %msg.uuid,
            "registered node"
        );
        Ok(())
    }
}
