// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! The `RUMOR` extension: rumor mongering with k-threshold trust.
//!
//! A node forwards a rumor at most once per neighbour, never back over the
//! delivering edge. Once a rumor has arrived over `c` independent
//! deliveries it becomes trusted. Counters only grow and trust never
//! reverts.

use crate::engine::{Extension, NodeContext};
use crate::error::Result;
use crate::payload::RumorPayload;
use async_trait::async_trait;
use flock_wire::{Message, MessageType};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct RumorEntry {
    seen: u32,
    trusted: bool,
    /// Neighbours this node has already forwarded the rumor to.
    forwarded: HashSet<u32>,
}

/// Occurrence counters and trust flags per rumor.
#[derive(Debug, Default)]
pub struct RumorLedger {
    entries: Mutex<HashMap<String, RumorEntry>>,
}

impl RumorLedger {
    /// Count one delivery and return the new total.
    pub fn observe(&self, rumor: &str) -> u32 {
        let mut entries = self.entries.lock();
        let entry = entries.entry(rumor.to_string()).or_default();
        entry.seen += 1;
        entry.seen
    }

    /// Of `candidates`, claim those not yet forwarded to. Claimed
    /// neighbours are recorded, so each neighbour is served at most once
    /// per rumor.
    pub fn claim_forward_targets(&self, rumor: &str, candidates: impl IntoIterator<Item = u32>) -> Vec<u32> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(rumor.to_string()).or_default();
        candidates
            .into_iter()
            .filter(|&uid| entry.forwarded.insert(uid))
            .collect()
    }

    pub fn mark_trusted(&self, rumor: &str) {
        self.entries.lock().entry(rumor.to_string()).or_default().trusted = true;
    }

    pub fn seen_count(&self, rumor: &str) -> u32 {
        self.entries.lock().get(rumor).map_or(0, |entry| entry.seen)
    }

    pub fn is_trusted(&self, rumor: &str) -> bool {
        self.entries.lock().get(rumor).is_some_and(|entry| entry.trusted)
    }
}

#[derive(Default)]
pub struct RumorExtension {
    ledger: RumorLedger,
}

impl RumorExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> &RumorLedger {
        &self.ledger
    }
}

#[async_trait]
impl Extension for RumorExtension {
    fn message_type(&self) -> MessageType {
        MessageType::Rumor
    }

    async fn handle(&self, ctx: &NodeContext, msg: &Message) -> Result<()> {
        let RumorPayload { threshold, rumor } = RumorPayload::parse(&msg.payload)?;

        let seen = self.ledger.observe(&rumor);
        info!(uid = ctx.uid, rumor, seen, "rumor counter increased");

        let candidates = ctx
            .neighbourhood
            .neighbours()
            .map(|(uid, _)| uid)
            .filter(|&uid| uid != msg.src_uid);
        let targets = self.ledger.claim_forward_targets(&rumor, candidates);
        if !targets.is_empty() {
            let forwarded = Message::forward(ctx.uid, msg);
            for peer in targets {
                debug!(uid = ctx.uid, peer, rumor, "propagating rumor");
                ctx.send_or_log(peer, forwarded.clone()).await;
            }
        }

        if seen == threshold {
            self.ledger.mark_trusted(&rumor);
            info!(uid = ctx.uid, rumor, seen, "rumor now trusted");
        } else if seen > threshold {
            debug!(uid = ctx.uid, rumor, seen, threshold, "rumor already trusted");
        }
        Ok(())
    }
}
