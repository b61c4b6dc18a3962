// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Leader election via the explore/echo wave.
//!
//! Competing waves are tie-broken by initiator UID: a node adopts the
//! highest initiator it has seen (`m`) and answers every probe with a
//! `child` reply stating whether the prober became its spanning-tree
//! parent. Echos travel up the finished tree; the initiator that survives
//! announces itself with a `leader` broadcast down its tree.
//!
//! Each protocol domain that needs a spanning tree carries its own
//! [`Election`] tagged with its own message type, so election waves of
//! different protocols never interfere.

use crate::engine::NodeContext;
use crate::error::{ProtocolError, Result};
use crate::payload::ElectionPayload;
use flock_wire::{Message, MessageType};
use tracing::{debug, info, warn};

/// Election and spanning-tree state for one protocol domain.
#[derive(Debug)]
pub struct Election {
    /// Domain tag stamped on every outbound election message.
    domain: MessageType,
    /// Boot-time coin: whether this node starts its own wave.
    want_leader: bool,
    is_leader: bool,
    /// Highest initiator UID observed so far (0 = no wave seen).
    m: u32,
    /// Non-zero once the election has terminated; all further election
    /// traffic is ignored.
    leader_uid: u32,

    // Wave-local state, reset whenever `m` changes.
    parent_uid: u32,
    child_uids: Vec<u32>,
    sent_explore: usize,
    received_explore: usize,
    received_parent_msg: usize,
    received_echo: usize,
}

impl Election {
    pub fn new(domain: MessageType, want_leader: bool) -> Self {
        Self {
            domain,
            want_leader,
            is_leader: false,
            m: 0,
            leader_uid: 0,
            parent_uid: 0,
            child_uids: Vec::new(),
            sent_explore: 0,
            received_explore: 0,
            received_parent_msg: 0,
            received_echo: 0,
        }
    }

    pub fn want_leader(&self) -> bool {
        self.want_leader
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Whether the election has terminated.
    pub fn complete(&self) -> bool {
        self.leader_uid != 0
    }

    pub fn leader_uid(&self) -> u32 {
        self.leader_uid
    }

    /// Incoming tree edge. Equals this node's own UID on the tree root.
    pub fn parent_uid(&self) -> u32 {
        self.parent_uid
    }

    /// Confirmed children in the spanning tree.
    pub fn child_uids(&self) -> &[u32] {
        &self.child_uids
    }

    /// Tree-adjacent peers: children plus the parent edge. The caller skips
    /// its own UID when it is the root.
    pub fn tree_peers(&self) -> Vec<u32> {
        let mut peers = self.child_uids.clone();
        if !peers.contains(&self.parent_uid) {
            peers.push(self.parent_uid);
        }
        peers
    }

    /// Route an election message if it is one. Returns `None` for payloads
    /// belonging to the embedding protocol.
    pub async fn try_handle(&mut self, ctx: &NodeContext, msg: &Message) -> Option<Result<()>> {
        let payload = match ElectionPayload::try_parse(&msg.payload)? {
            Ok(payload) => payload,
            Err(err) => return Some(Err(err.into())),
        };
        let result = match payload {
            ElectionPayload::Coordinator => self.handle_coordinator(ctx).await,
            ElectionPayload::Explore { m } => self.handle_explore(ctx, msg.src_uid, m).await,
            ElectionPayload::Child { m, adopted } => {
                self.handle_child(ctx, msg.src_uid, m, adopted).await
            }
            ElectionPayload::Echo { m } => self.handle_echo(ctx, msg.src_uid, m).await,
            ElectionPayload::Leader { m } => self.handle_leader(ctx, m).await,
        };
        Some(result)
    }

    /// Bootstrap trigger: start this node's own wave if it wants the job.
    async fn handle_coordinator(&mut self, ctx: &NodeContext) -> Result<()> {
        if !self.want_leader {
            info!(uid = ctx.uid, domain = %self.domain, "not starting coordinator election");
            return Ok(());
        }
        info!(uid = ctx.uid, domain = %self.domain, "starting coordinator election");

        self.m = ctx.uid;
        self.parent_uid = ctx.uid;
        self.child_uids.clear();
        self.received_echo = 0;
        self.received_explore = 0;
        self.received_parent_msg = 0;
        self.sent_explore = 0;

        let explore = Message::new(ctx.uid, self.domain, ElectionPayload::Explore { m: ctx.uid }.to_string());
        let peers: Vec<u32> = ctx.neighbourhood.neighbours().map(|(uid, _)| uid).collect();
        for peer in peers {
            ctx.send_or_log(peer, explore.clone()).await;
            self.sent_explore += 1;
        }

        // A node with no neighbours is its own cluster; the readiness check
        // makes it leader on the spot.
        self.check_echo_readiness(ctx).await
    }

    async fn handle_explore(&mut self, ctx: &NodeContext, src: u32, e: u32) -> Result<()> {
        if self.complete() {
            warn!(uid = ctx.uid, leader = self.leader_uid, "election over, ignoring explore");
            return Ok(());
        }

        if e > self.m {
            debug!(uid = ctx.uid, explore = e, evicted = self.m, "adopting larger wave");
            self.m = e;
            self.parent_uid = src;
            self.child_uids.clear();
            self.received_parent_msg = 0;
            self.received_explore = 1;
            self.sent_explore = 0;

            ctx.send_or_log(
                src,
                Message::new(ctx.uid, self.domain, ElectionPayload::Child { m: e, adopted: true }.to_string()),
            )
            .await;

            let explore = Message::new(ctx.uid, self.domain, ElectionPayload::Explore { m: e }.to_string());
            self.sent_explore = self.propagate(ctx, &explore, Some(src)).await;
        } else if e == self.m {
            ctx.send_or_log(
                src,
                Message::new(ctx.uid, self.domain, ElectionPayload::Child { m: e, adopted: false }.to_string()),
            )
            .await;
            self.received_explore += 1;
        } else {
            debug!(uid = ctx.uid, explore = e, kept = self.m, "dropping smaller wave");
            return Ok(());
        }

        self.check_echo_readiness(ctx).await
    }

    async fn handle_child(&mut self, ctx: &NodeContext, src: u32, e: u32, adopted: bool) -> Result<()> {
        if self.complete() {
            warn!(uid = ctx.uid, leader = self.leader_uid, "election over, ignoring child");
            return Ok(());
        }

        if e > self.m {
            // This node never broadcast a probe for `e`.
            return Err(ProtocolError::invariant(format!(
                "child reply for wave {e} which node {} never explored (m = {})",
                ctx.uid, self.m
            )));
        }
        if e < self.m {
            debug!(uid = ctx.uid, child_wave = e, kept = self.m, "ignoring child of evicted wave");
            return Ok(());
        }

        self.received_parent_msg += 1;
        if adopted {
            self.child_uids.push(src);
        }
        debug!(
            uid = ctx.uid,
            replies = self.received_parent_msg,
            children = self.child_uids.len(),
            "probe reply recorded"
        );
        self.check_echo_readiness(ctx).await
    }

    async fn handle_echo(&mut self, ctx: &NodeContext, src: u32, e: u32) -> Result<()> {
        if self.complete() {
            warn!(uid = ctx.uid, leader = self.leader_uid, "election over, ignoring echo");
            return Ok(());
        }

        if e > self.m {
            return Err(ProtocolError::invariant(format!(
                "echo for wave {e} which node {} never explored (m = {})",
                ctx.uid, self.m
            )));
        }
        if e < self.m {
            debug!(uid = ctx.uid, echo_wave = e, kept = self.m, "ignoring echo of evicted wave");
            return Ok(());
        }

        self.received_echo += 1;
        debug!(uid = ctx.uid, from = src, echos = self.received_echo, "echo recorded");
        self.check_echo_readiness(ctx).await
    }

    async fn handle_leader(&mut self, ctx: &NodeContext, leader: u32) -> Result<()> {
        if self.complete() {
            warn!(uid = ctx.uid, leader = self.leader_uid, "election over, ignoring leader announcement");
            return Ok(());
        }
        info!(uid = ctx.uid, domain = %self.domain, leader, "leader announced");
        self.leader_uid = leader;

        let announce = Message::new(ctx.uid, self.domain, ElectionPayload::Leader { m: leader }.to_string());
        self.propagate_children(ctx, &announce).await;
        Ok(())
    }

    /// Fires once every probed neighbour has replied and either all children
    /// echoed or this node turned out to be a leaf of the wave. The
    /// initiator of the surviving wave wins; everyone else echos upward.
    async fn check_echo_readiness(&mut self, ctx: &NodeContext) -> Result<()> {
        if self.sent_explore != self.received_parent_msg {
            debug!(
                uid = ctx.uid,
                replies = self.received_parent_msg,
                probes = self.sent_explore,
                "waiting for probe replies"
            );
            return Ok(());
        }

        let all_children_echoed = self.child_uids.len() == self.received_echo;
        let leaf = self.child_uids.is_empty() && self.received_explore == ctx.neighbourhood.degree();
        if !(all_children_echoed || leaf) {
            debug!(
                uid = ctx.uid,
                received_explore = self.received_explore,
                received_echo = self.received_echo,
                children = self.child_uids.len(),
                "echo condition not met"
            );
            return Ok(());
        }

        if self.m == ctx.uid {
            self.leader_uid = ctx.uid;
            self.is_leader = true;
            info!(uid = ctx.uid, domain = %self.domain, children = ?self.child_uids, "this node is now leader");
            let announce =
                Message::new(ctx.uid, self.domain, ElectionPayload::Leader { m: ctx.uid }.to_string());
            self.propagate_children(ctx, &announce).await;
        } else {
            debug!(uid = ctx.uid, wave = self.m, parent = self.parent_uid, "sending echo up the tree");
            ctx.send_or_log(
                self.parent_uid,
                Message::new(ctx.uid, self.domain, ElectionPayload::Echo { m: self.m }.to_string()),
            )
            .await;
        }
        Ok(())
    }

    /// Unrooted flood: forward to every neighbour except the sender.
    pub async fn propagate(&self, ctx: &NodeContext, msg: &Message, exclude: Option<u32>) -> usize {
        let mut total = 0;
        let peers: Vec<u32> = ctx.neighbourhood.neighbours().map(|(uid, _)| uid).collect();
        for peer in peers {
            if Some(peer) == exclude {
                continue;
            }
            ctx.send_or_log(peer, Message::forward(ctx.uid, msg)).await;
            total += 1;
        }
        total
    }

    /// Forward along tree edges away from the root.
    pub async fn propagate_children(&self, ctx: &NodeContext, msg: &Message) -> usize {
        let mut total = 0;
        for &child in &self.child_uids {
            ctx.send_or_log(child, Message::forward(ctx.uid, msg)).await;
            total += 1;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NodeContext;
    use flock_topology::{ClusterConfig, Neighbourhood};
    use flock_wire::{MemoryHub, ShutdownSignal};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Harness {
        ctx: NodeContext,
        peers: Vec<(u32, mpsc::UnboundedReceiver<Message>)>,
    }

    /// A node under test plus mailboxes for each of its neighbours.
    fn harness(uid: u32, cluster: &[u32]) -> Harness {
        let config_text: String = cluster
            .iter()
            .map(|peer| format!("{peer} 127.0.0.1:{}\n", 4000 + peer))
            .collect();
        let config = ClusterConfig::parse(&config_text).unwrap();
        let hub = MemoryHub::new();
        let peers = cluster
            .iter()
            .filter(|&&peer| peer != uid)
            .map(|&peer| (peer, hub.register(&format!("127.0.0.1:{}", 4000 + peer))))
            .collect();
        let ctx = NodeContext::new(
            uid,
            Arc::new(Neighbourhood::from_config(uid, &config).unwrap()),
            hub.transport(),
            ShutdownSignal::new(),
        );
        Harness { ctx, peers }
    }

    fn drain(peers: &mut Vec<(u32, mpsc::UnboundedReceiver<Message>)>) -> Vec<(u32, String)> {
        let mut out = Vec::new();
        for (uid, rx) in peers.iter_mut() {
            while let Ok(msg) = rx.try_recv() {
                out.push((*uid, msg.payload));
            }
        }
        out
    }

    fn msg(from: u32, payload: &str) -> Message {
        Message::new(from, MessageType::Consensus, payload)
    }

    #[tokio::test]
    async fn reluctant_node_never_initiates() {
        let mut h = harness(1, &[1, 2]);
        let mut election = Election::new(MessageType::Consensus, false);

        election.try_handle(&h.ctx, &msg(1, "coordinator")).await.unwrap().unwrap();
        assert!(drain(&mut h.peers).is_empty());
        assert!(!election.complete());
    }

    #[tokio::test]
    async fn single_node_elects_itself_immediately() {
        let mut h = harness(1, &[1]);
        let mut election = Election::new(MessageType::Consensus, true);

        election.try_handle(&h.ctx, &msg(1, "coordinator")).await.unwrap().unwrap();
        assert!(election.complete());
        assert!(election.is_leader());
        assert_eq!(election.leader_uid(), 1);
        assert!(election.child_uids().is_empty());
        assert!(drain(&mut h.peers).is_empty());
    }

    #[tokio::test]
    async fn adopting_a_larger_wave_replies_child_and_propagates() {
        let mut h = harness(1, &[1, 2, 3]);
        let mut election = Election::new(MessageType::Consensus, false);

        election.try_handle(&h.ctx, &msg(3, "explore;3")).await.unwrap().unwrap();
        let sent = drain(&mut h.peers);
        assert!(sent.contains(&(3, "child;3;1".to_string())));
        assert!(sent.contains(&(2, "explore;3".to_string())));
        assert_eq!(sent.len(), 2);
        assert_eq!(election.parent_uid(), 3);
    }

    #[tokio::test]
    async fn repeated_wave_is_answered_with_non_child() {
        let mut h = harness(1, &[1, 2, 3]);
        let mut election = Election::new(MessageType::Consensus, false);

        election.try_handle(&h.ctx, &msg(3, "explore;3")).await.unwrap().unwrap();
        drain(&mut h.peers);

        election.try_handle(&h.ctx, &msg(2, "explore;3")).await.unwrap().unwrap();
        let sent = drain(&mut h.peers);
        assert_eq!(sent, vec![(2, "child;3;0".to_string())]);
    }

    #[tokio::test]
    async fn smaller_wave_is_dropped_silently() {
        let mut h = harness(5, &[1, 5, 9]);
        let mut election = Election::new(MessageType::Consensus, false);

        election.try_handle(&h.ctx, &msg(9, "explore;9")).await.unwrap().unwrap();
        drain(&mut h.peers);
        election.try_handle(&h.ctx, &msg(1, "explore;1")).await.unwrap().unwrap();
        assert!(drain(&mut h.peers).is_empty());
    }

    #[tokio::test]
    async fn child_for_unknown_wave_is_an_invariant_violation() {
        let h = harness(1, &[1, 2]);
        let mut election = Election::new(MessageType::Consensus, false);

        let result = election.try_handle(&h.ctx, &msg(2, "child;7;1")).await.unwrap();
        assert!(matches!(result, Err(ProtocolError::Invariant(_))));
    }

    #[tokio::test]
    async fn echo_for_unknown_wave_is_an_invariant_violation() {
        let h = harness(1, &[1, 2]);
        let mut election = Election::new(MessageType::Consensus, false);

        let result = election.try_handle(&h.ctx, &msg(2, "echo;7")).await.unwrap();
        assert!(matches!(result, Err(ProtocolError::Invariant(_))));
    }

    #[tokio::test]
    async fn leaf_node_echos_to_its_parent_once_all_probes_answered() {
        // Node 1 in a triangle {1,2,3}: adopts 3's wave, probes 2, and 2
        // answers "not your child" having adopted 3 directly.
        let mut h = harness(1, &[1, 2, 3]);
        let mut election = Election::new(MessageType::Consensus, false);

        election.try_handle(&h.ctx, &msg(3, "explore;3")).await.unwrap().unwrap();
        drain(&mut h.peers);
        // The probe from 2 for the same wave makes this node a leaf...
        election.try_handle(&h.ctx, &msg(2, "explore;3")).await.unwrap().unwrap();
        drain(&mut h.peers);
        // ...and 2's reply completes the probe count.
        election.try_handle(&h.ctx, &msg(2, "child;3;0")).await.unwrap().unwrap();
        let sent = drain(&mut h.peers);
        assert!(sent.contains(&(3, "echo;3".to_string())), "expected upward echo, got {sent:?}");
    }

    #[tokio::test]
    async fn initiator_wins_and_announces_down_the_tree() {
        // Node 3 initiates in a triangle; both neighbours adopt it and echo.
        let mut h = harness(3, &[1, 2, 3]);
        let mut election = Election::new(MessageType::Consensus, true);

        election.try_handle(&h.ctx, &msg(3, "coordinator")).await.unwrap().unwrap();
        drain(&mut h.peers);
        election.try_handle(&h.ctx, &msg(1, "child;3;1")).await.unwrap().unwrap();
        election.try_handle(&h.ctx, &msg(2, "child;3;1")).await.unwrap().unwrap();
        election.try_handle(&h.ctx, &msg(1, "echo;3")).await.unwrap().unwrap();
        assert!(!election.complete());
        election.try_handle(&h.ctx, &msg(2, "echo;3")).await.unwrap().unwrap();

        assert!(election.is_leader());
        assert_eq!(election.leader_uid(), 3);
        let sent = drain(&mut h.peers);
        assert!(sent.contains(&(1, "leader;3".to_string())));
        assert!(sent.contains(&(2, "leader;3".to_string())));
    }

    #[tokio::test]
    async fn leader_announcement_is_forwarded_once() {
        let mut h = harness(1, &[1, 2, 3]);
        let mut election = Election::new(MessageType::Consensus, false);

        // Adopt 3 with 2 as a child so the announcement has somewhere to go.
        election.try_handle(&h.ctx, &msg(3, "explore;3")).await.unwrap().unwrap();
        election.try_handle(&h.ctx, &msg(2, "child;3;1")).await.unwrap().unwrap();
        drain(&mut h.peers);

        election.try_handle(&h.ctx, &msg(3, "leader;3")).await.unwrap().unwrap();
        assert_eq!(election.leader_uid(), 3);
        assert!(!election.is_leader());
        let sent = drain(&mut h.peers);
        assert_eq!(sent, vec![(2, "leader;3".to_string())]);

        // A duplicate announcement is ignored.
        election.try_handle(&h.ctx, &msg(3, "leader;3")).await.unwrap().unwrap();
        assert!(drain(&mut h.peers).is_empty());
    }
}
