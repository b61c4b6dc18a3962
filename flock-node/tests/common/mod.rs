// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-process cluster harness for protocol scenario tests.
//!
//! Nodes share a [`MemoryHub`] instead of real sockets; the pump drains
//! every node's inbound queue round-robin until the cluster is quiescent,
//! which makes protocol runs deterministic for a given injection order.

use flock_node::ext::{
    BankingExtension, ConsensusExtension, ConsensusKnobs, ControlExtension, DiscoveryExtension,
    RumorExtension,
};
use flock_node::{Extension, NodeContext};
use flock_topology::{ClusterConfig, CommGraph, Neighbourhood};
use flock_wire::{MemoryHub, Message, MessageType, ShutdownSignal, Transport};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Deterministic boot parameters for one test node.
#[derive(Debug, Clone)]
pub struct NodeProfile {
    pub banking_leader: bool,
    pub consensus_leader: bool,
    pub balance: i64,
    pub t_k: i64,
    pub knobs: ConsensusKnobs,
}

impl Default for NodeProfile {
    fn default() -> Self {
        Self {
            banking_leader: false,
            consensus_leader: false,
            balance: 50_000,
            t_k: 5,
            knobs: ConsensusKnobs::default(),
        }
    }
}

pub struct ClusterNode {
    pub ctx: Arc<NodeContext>,
    rx: mpsc::UnboundedReceiver<Message>,
    pub control: Arc<ControlExtension>,
    pub discovery: Arc<DiscoveryExtension>,
    pub rumor: Arc<RumorExtension>,
    pub banking: Arc<BankingExtension>,
    pub consensus: Arc<ConsensusExtension>,
}

impl ClusterNode {
    async fn dispatch(&self, msg: &Message) {
        let result = match msg.msg_type {
            MessageType::Control => self.control.handle(&self.ctx, msg).await,
            MessageType::Discovery => self.discovery.handle(&self.ctx, msg).await,
            MessageType::Rumor => self.rumor.handle(&self.ctx, msg).await,
            MessageType::Banking => self.banking.handle(&self.ctx, msg).await,
            MessageType::Consensus => self.consensus.handle(&self.ctx, msg).await,
        };
        if let Err(err) = result {
            panic!(
                "node {} failed handling {} `{}`: {err}",
                self.ctx.uid, msg.msg_type, msg.payload
            );
        }
    }
}

pub struct TestCluster {
    transport: Arc<dyn Transport>,
    config: ClusterConfig,
    nodes: BTreeMap<u32, ClusterNode>,
}

fn connect_string(uid: u32) -> String {
    format!("10.1.0.{uid}:4000")
}

impl TestCluster {
    /// Fully meshed cluster over the given profiles.
    pub fn full_mesh(profiles: Vec<(u32, NodeProfile)>) -> Self {
        Self::build(profiles, None)
    }

    /// Cluster restricted to a communication graph given as edge list.
    pub fn with_graph(profiles: Vec<(u32, NodeProfile)>, edges: &[(u32, u32)]) -> Self {
        let mut graph = CommGraph::new();
        for &(a, b) in edges {
            graph.add_edge(a, b).expect("test graph edge");
        }
        Self::build(profiles, Some(graph))
    }

    fn build(profiles: Vec<(u32, NodeProfile)>, graph: Option<CommGraph>) -> Self {
        let config_text: String = profiles
            .iter()
            .map(|(uid, _)| format!("{uid} {}\n", connect_string(*uid)))
            .collect();
        let config = ClusterConfig::parse(&config_text).expect("test cluster config");

        let hub = MemoryHub::new();
        let mut nodes = BTreeMap::new();
        for (uid, profile) in profiles {
            let rx = hub.register(&connect_string(uid));
            let neighbourhood = match &graph {
                Some(graph) => Neighbourhood::from_config_and_graph(uid, &config, graph),
                None => Neighbourhood::from_config(uid, &config),
            }
            .expect("test neighbourhood");

            let ctx = Arc::new(NodeContext::new(
                uid,
                Arc::new(neighbourhood),
                hub.transport(),
                ShutdownSignal::new(),
            ));
            nodes.insert(
                uid,
                ClusterNode {
                    ctx,
                    rx,
                    control: Arc::new(ControlExtension::new()),
                    discovery: Arc::new(DiscoveryExtension::new()),
                    rumor: Arc::new(RumorExtension::new()),
                    banking: Arc::new(BankingExtension::with_profile(
                        profile.banking_leader,
                        profile.balance,
                    )),
                    consensus: Arc::new(ConsensusExtension::with_profile(
                        profile.knobs,
                        profile.consensus_leader,
                        profile.t_k,
                    )),
                },
            );
        }

        Self {
            transport: hub.transport(),
            config,
            nodes,
        }
    }

    pub fn node(&self, uid: u32) -> &ClusterNode {
        &self.nodes[&uid]
    }

    pub fn uids(&self) -> Vec<u32> {
        self.nodes.keys().copied().collect()
    }

    /// Deliver a message to one node, client-style (through the hub, picked
    /// up on the next pump).
    pub async fn inject(&self, target: u32, msg_type: MessageType, payload: &str) {
        let msg = Message::new(0, msg_type, payload);
        self.transport
            .send(self.config.connect(target).expect("known target"), msg)
            .await
            .expect("inject");
    }

    /// Round-robin delivery until every inbound queue is empty. Returns the
    /// number of messages processed.
    pub async fn pump(&mut self) -> usize {
        let mut processed = 0;
        loop {
            let mut progressed = false;
            let uids: Vec<u32> = self.nodes.keys().copied().collect();
            for uid in uids {
                let next = self.nodes.get_mut(&uid).expect("known node").rx.try_recv();
                if let Ok(msg) = next {
                    self.nodes[&uid].dispatch(&msg).await;
                    processed += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return processed;
            }
            assert!(processed < 100_000, "cluster did not quiesce");
        }
    }
}
