// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-node view of the cluster.
//!
//! The neighbour table is read-only after startup; only the `registered`
//! flags flip (false to true) as `HELLO` messages arrive.

use crate::config::ClusterConfig;
use crate::error::{Result, TopologyError};
use crate::graph::CommGraph;
use parking_lot::RwLock;
use std::collections::HashMap;

/// What one node knows about the cluster: its direct neighbours, the full
/// membership, and which neighbours have announced themselves.
#[derive(Debug)]
pub struct Neighbourhood {
    /// Direct neighbours: UID to connect string.
    nodes: HashMap<u32, String>,
    /// The entire cluster, including non-adjacent nodes and self.
    all: HashMap<u32, String>,
    /// Which neighbours have sent `HELLO`. Append-only booleans.
    registered: RwLock<HashMap<u32, bool>>,
}

impl Neighbourhood {
    /// Full-mesh neighbourhood: every configured node except `uid`.
    pub fn from_config(uid: u32, config: &ClusterConfig) -> Result<Self> {
        if !config.nodes.contains_key(&uid) {
            return Err(TopologyError::UnknownUid(uid));
        }
        let nodes: HashMap<u32, String> = config
            .nodes
            .iter()
            .filter(|(&n, _)| n != uid)
            .map(|(&n, addr)| (n, addr.clone()))
            .collect();
        Ok(Self::build(nodes, config.nodes.clone()))
    }

    /// Neighbourhood restricted to the adjacency of `uid` in `graph`.
    pub fn from_config_and_graph(uid: u32, config: &ClusterConfig, graph: &CommGraph) -> Result<Self> {
        if !config.nodes.contains_key(&uid) {
            return Err(TopologyError::UnknownUid(uid));
        }
        let mut nodes = HashMap::new();
        for neighbour in graph.neighbours_of(uid) {
            let addr = config.connect(neighbour)?;
            nodes.insert(neighbour, addr.to_string());
        }
        Ok(Self::build(nodes, config.nodes.clone()))
    }

    fn build(nodes: HashMap<u32, String>, all: HashMap<u32, String>) -> Self {
        let registered = nodes.keys().map(|&uid| (uid, false)).collect();
        Self {
            nodes,
            all,
            registered: RwLock::new(registered),
        }
    }

    /// Direct neighbours as `(uid, connect string)` pairs.
    pub fn neighbours(&self) -> impl Iterator<Item = (u32, &str)> {
        self.nodes.iter().map(|(&uid, addr)| (uid, addr.as_str()))
    }

    /// Connect string of a direct neighbour.
    pub fn connect(&self, uid: u32) -> Option<&str> {
        self.nodes.get(&uid).map(String::as_str)
    }

    /// Number of direct neighbours.
    pub fn degree(&self) -> usize {
        self.nodes.len()
    }

    /// Whether `uid` is a direct neighbour.
    pub fn is_neighbour(&self, uid: u32) -> bool {
        self.nodes.contains_key(&uid)
    }

    /// Total number of nodes in the cluster (self included).
    pub fn cluster_size(&self) -> usize {
        self.all.len()
    }

    /// Every UID in the cluster, self included.
    pub fn cluster_uids(&self) -> Vec<u32> {
        self.all.keys().copied().collect()
    }

    /// Mark a neighbour as registered after its `HELLO`.
    pub fn mark_registered(&self, uid: u32) {
        self.registered.write().insert(uid, true);
    }

    /// Whether a neighbour has announced itself.
    pub fn is_registered(&self, uid: u32) -> bool {
        self.registered.read().get(&uid).copied().unwrap_or(false)
    }

    /// UIDs of all registered neighbours.
    pub fn registered_uids(&self) -> Vec<u32> {
        self.registered
            .read()
            .iter()
            .filter(|(_, &seen)| seen)
            .map(|(&uid, _)| uid)
            .collect()
    }
}
