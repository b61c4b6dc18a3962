// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Undirected communication graphs in Graphviz DOT form.
//!
//! Only the subset the toolkit emits is accepted: `graph <name> { ... }`
//! with statements that are either bare node declarations (`3;`) or edges
//! (`1 -- 2;`), node identifiers being decimal UIDs. An edge `a -- b`
//! induces neighbour relationships in both directions.

use crate::error::{Result, TopologyError};
use rand::Rng;
use std::collections::BTreeSet;
use std::path::Path;

/// An undirected communication graph over node UIDs.
#[derive(Debug, Clone, Default)]
pub struct CommGraph {
    /// Edges normalised to `(low, high)`.
    edges: BTreeSet<(u32, u32)>,
    nodes: BTreeSet<u32>,
}

impl CommGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a DOT file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse DOT text.
    pub fn parse(content: &str) -> Result<Self> {
        let open = content
            .find('{')
            .ok_or_else(|| TopologyError::InvalidGraph("missing `{`".to_string()))?;
        let close = content
            .rfind('}')
            .ok_or_else(|| TopologyError::InvalidGraph("missing `}`".to_string()))?;
        let header = content[..open].trim();
        if !header.starts_with("graph") {
            return Err(TopologyError::InvalidGraph(
                "expected an undirected `graph` header".to_string(),
            ));
        }

        let mut graph = Self::new();
        let body = &content[open + 1..close];
        for stmt in body.split(&[';', '\n'][..]) {
            let stmt = stmt.trim();
            if stmt.is_empty() {
                continue;
            }
            if let Some((a, b)) = stmt.split_once("--") {
                let a = parse_uid(a.trim())?;
                let b = parse_uid(b.trim())?;
                graph.add_edge(a, b)?;
            } else {
                graph.nodes.insert(parse_uid(stmt)?);
            }
        }
        Ok(graph)
    }

    /// Add the undirected edge `a -- b`. Self-loops are invalid; duplicate
    /// edges collapse.
    pub fn add_edge(&mut self, a: u32, b: u32) -> Result<()> {
        if a == b {
            return Err(TopologyError::InvalidGraph(format!("self-loop on {a}")));
        }
        self.nodes.insert(a);
        self.nodes.insert(b);
        self.edges.insert((a.min(b), a.max(b)));
        Ok(())
    }

    /// UIDs adjacent to `uid`.
    pub fn neighbours_of(&self, uid: u32) -> Vec<u32> {
        self.edges
            .iter()
            .filter_map(|&(a, b)| {
                if a == uid {
                    Some(b)
                } else if b == uid {
                    Some(a)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Render as DOT text, one statement per line.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("graph G {\n");
        for node in &self.nodes {
            out.push_str(&format!("    {node};\n"));
        }
        for (a, b) in &self.edges {
            out.push_str(&format!("    {a} -- {b};\n"));
        }
        out.push_str("}\n");
        out
    }

    /// Write the DOT rendering to disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_dot())?;
        Ok(())
    }

    /// Generate a random graph with nodes `1..=n` and exactly `m` edges.
    ///
    /// Every node receives at least one incident edge, then random edges are
    /// added until `m` is reached. Bounds: `n <= m <= n*(n-1)/2`.
    pub fn generate(n: u32, m: u32, rng: &mut impl Rng) -> Result<Self> {
        if n < 2 || m < n || m > n * (n - 1) / 2 {
            return Err(TopologyError::GraphBounds { n, m });
        }

        let mut graph = Self::new();
        for uid in 1..=n {
            graph.nodes.insert(uid);
        }

        // One incident edge per node first, so nobody is isolated. The first
        // phase adds at most n edges and m >= n, so it never overshoots.
        for a in 1..=n {
            loop {
                let b = rng.gen_range(1..=n);
                if b != a {
                    graph.edges.insert((a.min(b), a.max(b)));
                    break;
                }
            }
        }

        while (graph.edge_count() as u32) < m {
            let a = rng.gen_range(1..=n);
            let b = rng.gen_range(1..=n);
            if a != b {
                graph.edges.insert((a.min(b), a.max(b)));
            }
        }
        Ok(graph)
    }
}

fn parse_uid(token: &str) -> Result<u32> {
    let uid: u32 = token
        .parse()
        .map_err(|_| TopologyError::InvalidGraph(format!("`{token}` is not a decimal UID")))?;
    if uid == 0 {
        return Err(TopologyError::InvalidGraph("UID must be positive".to_string()));
    }
    Ok(uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn parses_edges_in_both_directions() {
        let graph = CommGraph::parse("graph G { 1 -- 2; 2 -- 3; }").unwrap();
        assert_eq!(graph.neighbours_of(1), vec![2]);
        assert_eq!(graph.neighbours_of(2), vec![1, 3]);
        assert_eq!(graph.neighbours_of(3), vec![2]);
    }

    #[test]
    fn parses_multiline_with_node_declarations() {
        let graph = CommGraph::parse("graph G {\n    4;\n    1 -- 2\n    3 -- 1;\n}\n").unwrap();
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.neighbours_of(4).is_empty());
    }

    #[test]
    fn rejects_directed_and_malformed_graphs() {
        assert!(CommGraph::parse("digraph G { 1 -> 2; }").is_err());
        assert!(CommGraph::parse("graph G { 1 -- x; }").is_err());
        assert!(CommGraph::parse("graph G { 1 -- 1; }").is_err());
        assert!(CommGraph::parse("not a graph at all").is_err());
    }

    #[test]
    fn dot_rendering_round_trips() {
        let mut graph = CommGraph::new();
        graph.add_edge(1, 2).unwrap();
        graph.add_edge(3, 2).unwrap();
        let reparsed = CommGraph::parse(&graph.to_dot()).unwrap();
        assert_eq!(reparsed.edge_count(), 2);
        assert_eq!(reparsed.neighbours_of(2), vec![1, 3]);
    }

    #[test]
    fn generate_respects_bounds_and_covers_every_node() {
        let mut rng = StdRng::seed_from_u64(42);
        let graph = CommGraph::generate(6, 10, &mut rng).unwrap();
        assert_eq!(graph.node_count(), 6);
        assert_eq!(graph.edge_count(), 10);
        for uid in 1..=6 {
            assert!(!graph.neighbours_of(uid).is_empty(), "node {uid} isolated");
        }
    }

    #[test]
    fn generate_rejects_out_of_bounds_requests() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(CommGraph::generate(6, 5, &mut rng).is_err()); // m < n
        assert!(CommGraph::generate(4, 7, &mut rng).is_err()); // m > n*(n-1)/2
    }
}
