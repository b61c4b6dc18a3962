// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Static cluster topology.
//!
//! A cluster is described by two files: the config file mapping node UIDs to
//! connect strings, and an optional undirected communication graph in
//! Graphviz DOT form. Together they yield each node's [`Neighbourhood`],
//! the subset of peers it is allowed to talk to directly.

pub mod config;
pub mod error;
pub mod graph;
pub mod neighbourhood;

pub use config::ClusterConfig;
pub use error::TopologyError;
pub use graph::CommGraph;
pub use neighbourhood::Neighbourhood;
