// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! The per-node protocol engine.
//!
//! A node is a routing [`engine::Engine`] plus a set of protocol
//! [`engine::Extension`]s keyed by message type:
//!
//! - `CONTROL` / `DISCOVERY`: cluster bootstrap and neighbour registration
//! - `RUMOR`: rumor mongering with k-threshold trust
//! - `BANKING`: Lamport-clock-ordered mutual exclusion, distributed
//!   transactions and Chandy-Lamport snapshots
//! - `CONSENSUS`: randomised timestamp alignment with double-counting
//!   termination detection
//!
//! The `BANKING` and `CONSENSUS` domains each elect a leader with the
//! explore/echo wave in [`election`], which also yields the spanning tree
//! their tree-bound traffic runs on.

pub mod election;
pub mod engine;
pub mod error;
pub mod ext;
pub mod lamport;
pub mod payload;

pub use engine::{Engine, Extension, NodeContext};
pub use error::ProtocolError;
