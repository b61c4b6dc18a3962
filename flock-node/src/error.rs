// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Protocol error types.
//!
//! Handlers surface errors to the engine, which logs and continues; no
//! protocol error aborts the node. Invariant violations point at a protocol
//! bug or a lossy reorder the design does not tolerate.

use crate::ext::snapshot::SnapshotError;
use crate::lamport::DuplicateTimestamp;
use crate::payload::PayloadError;
use flock_wire::WireError;
use thiserror::Error;

/// Protocol result type
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors surfaced by extension handlers
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload could not be parsed into its protocol's schema
    #[error("malformed payload: {0}")]
    Payload(#[from] PayloadError),

    /// Protocol state machine reached a state the design rules out
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Duplicate timestamp offered to a Lamport mutex queue
    #[error(transparent)]
    DuplicateTimestamp(#[from] DuplicateTimestamp),

    /// Snapshot blob failed to encode or decode
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Transport failure on a send the handler had to complete
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Target UID has no connect string in this node's neighbourhood
    #[error("no connect string for peer {0}")]
    UnknownPeer(u32),
}

impl ProtocolError {
    /// Shorthand for invariant violations.
    pub fn invariant(msg: impl Into<String>) -> Self {
        ProtocolError::Invariant(msg.into())
    }
}
