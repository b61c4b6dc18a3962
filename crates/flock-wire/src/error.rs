// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire error types

use thiserror::Error;

/// Wire result type
pub type Result<T> = std::result::Result<T, WireError>;

/// Errors surfaced by the framing and transport layer
#[derive(Debug, Error)]
pub enum WireError {
    /// IO error while dialing, reading or writing a connection
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Dial did not complete within the configured timeout
    #[error("dial timed out after {timeout_ms}ms: {target}")]
    DialTimeout { target: String, timeout_ms: u64 },

    /// Message failed to encode or decode
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// No route for the target address (in-memory transport only)
    #[error("no peer listening on {0}")]
    Unroutable(String),

    /// Receiving side of the in-memory route is gone
    #[error("peer on {0} is no longer receiving")]
    PeerGone(String),
}
