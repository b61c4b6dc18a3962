// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Topology result type
pub type Result<T> = std::result::Result<T, TopologyError>;

/// Errors while loading cluster configuration or communication graphs
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config line `{line}`: {reason}")]
    InvalidConfigLine { line: String, reason: String },

    #[error("duplicate UID {0} in config")]
    DuplicateUid(u32),

    #[error("UID {0} not present in config")]
    UnknownUid(u32),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("graph generation bounds violated: need n <= m <= n*(n-1)/2, got n={n}, m={m}")]
    GraphBounds { n: u32, m: u32 },
}
