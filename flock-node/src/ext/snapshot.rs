// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Chandy-Lamport snapshot records.
//!
//! A node records its balance when it first sees a marker, then records
//! every message arriving on each inbound channel until that channel's own
//! marker closes it. Completed records travel up the spanning tree as
//! `state;<marker>;<blob>` where the blob is JSON, DEFLATE-compressed and
//! base64-encoded so it fits the `;`-framed ASCII payload channel.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use flock_wire::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use thiserror::Error;

/// Errors while encoding or decoding a snapshot blob
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("snapshot base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// One node's contribution to a consistent global snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub uid: u32,
    /// Messages observed per inbound channel while it was open.
    pub msg_in: HashMap<u32, Vec<Message>>,
    /// Local balance at marker arrival.
    pub balance: i64,

    /// Which inbound channels are still recording. Local bookkeeping, not
    /// part of the blob.
    #[serde(skip)]
    channel_open: HashMap<u32, bool>,
    /// Set once the completed record has been reported toward the leader.
    #[serde(skip)]
    reported: bool,
}

impl SnapshotRecord {
    /// Start recording: balance frozen now, every inbound channel open.
    pub fn new(uid: u32, balance: i64, neighbours: impl IntoIterator<Item = u32>) -> Self {
        let mut msg_in = HashMap::new();
        let mut channel_open = HashMap::new();
        for neighbour in neighbours {
            msg_in.insert(neighbour, Vec::new());
            channel_open.insert(neighbour, true);
        }
        Self {
            uid,
            msg_in,
            balance,
            channel_open,
            reported: false,
        }
    }

    /// Stop recording the channel from `uid` (its marker arrived).
    pub fn close_channel(&mut self, uid: u32) {
        if let Some(open) = self.channel_open.get_mut(&uid) {
            *open = false;
        }
    }

    /// Record a message observed on the channel from `uid`, if that channel
    /// is still open.
    pub fn record(&mut self, uid: u32, msg: &Message) {
        if self.channel_open.get(&uid).copied().unwrap_or(false) {
            self.msg_in.entry(uid).or_default().push(msg.clone());
        }
    }

    /// Whether every inbound channel has been closed.
    pub fn is_complete(&self) -> bool {
        self.channel_open.values().all(|&open| !open)
    }

    /// Take the one-shot right to report this record toward the leader.
    /// Returns false when the record was reported before.
    pub fn take_report(&mut self) -> bool {
        if self.reported {
            return false;
        }
        self.reported = true;
        true
    }

    /// Encode as JSON → DEFLATE → base64.
    pub fn compress(&self) -> Result<String, SnapshotError> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;
        Ok(BASE64.encode(compressed))
    }

    /// Decode a blob produced by [`SnapshotRecord::compress`].
    pub fn decompress(blob: &str) -> Result<Self, SnapshotError> {
        let compressed = BASE64.decode(blob)?;
        let mut json = Vec::new();
        DeflateDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }
}
