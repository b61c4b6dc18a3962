// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! The one and only on-wire unit.
//!
//! Every field is required; a frame missing any of them fails to decode and
//! is dropped by the dispatcher. The `uint` JSON key for the TTL field is a
//! historical wart of the wire format and is kept for compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Closed set of protocol domains a message can belong to.
///
/// Wire-level dispatch is sealed: a frame carrying any other string fails to
/// decode. Pluggable behaviour lives behind the extension registry, not in
/// the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Control,
    Discovery,
    Rumor,
    Banking,
    Consensus,
}

impl MessageType {
    /// Wire representation of the type tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Control => "CONTROL",
            MessageType::Discovery => "DISCOVERY",
            MessageType::Rumor => "RUMOR",
            MessageType::Banking => "BANKING",
            MessageType::Consensus => "CONSENSUS",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONTROL" => Ok(MessageType::Control),
            "DISCOVERY" => Ok(MessageType::Discovery),
            "RUMOR" => Ok(MessageType::Rumor),
            "BANKING" => Ok(MessageType::Banking),
            "CONSENSUS" => Ok(MessageType::Consensus),
            other => Err(UnknownMessageType(other.to_string())),
        }
    }
}

/// Error returned when a type tag is outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type `{0}`")]
pub struct UnknownMessageType(pub String);

/// A single protocol message.
///
/// Protocol-specific structure is carried in `payload` as `;`-separated
/// fields; the extensions own its interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Request identifier, re-stamped by the transport before every send.
    pub uuid: String,
    /// Time-to-live counter.
    #[serde(rename = "uint")]
    pub ttl: u32,
    /// UTC timestamp of construction (RFC 3339 on the wire).
    pub timestamp: DateTime<Utc>,
    /// UID of the originating node.
    pub src_uid: u32,
    /// Protocol domain.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Protocol payload, `;`-separated fields.
    pub payload: String,
}

impl Message {
    /// Construct a fresh message originating at `uid`.
    pub fn new(uid: u32, msg_type: MessageType, payload: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            ttl: 1,
            timestamp: Utc::now(),
            src_uid: uid,
            msg_type,
            payload: payload.into(),
        }
    }

    /// Construct a forwarding copy of `msg` with `uid` as the new source.
    ///
    /// Type and payload are preserved; request id and timestamp are fresh so
    /// every hop is traceable on its own.
    pub fn forward(uid: u32, msg: &Message) -> Self {
        Self::new(uid, msg.msg_type, msg.payload.clone())
    }

    /// Re-stamp the request identifier. Called by transports so each
    /// physical send carries a unique id.
    pub fn stamp_request_id(&mut self) {
        self.uuid = Uuid::new_v4().to_string();
    }

    /// Encode to the wire representation.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from the wire representation. Any missing or malformed field
    /// is an error; the caller drops the frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Generate a short identifier for flood deduplication, snapshot markers and
/// detection rounds. Eight hex characters keep the `;`-framed payloads easy
/// to read in logs.
pub fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_all_fields() {
        let msg = Message::new(7, MessageType::Rumor, "2;the-cake-is-a-lie");
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn wire_field_names_are_stable() {
        let msg = Message::new(3, MessageType::Control, "STARTUP");
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        for key in ["uuid", "uint", "timestamp", "src_uid", "type", "payload"] {
            assert!(obj.contains_key(key), "missing wire key `{key}`");
        }
        assert_eq!(obj["type"], "CONTROL");
        assert_eq!(obj["src_uid"], 3);
    }

    #[test]
    fn missing_field_fails_decode() {
        let frame = serde_json::json!({
            "uuid": "abc",
            "uint": 1,
            "timestamp": "2024-05-01T12:00:00Z",
            "type": "RUMOR",
            "payload": "2;hello",
        });
        // src_uid missing
        assert!(Message::decode(frame.to_string().as_bytes()).is_err());
    }

    #[test]
    fn unknown_type_fails_decode() {
        let frame = serde_json::json!({
            "uuid": "abc",
            "uint": 1,
            "timestamp": "2024-05-01T12:00:00Z",
            "src_uid": 4,
            "type": "GOSSIP",
            "payload": "x",
        });
        assert!(Message::decode(frame.to_string().as_bytes()).is_err());
    }

    #[test]
    fn forward_rewrites_source_and_request_id() {
        let original = Message::new(1, MessageType::Rumor, "3;hello");
        let forwarded = Message::forward(9, &original);
        assert_eq!(forwarded.src_uid, 9);
        assert_eq!(forwarded.msg_type, original.msg_type);
        assert_eq!(forwarded.payload, original.payload);
        assert_ne!(forwarded.uuid, original.uuid);
    }

    #[test]
    fn short_ids_are_short_and_distinct() {
        let a = short_id();
        let b = short_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }
}
