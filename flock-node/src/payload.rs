// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! Typed protocol payloads.
//!
//! On the wire every payload is a `;`-separated string whose first field
//! names the subtype. Each protocol defines a tagged union with one parser
//! and one renderer per subtype; subtype dispatch matches the leading token
//! exactly, so no subtype may shadow another by prefix. Booleans are strict
//! `true`/`false`, the `child` adoption flag is `1`/`0`.

use flock_wire::MessageType;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while parsing a payload into its protocol schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("empty payload")]
    Empty,

    #[error("unknown {domain} subtype in `{payload}`")]
    UnknownSubtype { domain: &'static str, payload: String },

    #[error("payload `{payload}` is missing field {index}")]
    MissingField { payload: String, index: usize },

    #[error("field {index} of `{payload}` is not a valid {expected}")]
    BadField {
        payload: String,
        index: usize,
        expected: &'static str,
    },
}

/// A `;`-split payload with positional field accessors that report precise
/// errors instead of defaulting out-of-range reads to zero.
struct Fields<'a> {
    raw: &'a str,
    parts: Vec<&'a str>,
}

impl<'a> Fields<'a> {
    fn split(raw: &'a str) -> Self {
        Self {
            raw,
            parts: raw.split(';').collect(),
        }
    }

    fn subtype(&self) -> &'a str {
        self.parts[0]
    }

    fn get(&self, index: usize) -> Result<&'a str, PayloadError> {
        self.parts.get(index).copied().ok_or(PayloadError::MissingField {
            payload: self.raw.to_string(),
            index,
        })
    }

    fn parse<T: FromStr>(&self, index: usize, expected: &'static str) -> Result<T, PayloadError> {
        self.get(index)?.parse().map_err(|_| PayloadError::BadField {
            payload: self.raw.to_string(),
            index,
            expected,
        })
    }

    fn bool(&self, index: usize) -> Result<bool, PayloadError> {
        match self.get(index)? {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(PayloadError::BadField {
                payload: self.raw.to_string(),
                index,
                expected: "boolean",
            }),
        }
    }

    /// Remainder of the payload starting at field `index`, `;` included.
    fn rest(&self, index: usize) -> Result<&'a str, PayloadError> {
        self.get(index)?;
        let offset: usize = self.parts[..index].iter().map(|p| p.len() + 1).sum();
        Ok(&self.raw[offset..])
    }
}

// ---------------------------------------------------------------------------
// CONTROL
// ---------------------------------------------------------------------------

/// Payloads of the `CONTROL` domain. `DISTRIBUTE` is space-separated on the
/// wire for historical reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPayload {
    Startup,
    Shutdown,
    Distribute { msg_type: MessageType, payload: String },
}

impl ControlPayload {
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        if raw.is_empty() {
            return Err(PayloadError::Empty);
        }
        let mut words = raw.split_whitespace();
        match words.next() {
            Some("STARTUP") => Ok(ControlPayload::Startup),
            Some("SHUTDOWN") => Ok(ControlPayload::Shutdown),
            Some("DISTRIBUTE") => {
                let msg_type = words.next().ok_or(PayloadError::MissingField {
                    payload: raw.to_string(),
                    index: 1,
                })?;
                let msg_type = msg_type.parse().map_err(|_| PayloadError::BadField {
                    payload: raw.to_string(),
                    index: 1,
                    expected: "message type",
                })?;
                let payload = words.next().ok_or(PayloadError::MissingField {
                    payload: raw.to_string(),
                    index: 2,
                })?;
                Ok(ControlPayload::Distribute {
                    msg_type,
                    payload: payload.to_string(),
                })
            }
            _ => Err(PayloadError::UnknownSubtype {
                domain: "CONTROL",
                payload: raw.to_string(),
            }),
        }
    }
}

impl fmt::Display for ControlPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlPayload::Startup => write!(f, "STARTUP"),
            ControlPayload::Shutdown => write!(f, "SHUTDOWN"),
            ControlPayload::Distribute { msg_type, payload } => {
                write!(f, "DISTRIBUTE {msg_type} {payload}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DISCOVERY
// ---------------------------------------------------------------------------

/// Payloads of the `DISCOVERY` domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryPayload {
    Hello,
}

impl DiscoveryPayload {
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        match raw {
            "HELLO" => Ok(DiscoveryPayload::Hello),
            "" => Err(PayloadError::Empty),
            _ => Err(PayloadError::UnknownSubtype {
                domain: "DISCOVERY",
                payload: raw.to_string(),
            }),
        }
    }
}

impl fmt::Display for DiscoveryPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryPayload::Hello => write!(f, "HELLO"),
        }
    }
}

// ---------------------------------------------------------------------------
// RUMOR
// ---------------------------------------------------------------------------

/// Payload of the `RUMOR` domain: `<c>;<rumor>`. The rumor text is opaque
/// and may itself contain `;`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RumorPayload {
    /// Number of independent deliveries before the rumor is trusted.
    pub threshold: u32,
    pub rumor: String,
}

impl RumorPayload {
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        if raw.is_empty() {
            return Err(PayloadError::Empty);
        }
        let fields = Fields::split(raw);
        let threshold = fields.parse(0, "trust threshold")?;
        let rumor = fields.rest(1)?.to_string();
        Ok(Self { threshold, rumor })
    }
}

impl fmt::Display for RumorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.threshold, self.rumor)
    }
}

// ---------------------------------------------------------------------------
// Leader election (shared by BANKING and CONSENSUS)
// ---------------------------------------------------------------------------

/// Leader-election payloads, embedded in whichever domain runs the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPayload {
    /// Local bootstrap trigger for this node's own wave.
    Coordinator,
    /// Probe carrying the initiator's UID.
    Explore { m: u32 },
    /// Reply to a probe; `adopted` is whether the sender became a child.
    Child { m: u32, adopted: bool },
    /// Upward termination signal along the tree.
    Echo { m: u32 },
    /// Downward broadcast of the election result.
    Leader { m: u32 },
}

impl ElectionPayload {
    /// Parse an election payload. Returns `None` when the subtype belongs to
    /// the embedding protocol instead.
    pub fn try_parse(raw: &str) -> Option<Result<Self, PayloadError>> {
        if raw.is_empty() {
            return None;
        }
        let fields = Fields::split(raw);
        let parsed = match fields.subtype() {
            "coordinator" => Ok(ElectionPayload::Coordinator),
            "explore" => fields.parse(1, "node UID").map(|m| ElectionPayload::Explore { m }),
            "child" => fields.parse(1, "node UID").and_then(|m| {
                let adopted = match fields.get(2)? {
                    "1" => true,
                    "0" => false,
                    _ => {
                        return Err(PayloadError::BadField {
                            payload: raw.to_string(),
                            index: 2,
                            expected: "adoption flag (0/1)",
                        })
                    }
                };
                Ok(ElectionPayload::Child { m, adopted })
            }),
            "echo" => fields.parse(1, "node UID").map(|m| ElectionPayload::Echo { m }),
            "leader" => fields.parse(1, "node UID").map(|m| ElectionPayload::Leader { m }),
            _ => return None,
        };
        Some(parsed)
    }
}

impl fmt::Display for ElectionPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionPayload::Coordinator => write!(f, "coordinator"),
            ElectionPayload::Explore { m } => write!(f, "explore;{m}"),
            ElectionPayload::Child { m, adopted } => {
                write!(f, "child;{m};{}", if *adopted { 1 } else { 0 })
            }
            ElectionPayload::Echo { m } => write!(f, "echo;{m}"),
            ElectionPayload::Leader { m } => write!(f, "leader;{m}"),
        }
    }
}

// ---------------------------------------------------------------------------
// BANKING
// ---------------------------------------------------------------------------

/// Payloads of the `BANKING` domain.
///
/// The `lc` field is the carried Lamport timestamp, rewritten at every
/// forwarding hop; `msg_id` is the 8-character flood-deduplication id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BankingPayload {
    LockRequest { lc: u64, uid: u32, req_lc: u64 },
    LockAck { lc: u64, uid: u32, req_lc: u64 },
    LockRelease { lc: u64, uid: u32, req_lc: u64 },
    TransactStart { lc: u64, msg_id: String, target: u32, balance: i64, percent: i64 },
    TransactGetBalance { lc: u64, msg_id: String, target: u32 },
    TransactBalance { lc: u64, msg_id: String, balance: i64 },
    TransactAck { lc: u64, msg_id: String },
    Marker { marker: String },
    State { marker: String, blob: String },
}

impl BankingPayload {
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        if raw.is_empty() {
            return Err(PayloadError::Empty);
        }
        let fields = Fields::split(raw);
        match fields.subtype() {
            "lockRequest" => Ok(BankingPayload::LockRequest {
                lc: fields.parse(1, "lamport timestamp")?,
                uid: fields.parse(2, "node UID")?,
                req_lc: fields.parse(3, "lamport timestamp")?,
            }),
            "lockAck" => Ok(BankingPayload::LockAck {
                lc: fields.parse(1, "lamport timestamp")?,
                uid: fields.parse(2, "node UID")?,
                req_lc: fields.parse(3, "lamport timestamp")?,
            }),
            "lockRelease" => Ok(BankingPayload::LockRelease {
                lc: fields.parse(1, "lamport timestamp")?,
                uid: fields.parse(2, "node UID")?,
                req_lc: fields.parse(3, "lamport timestamp")?,
            }),
            "transactStart" => Ok(BankingPayload::TransactStart {
                lc: fields.parse(1, "lamport timestamp")?,
                msg_id: fields.get(2)?.to_string(),
                target: fields.parse(3, "node UID")?,
                balance: fields.parse(4, "balance")?,
                percent: fields.parse(5, "percentage")?,
            }),
            "transactGetBalance" => Ok(BankingPayload::TransactGetBalance {
                lc: fields.parse(1, "lamport timestamp")?,
                msg_id: fields.get(2)?.to_string(),
                target: fields.parse(3, "node UID")?,
            }),
            "transactBalance" => Ok(BankingPayload::TransactBalance {
                lc: fields.parse(1, "lamport timestamp")?,
                msg_id: fields.get(2)?.to_string(),
                balance: fields.parse(3, "balance")?,
            }),
            "transactAck" => Ok(BankingPayload::TransactAck {
                lc: fields.parse(1, "lamport timestamp")?,
                msg_id: fields.get(2)?.to_string(),
            }),
            "marker" => Ok(BankingPayload::Marker {
                marker: fields.get(1)?.to_string(),
            }),
            "state" => Ok(BankingPayload::State {
                marker: fields.get(1)?.to_string(),
                blob: fields.get(2)?.to_string(),
            }),
            _ => Err(PayloadError::UnknownSubtype {
                domain: "BANKING",
                payload: raw.to_string(),
            }),
        }
    }

    /// The carried Lamport timestamp, for clock observation on receive.
    /// Markers and snapshot states travel outside Lamport time.
    pub fn carried_lc(&self) -> Option<u64> {
        match self {
            BankingPayload::LockRequest { lc, .. }
            | BankingPayload::LockAck { lc, .. }
            | BankingPayload::LockRelease { lc, .. }
            | BankingPayload::TransactStart { lc, .. }
            | BankingPayload::TransactGetBalance { lc, .. }
            | BankingPayload::TransactBalance { lc, .. }
            | BankingPayload::TransactAck { lc, .. } => Some(*lc),
            BankingPayload::Marker { .. } | BankingPayload::State { .. } => None,
        }
    }

    /// Rewrite the carried Lamport timestamp for the next hop.
    pub fn set_lc(&mut self, new_lc: u64) {
        match self {
            BankingPayload::LockRequest { lc, .. }
            | BankingPayload::LockAck { lc, .. }
            | BankingPayload::LockRelease { lc, .. }
            | BankingPayload::TransactStart { lc, .. }
            | BankingPayload::TransactGetBalance { lc, .. }
            | BankingPayload::TransactBalance { lc, .. }
            | BankingPayload::TransactAck { lc, .. } => *lc = new_lc,
            BankingPayload::Marker { .. } | BankingPayload::State { .. } => {}
        }
    }

    /// Flood-deduplication id, present on all flooded transaction messages.
    pub fn msg_id(&self) -> Option<&str> {
        match self {
            BankingPayload::TransactStart { msg_id, .. }
            | BankingPayload::TransactGetBalance { msg_id, .. }
            | BankingPayload::TransactBalance { msg_id, .. }
            | BankingPayload::TransactAck { msg_id, .. } => Some(msg_id),
            _ => None,
        }
    }
}

impl fmt::Display for BankingPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BankingPayload::LockRequest { lc, uid, req_lc } => {
                write!(f, "lockRequest;{lc};{uid};{req_lc}")
            }
            BankingPayload::LockAck { lc, uid, req_lc } => {
                write!(f, "lockAck;{lc};{uid};{req_lc}")
            }
            BankingPayload::LockRelease { lc, uid, req_lc } => {
                write!(f, "lockRelease;{lc};{uid};{req_lc}")
            }
            BankingPayload::TransactStart { lc, msg_id, target, balance, percent } => {
                write!(f, "transactStart;{lc};{msg_id};{target};{balance};{percent}")
            }
            BankingPayload::TransactGetBalance { lc, msg_id, target } => {
                write!(f, "transactGetBalance;{lc};{msg_id};{target}")
            }
            BankingPayload::TransactBalance { lc, msg_id, balance } => {
                write!(f, "transactBalance;{lc};{msg_id};{balance}")
            }
            BankingPayload::TransactAck { lc, msg_id } => {
                write!(f, "transactAck;{lc};{msg_id}")
            }
            BankingPayload::Marker { marker } => write!(f, "marker;{marker}"),
            BankingPayload::State { marker, blob } => write!(f, "state;{marker};{blob}"),
        }
    }
}

// ---------------------------------------------------------------------------
// CONSENSUS
// ---------------------------------------------------------------------------

/// Payloads of the `CONSENSUS` domain. A `timestamp` of −1 in `Collect` is
/// the disagreement sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusPayload {
    VoteBegin,
    Proposal { t: i64 },
    ProposalResponse { t: i64 },
    StateRequest { sid: String },
    StateResponse { sid: String, active: bool, msg_in: u64, msg_out: u64 },
    CollectRequest { rid: String },
    Collect { rid: String, agreement: bool, timestamp: i64 },
}

impl ConsensusPayload {
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        if raw.is_empty() {
            return Err(PayloadError::Empty);
        }
        let fields = Fields::split(raw);
        match fields.subtype() {
            "voteBegin" => Ok(ConsensusPayload::VoteBegin),
            "proposal" => Ok(ConsensusPayload::Proposal {
                t: fields.parse(1, "discrete timestamp")?,
            }),
            "proposalResponse" => Ok(ConsensusPayload::ProposalResponse {
                t: fields.parse(1, "discrete timestamp")?,
            }),
            "stateRequest" => Ok(ConsensusPayload::StateRequest {
                sid: fields.get(1)?.to_string(),
            }),
            "stateResponse" => Ok(ConsensusPayload::StateResponse {
                sid: fields.get(1)?.to_string(),
                active: fields.bool(2)?,
                msg_in: fields.parse(3, "message counter")?,
                msg_out: fields.parse(4, "message counter")?,
            }),
            "collectRequest" => Ok(ConsensusPayload::CollectRequest {
                rid: fields.get(1)?.to_string(),
            }),
            "collect" => Ok(ConsensusPayload::Collect {
                rid: fields.get(1)?.to_string(),
                agreement: fields.bool(2)?,
                timestamp: fields.parse(3, "discrete timestamp")?,
            }),
            _ => Err(PayloadError::UnknownSubtype {
                domain: "CONSENSUS",
                payload: raw.to_string(),
            }),
        }
    }
}

impl fmt::Display for ConsensusPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusPayload::VoteBegin => write!(f, "voteBegin"),
            ConsensusPayload::Proposal { t } => write!(f, "proposal;{t}"),
            ConsensusPayload::ProposalResponse { t } => write!(f, "proposalResponse;{t}"),
            ConsensusPayload::StateRequest { sid } => write!(f, "stateRequest;{sid}"),
            ConsensusPayload::StateResponse { sid, active, msg_in, msg_out } => {
                write!(f, "stateResponse;{sid};{active};{msg_in};{msg_out}")
            }
            ConsensusPayload::CollectRequest { rid } => write!(f, "collectRequest;{rid}"),
            ConsensusPayload::Collect { rid, agreement, timestamp } => {
                write!(f, "collect;{rid};{agreement};{timestamp}")
            }
        }
    }
}
