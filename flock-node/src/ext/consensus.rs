// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! The `CONSENSUS` extension: randomised alignment on a discrete timestamp
//! combined with double-counting termination detection.
//!
//! Every node boots with a random timestamp `t_k` and a bounded budget of
//! accepted vote rounds. The elected leader seeds the alignment by sending
//! `voteBegin` to random neighbours; proposals then cascade through random
//! fan-outs, each acceptance averaging the two timestamps upward. The
//! leader detects quiescence by collecting `(active, msg_in, msg_out)`
//! aggregates over the spanning tree twice: two consecutive balanced and
//! identical aggregates mean the alignment traffic has drained. A final
//! collect wave folds every node's timestamp into one
//! `(agreement, timestamp)` verdict.

use crate::election::Election;
use crate::engine::{Extension, NodeContext};
use crate::error::{ProtocolError, Result};
use crate::payload::ConsensusPayload;
use async_trait::async_trait;
use flock_wire::message::short_id;
use flock_wire::{Message, MessageType};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tuning knobs of the alignment protocol, set from the command line.
#[derive(Debug, Clone, Copy)]
pub struct ConsensusKnobs {
    /// `s`: how many random neighbours the leader seeds with `voteBegin`.
    pub vote_initiators: usize,
    /// `m`: upper bound of the initial discrete timestamp, `t_k ∈ [1, m]`.
    pub timestamp_range: i64,
    /// `p`: random fan-out of every proposal cascade.
    pub proposal_fanout: usize,
    /// `aMax`: how many proposals a node accepts before going silent.
    pub max_accepted: u32,
}

impl Default for ConsensusKnobs {
    fn default() -> Self {
        Self {
            vote_initiators: 2,
            timestamp_range: 10,
            proposal_fanout: 2,
            max_accepted: 3,
        }
    }
}

/// Alignment traffic counters for double counting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Traffic {
    active: bool,
    msg_in: u64,
    msg_out: u64,
}

impl Traffic {
    fn fold(&mut self, other: Traffic) {
        self.active = self.active || other.active;
        self.msg_in += other.msg_in;
        self.msg_out += other.msg_out;
    }

    fn balanced(&self) -> bool {
        self.msg_in == self.msg_out
    }
}

/// Accumulated `(agreement, timestamp)` verdict of a collect round.
#[derive(Debug, Clone, Copy)]
struct ResultAccumulator {
    agreement: bool,
    timestamp: i64,
}

impl ResultAccumulator {
    fn new() -> Self {
        Self { agreement: true, timestamp: -1 }
    }

    /// Fold one report in. Agreement requires every reported timestamp to
    /// coincide; disagreement clears the timestamp to the −1 sentinel.
    fn fold(&mut self, agreement: bool, timestamp: i64) {
        self.agreement = self.agreement && agreement;
        if self.timestamp != -1 && timestamp != -1 && timestamp != self.timestamp {
            self.agreement = false;
        } else if self.timestamp == -1 {
            self.timestamp = timestamp;
        }
        if !self.agreement {
            self.timestamp = -1;
        }
    }
}

struct ConsensusState {
    election: Election,

    // Alignment.
    t_k: i64,
    a_current: u32,

    // This node's own traffic counters.
    traffic: Traffic,

    // Echo bookkeeping per detection/collect round: responses received.
    echo: HashMap<String, usize>,
    acc_state: HashMap<String, Traffic>,
    acc_state_done: HashSet<String>,
    acc_result: HashMap<String, ResultAccumulator>,
    acc_result_done: HashSet<String>,

    /// The leader's verdict after its collect round finished.
    final_result: Option<(bool, i64)>,
}

struct ConsensusCore {
    knobs: ConsensusKnobs,
    state: Mutex<ConsensusState>,
    rng: parking_lot::Mutex<StdRng>,
}

/// The `CONSENSUS` extension.
pub struct ConsensusExtension {
    core: Arc<ConsensusCore>,
}

impl ConsensusExtension {
    /// Boot with a random leader-candidacy coin and a random `t_k`.
    pub fn new(knobs: ConsensusKnobs) -> Self {
        let mut rng = StdRng::from_entropy();
        let want_leader = rng.gen_bool(0.5);
        let t_k = rng.gen_range(1..=knobs.timestamp_range.max(1));
        info!(want_leader, t_k, "consensus extension booted");
        Self::with_profile(knobs, want_leader, t_k)
    }

    /// Boot with fixed parameters; used by tests and reproducible runs.
    pub fn with_profile(knobs: ConsensusKnobs, want_leader: bool, t_k: i64) -> Self {
        Self {
            core: Arc::new(ConsensusCore {
                knobs,
                state: Mutex::new(ConsensusState {
                    election: Election::new(MessageType::Consensus, want_leader),
                    t_k,
                    a_current: 0,
                    traffic: Traffic::default(),
                    echo: HashMap::new(),
                    acc_state: HashMap::new(),
                    acc_state_done: HashSet::new(),
                    acc_result: HashMap::new(),
                    acc_result_done: HashSet::new(),
                    final_result: None,
                }),
                rng: parking_lot::Mutex::new(StdRng::from_entropy()),
            }),
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.core.state.lock().await.election.is_leader()
    }

    pub async fn leader_uid(&self) -> u32 {
        self.core.state.lock().await.election.leader_uid()
    }

    pub async fn parent_uid(&self) -> u32 {
        self.core.state.lock().await.election.parent_uid()
    }

    pub async fn child_uids(&self) -> Vec<u32> {
        self.core.state.lock().await.election.child_uids().to_vec()
    }

    /// This node's current discrete timestamp.
    pub async fn timestamp(&self) -> i64 {
        self.core.state.lock().await.t_k
    }

    /// Accepted-proposal count so far.
    pub async fn accepted_rounds(&self) -> u32 {
        self.core.state.lock().await.a_current
    }

    /// The leader's `(agreement, timestamp)` verdict, once collected.
    pub async fn final_result(&self) -> Option<(bool, i64)> {
        self.core.state.lock().await.final_result
    }

    /// Seed the alignment: `voteBegin` to up to `s` random neighbours.
    /// Leader only.
    pub async fn begin_vote(&self, ctx: &NodeContext) -> Result<()> {
        let mut st = self.core.state.lock().await;
        if !st.election.is_leader() {
            return Err(ProtocolError::invariant("voteBegin initiation requires the leader"));
        }
        self.core.seed_vote(ctx, &mut st).await;
        Ok(())
    }

    /// Start one double-counting round over the tree. Leader only; returns
    /// the round id.
    pub async fn begin_state_round(&self, ctx: &NodeContext) -> Result<String> {
        let mut st = self.core.state.lock().await;
        if !st.election.is_leader() {
            return Err(ProtocolError::invariant("state collection requires the leader"));
        }
        Ok(self.core.start_state_round(ctx, &mut st).await)
    }

    /// Whether a double-counting round has fully folded at the leader.
    pub async fn state_round_done(&self, sid: &str) -> bool {
        self.core.state.lock().await.acc_state_done.contains(sid)
    }

    /// The accumulated `(active, msg_in, msg_out)` of a finished round.
    pub async fn state_round_aggregate(&self, sid: &str) -> Option<(bool, u64, u64)> {
        self.core
            .state
            .lock()
            .await
            .acc_state
            .get(sid)
            .map(|traffic| (traffic.active, traffic.msg_in, traffic.msg_out))
    }

    /// Start the final result collection. Leader only; returns the round id.
    pub async fn begin_collect_round(&self, ctx: &NodeContext) -> Result<String> {
        let mut st = self.core.state.lock().await;
        if !st.election.is_leader() {
            return Err(ProtocolError::invariant("result collection requires the leader"));
        }
        Ok(self.core.start_collect_round(ctx, &mut st).await)
    }
}

#[async_trait]
impl Extension for ConsensusExtension {
    fn message_type(&self) -> MessageType {
        MessageType::Consensus
    }

    async fn preflight(&self, ctx: Arc<NodeContext>) -> Result<()> {
        let core = Arc::clone(&self.core);
        tokio::spawn(async move { core.leader_loop(ctx).await });
        Ok(())
    }

    async fn handle(&self, ctx: &NodeContext, msg: &Message) -> Result<()> {
        self.core.handle(ctx, msg).await
    }
}

impl ConsensusCore {
    async fn handle(&self, ctx: &NodeContext, msg: &Message) -> Result<()> {
        let mut st = self.state.lock().await;

        if let Some(result) = st.election.try_handle(ctx, msg).await {
            return result;
        }

        match ConsensusPayload::parse(&msg.payload)? {
            ConsensusPayload::VoteBegin => self.handle_vote_begin(ctx, &mut st).await,
            ConsensusPayload::Proposal { t } => {
                self.handle_proposal(ctx, &mut st, msg.src_uid, t).await
            }
            ConsensusPayload::ProposalResponse { t } => {
                self.handle_proposal_response(ctx, &mut st, t).await
            }
            ConsensusPayload::StateRequest { sid } => {
                self.handle_state_request(ctx, &mut st, msg, sid).await
            }
            ConsensusPayload::StateResponse { sid, active, msg_in, msg_out } => {
                self.handle_state_response(ctx, &mut st, sid, active, msg_in, msg_out).await
            }
            ConsensusPayload::CollectRequest { rid } => {
                self.handle_collect_request(ctx, &mut st, msg, rid).await
            }
            ConsensusPayload::Collect { rid, agreement, timestamp } => {
                self.handle_collect(ctx, &mut st, rid, agreement, timestamp).await
            }
        }
    }

    // ---- Alignment ---------------------------------------------------

    /// Pick up to `wanted` distinct neighbours uniformly.
    fn sample_neighbours(&self, ctx: &NodeContext, wanted: usize) -> Vec<u32> {
        let peers: Vec<u32> = ctx.neighbourhood.neighbours().map(|(uid, _)| uid).collect();
        let count = wanted.min(peers.len());
        if count < wanted {
            debug!(
                uid = ctx.uid,
                wanted,
                available = peers.len(),
                "capping fan-out at neighbour count"
            );
        }
        let mut rng = self.rng.lock();
        index::sample(&mut *rng, peers.len(), count)
            .into_iter()
            .map(|i| peers[i])
            .collect()
    }

    async fn seed_vote(&self, ctx: &NodeContext, st: &mut ConsensusState) {
        let targets = self.sample_neighbours(ctx, self.knobs.vote_initiators);
        let vote_begin = Message::new(ctx.uid, MessageType::Consensus, ConsensusPayload::VoteBegin.to_string());
        for peer in targets {
            info!(uid = ctx.uid, peer, "sending voteBegin");
            match ctx.send_to(peer, vote_begin.clone()).await {
                Ok(()) => st.traffic.msg_out += 1,
                Err(err) => warn!(uid = ctx.uid, peer, error = %err, "voteBegin failed"),
            }
        }
    }

    async fn send_proposals(&self, ctx: &NodeContext, st: &mut ConsensusState) {
        let targets = self.sample_neighbours(ctx, self.knobs.proposal_fanout);
        let proposal =
            Message::new(ctx.uid, MessageType::Consensus, ConsensusPayload::Proposal { t: st.t_k }.to_string());
        for peer in targets {
            match ctx.send_to(peer, proposal.clone()).await {
                Ok(()) => st.traffic.msg_out += 1,
                Err(err) => warn!(uid = ctx.uid, peer, error = %err, "proposal failed"),
            }
        }
    }

    async fn handle_vote_begin(&self, ctx: &NodeContext, st: &mut ConsensusState) -> Result<()> {
        info!(uid = ctx.uid, "start voting");
        st.traffic.msg_in += 1;
        self.send_proposals(ctx, st).await;
        Ok(())
    }

    async fn handle_proposal(
        &self,
        ctx: &NodeContext,
        st: &mut ConsensusState,
        src: u32,
        t: i64,
    ) -> Result<()> {
        st.traffic.msg_in += 1;

        if st.a_current >= self.knobs.max_accepted {
            info!(uid = ctx.uid, "not accepting further proposals");
            return Ok(());
        }
        st.a_current += 1;

        // Meet in the middle, rounding up.
        let aligned = (t + st.t_k + 1) / 2;
        info!(uid = ctx.uid, old = st.t_k, new = aligned, "aligned discrete timestamp");
        st.t_k = aligned;

        let response = Message::new(
            ctx.uid,
            MessageType::Consensus,
            ConsensusPayload::ProposalResponse { t: st.t_k }.to_string(),
        );
        match ctx.send_to(src, response).await {
            Ok(()) => st.traffic.msg_out += 1,
            Err(err) => warn!(uid = ctx.uid, peer = src, error = %err, "proposalResponse failed"),
        }

        self.send_proposals(ctx, st).await;
        Ok(())
    }

    async fn handle_proposal_response(
        &self,
        ctx: &NodeContext,
        st: &mut ConsensusState,
        t: i64,
    ) -> Result<()> {
        st.traffic.msg_in += 1;
        info!(uid = ctx.uid, old = st.t_k, new = t, "adopting agreed timestamp");
        st.t_k = t;
        Ok(())
    }

    // ---- Double counting ---------------------------------------------

    async fn start_state_round(&self, ctx: &NodeContext, st: &mut ConsensusState) -> String {
        let sid = short_id();
        info!(uid = ctx.uid, sid, "starting state collection round");
        st.echo.insert(sid.clone(), 0);
        st.acc_state.insert(sid.clone(), Traffic::default());

        let request = Message::new(
            ctx.uid,
            MessageType::Consensus,
            ConsensusPayload::StateRequest { sid: sid.clone() }.to_string(),
        );
        st.election.propagate_children(ctx, &request).await;

        // A childless initiator folds immediately.
        self.state_return(ctx, st, &sid).await;
        sid
    }

    async fn handle_state_request(
        &self,
        ctx: &NodeContext,
        st: &mut ConsensusState,
        msg: &Message,
        sid: String,
    ) -> Result<()> {
        if !st.election.complete() {
            return Err(ProtocolError::invariant("state request with no leader in the network"));
        }
        if st.echo.contains_key(&sid) {
            return Err(ProtocolError::invariant(format!(
                "state request {sid} already exists"
            )));
        }
        st.echo.insert(sid.clone(), 0);
        st.acc_state.insert(sid.clone(), Traffic::default());

        st.election.propagate_children(ctx, msg).await;

        // Leaf nodes respond on the spot.
        self.state_return(ctx, st, &sid).await;
        Ok(())
    }

    async fn handle_state_response(
        &self,
        ctx: &NodeContext,
        st: &mut ConsensusState,
        sid: String,
        active: bool,
        msg_in: u64,
        msg_out: u64,
    ) -> Result<()> {
        if !st.election.complete() {
            return Err(ProtocolError::invariant("state response with no leader in the network"));
        }
        let Some(count) = st.echo.get_mut(&sid) else {
            return Err(ProtocolError::invariant(format!("state request {sid} does not exist")));
        };
        *count += 1;
        let Some(aggregate) = st.acc_state.get_mut(&sid) else {
            return Err(ProtocolError::invariant(format!("state aggregate {sid} not initialised")));
        };
        aggregate.fold(Traffic { active, msg_in, msg_out });

        self.state_return(ctx, st, &sid).await;
        Ok(())
    }

    /// Once every child reported, fold the own counters and either finish
    /// (leader) or report to the parent.
    async fn state_return(&self, ctx: &NodeContext, st: &mut ConsensusState, sid: &str) {
        let received = st.echo.get(sid).copied().unwrap_or(0);
        if received != st.election.child_uids().len() {
            return;
        }
        let own = st.traffic;
        let Some(aggregate) = st.acc_state.get_mut(sid) else {
            return;
        };
        aggregate.fold(own);
        let aggregate = *aggregate;

        if st.election.is_leader() {
            info!(
                uid = ctx.uid,
                sid,
                active = aggregate.active,
                msg_in = aggregate.msg_in,
                msg_out = aggregate.msg_out,
                "state round complete"
            );
            st.acc_state_done.insert(sid.to_string());
        } else {
            debug!(uid = ctx.uid, sid, parent = st.election.parent_uid(), "reporting accumulated state");
            let response = Message::new(
                ctx.uid,
                MessageType::Consensus,
                ConsensusPayload::StateResponse {
                    sid: sid.to_string(),
                    active: aggregate.active,
                    msg_in: aggregate.msg_in,
                    msg_out: aggregate.msg_out,
                }
                .to_string(),
            );
            ctx.send_or_log(st.election.parent_uid(), response).await;
        }
    }

    // ---- Result collection -------------------------------------------

    async fn start_collect_round(&self, ctx: &NodeContext, st: &mut ConsensusState) -> String {
        let rid = short_id();
        info!(uid = ctx.uid, rid, "starting result collection round");
        st.echo.insert(rid.clone(), 0);
        st.acc_result.insert(rid.clone(), ResultAccumulator::new());

        let request = Message::new(
            ctx.uid,
            MessageType::Consensus,
            ConsensusPayload::CollectRequest { rid: rid.clone() }.to_string(),
        );
        st.election.propagate_children(ctx, &request).await;

        self.result_return(ctx, st, &rid).await;
        rid
    }

    async fn handle_collect_request(
        &self,
        ctx: &NodeContext,
        st: &mut ConsensusState,
        msg: &Message,
        rid: String,
    ) -> Result<()> {
        if !st.election.complete() {
            return Err(ProtocolError::invariant("collect request with no leader in the network"));
        }
        if st.echo.contains_key(&rid) {
            return Err(ProtocolError::invariant(format!(
                "collect request {rid} already exists"
            )));
        }
        st.echo.insert(rid.clone(), 0);
        st.acc_result.insert(rid.clone(), ResultAccumulator::new());

        st.election.propagate_children(ctx, msg).await;

        self.result_return(ctx, st, &rid).await;
        Ok(())
    }

    async fn handle_collect(
        &self,
        ctx: &NodeContext,
        st: &mut ConsensusState,
        rid: String,
        agreement: bool,
        timestamp: i64,
    ) -> Result<()> {
        if !st.election.complete() {
            return Err(ProtocolError::invariant("collect report with no leader in the network"));
        }
        let Some(count) = st.echo.get_mut(&rid) else {
            return Err(ProtocolError::invariant(format!("collect request {rid} does not exist")));
        };
        *count += 1;
        let Some(accumulator) = st.acc_result.get_mut(&rid) else {
            return Err(ProtocolError::invariant(format!(
                "collect accumulator {rid} not initialised"
            )));
        };
        accumulator.fold(agreement, timestamp);

        self.result_return(ctx, st, &rid).await;
        Ok(())
    }

    async fn result_return(&self, ctx: &NodeContext, st: &mut ConsensusState, rid: &str) {
        let received = st.echo.get(rid).copied().unwrap_or(0);
        if received != st.election.child_uids().len() {
            return;
        }
        let own_timestamp = st.t_k;
        let Some(accumulator) = st.acc_result.get_mut(rid) else {
            return;
        };
        accumulator.fold(true, own_timestamp);
        let accumulator = *accumulator;

        if st.election.is_leader() {
            info!(
                uid = ctx.uid,
                rid,
                agreement = accumulator.agreement,
                timestamp = accumulator.timestamp,
                "final result collected"
            );
            st.acc_result_done.insert(rid.to_string());
            st.final_result = Some((accumulator.agreement, accumulator.timestamp));
        } else {
            debug!(uid = ctx.uid, rid, parent = st.election.parent_uid(), "reporting accumulated result");
            let report = Message::new(
                ctx.uid,
                MessageType::Consensus,
                ConsensusPayload::Collect {
                    rid: rid.to_string(),
                    agreement: accumulator.agreement,
                    timestamp: accumulator.timestamp,
                }
                .to_string(),
            );
            ctx.send_or_log(st.election.parent_uid(), report).await;
        }
    }

    // ---- Leader worker -----------------------------------------------

    async fn leader_loop(self: Arc<Self>, ctx: Arc<NodeContext>) {
        // Wait out the election.
        loop {
            if !ctx.sleep_unless_shutdown(Duration::from_millis(50)).await {
                return;
            }
            let st = self.state.lock().await;
            if st.election.complete() {
                if !st.election.is_leader() {
                    info!(uid = ctx.uid, "lost the election (consensus)");
                    return;
                }
                break;
            }
        }
        info!(uid = ctx.uid, "this node is now leader (consensus)");

        {
            let mut st = self.state.lock().await;
            self.seed_vote(&ctx, &mut st).await;
        }

        // Double counting until two consecutive aggregates are balanced and
        // identical.
        let mut previous: Option<String> = None;
        let mut current: Option<String> = None;
        loop {
            if !ctx.sleep_unless_shutdown(Duration::from_secs(1)).await {
                return;
            }
            let mut st = self.state.lock().await;

            if let Some(sid) = &current {
                if !st.acc_state_done.contains(sid) {
                    info!(uid = ctx.uid, sid, "waiting for state round");
                    continue;
                }
            }

            let converged = match (&previous, &current) {
                (Some(prev), Some(curr))
                    if st.acc_state_done.contains(prev) && st.acc_state_done.contains(curr) =>
                {
                    let prev_state = st.acc_state[prev];
                    let curr_state = st.acc_state[curr];
                    prev_state.balanced() && curr_state.balanced() && prev_state == curr_state
                }
                _ => false,
            };
            if converged {
                info!(uid = ctx.uid, "state converged, alignment traffic quiesced");
                break;
            }

            previous = current.take();
            current = Some(self.start_state_round(&ctx, &mut st).await);
        }

        // Collect the verdict.
        let rid = {
            let mut st = self.state.lock().await;
            self.start_collect_round(&ctx, &mut st).await
        };
        loop {
            if !ctx.sleep_unless_shutdown(Duration::from_secs(1)).await {
                return;
            }
            let st = self.state.lock().await;
            if st.acc_result_done.contains(&rid) {
                if let Some((agreement, timestamp)) = st.final_result {
                    info!(uid = ctx.uid, agreement, timestamp, "consensus verdict");
                }
                break;
            }
            info!(uid = ctx.uid, rid, "waiting for collect result");
        }
        info!(uid = ctx.uid, "consensus leader exited");
    }
}
