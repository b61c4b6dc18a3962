// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! The `BANKING` extension: distributed transactions under Lamport mutual
//! exclusion, with Chandy-Lamport snapshots driven by the banking leader.
//!
//! Lock traffic travels along the spanning tree established by the leader
//! election; transaction traffic floods the communication graph with
//! msg-id deduplication. Every forwarded hop rewrites the carried Lamport
//! timestamp from the local clock.
//!
//! Two workers run per node: the transaction loop (every node) and the
//! snapshot rotation loop (leader only).

use crate::election::Election;
use crate::engine::{Extension, NodeContext};
use crate::error::{ProtocolError, Result};
use crate::ext::snapshot::SnapshotRecord;
use crate::lamport::{LamportClock, LamportQueue};
use crate::payload::BankingPayload;
use async_trait::async_trait;
use flock_wire::message::short_id;
use flock_wire::{Message, MessageType};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Mutable banking state, serialised behind one lock shared by the inbound
/// handler and the worker loops.
struct BankingState {
    election: Election,
    balance: i64,

    // Lamport mutual exclusion.
    lock_active: bool,
    lock_ack_counter: usize,
    /// Timestamp of this node's outstanding lock request, if any.
    pending_req_lc: Option<u64>,

    // In-flight transaction bookkeeping on the initiator.
    rand_p: i64,
    ack_received: bool,
    balance_received: bool,

    /// Flood deduplication: msg-ids this node has consumed or forwarded.
    known: HashSet<String>,

    // Chandy-Lamport snapshots.
    snapshots: HashMap<String, SnapshotRecord>,
    received_snapshots: HashMap<String, Vec<SnapshotRecord>>,
}

struct BankingCore {
    state: Mutex<BankingState>,
    clock: LamportClock,
    queue: LamportQueue,
    rng: parking_lot::Mutex<StdRng>,
}

/// The `BANKING` extension.
pub struct BankingExtension {
    core: Arc<BankingCore>,
}

impl BankingExtension {
    /// Boot with a random leader-candidacy coin and a random balance, the
    /// way production nodes start.
    pub fn new() -> Self {
        let mut rng = StdRng::from_entropy();
        let want_leader = rng.gen_bool(0.5);
        let balance = rng.gen_range(0..100_000);
        info!(want_leader, balance, "banking extension booted");
        Self::with_profile(want_leader, balance)
    }

    /// Boot with fixed parameters; used by tests and reproducible runs.
    pub fn with_profile(want_leader: bool, balance: i64) -> Self {
        Self {
            core: Arc::new(BankingCore {
                state: Mutex::new(BankingState {
                    election: Election::new(MessageType::Banking, want_leader),
                    balance,
                    lock_active: false,
                    lock_ack_counter: 0,
                    pending_req_lc: None,
                    rand_p: 0,
                    ack_received: false,
                    balance_received: false,
                    known: HashSet::new(),
                    snapshots: HashMap::new(),
                    received_snapshots: HashMap::new(),
                }),
                clock: LamportClock::new(),
                queue: LamportQueue::new(),
                rng: parking_lot::Mutex::new(StdRng::from_entropy()),
            }),
        }
    }

    pub fn clock(&self) -> &LamportClock {
        &self.core.clock
    }

    pub fn queue(&self) -> &LamportQueue {
        &self.core.queue
    }

    pub async fn balance(&self) -> i64 {
        self.core.state.lock().await.balance
    }

    pub async fn lock_active(&self) -> bool {
        self.core.state.lock().await.lock_active
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

    /// Snapshot records collected by the leader for `marker`.
    pub async fn collected_snapshots(&self, marker: &str) -> usize {
        self.core
            .state
            .lock()
            .await
            .received_snapshots
            .get(marker)
            .map_or(0, Vec::len)
    }

    /// Request the distributed lock: tick the clock, queue the request
    /// locally and announce it along the spanning tree. Returns the request
    /// timestamp the caller releases with.
    pub async fn request_lock(&self, ctx: &NodeContext) -> Result<u64> {
        self.core.request_lock(ctx).await
    }

    /// Leave the critical section: pop the own queue head, announce the
    /// release and ack whoever queues next.
    pub async fn release_lock(&self, ctx: &NodeContext, req_lc: u64) -> Result<()> {
        self.core.release_lock(ctx, req_lc).await
    }

    /// Flood the two transaction messages at `target`. The caller must hold
    /// the distributed lock.
    pub async fn start_transaction(&self, ctx: &NodeContext, target: u32, percent: i64) {
        self.core.start_transaction(ctx, target, percent).await;
    }

    /// Whether both the balance reply and the ack of the in-flight
    /// transaction have arrived.
    pub async fn transaction_settled(&self) -> bool {
        let st = self.core.state.lock().await;
        st.ack_received && st.balance_received
    }

    /// Start one snapshot round. Leader only; returns the fresh marker id.
    pub async fn begin_snapshot(&self, ctx: &NodeContext) -> Result<String> {
        self.core.begin_snapshot(ctx).await
    }
}

impl Default for BankingExtension {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for BankingExtension {
    fn message_type(&self) -> MessageType {
        MessageType::Banking
    }

    async fn preflight(&self, ctx: Arc<NodeContext>) -> Result<()> {
        let core = Arc::clone(&self.core);
        let worker_ctx = Arc::clone(&ctx);
        tokio::spawn(async move { core.transaction_loop(worker_ctx).await });

        let core = Arc::clone(&self.core);
        tokio::spawn(async move { core.snapshot_loop(ctx).await });
        Ok(())
    }

    async fn handle(&self, ctx: &NodeContext, msg: &Message) -> Result<()> {
        self.core.handle(ctx, msg).await
    }
}

impl BankingCore {
    async fn handle(&self, ctx: &NodeContext, msg: &Message) -> Result<()> {
        let mut st = self.state.lock().await;

        // Election traffic travels outside Lamport time.
        if let Some(result) = st.election.try_handle(ctx, msg).await {
            return result;
        }

        let payload = BankingPayload::parse(&msg.payload)?;
        match &payload {
            BankingPayload::Marker { marker } => {
                return self.handle_marker(ctx, &mut st, msg.src_uid, marker.clone()).await;
            }
            BankingPayload::State { marker, blob } => {
                return self
                    .handle_state(ctx, &mut st, msg, marker.clone(), blob.clone())
                    .await;
            }
            _ => {}
        }

        if let Some(lc) = payload.carried_lc() {
            self.clock.observe(lc);
        }

        // Channel recording: every data message lands in each snapshot whose
        // channel from the sender is still open.
        for snapshot in st.snapshots.values_mut() {
            snapshot.record(msg.src_uid, msg);
        }

        match payload {
            BankingPayload::LockRequest { uid, req_lc, .. } => {
                self.handle_lock_request(ctx, &mut st, msg.src_uid, uid, req_lc).await
            }
            BankingPayload::LockAck { lc, uid, req_lc } => {
                self.handle_lock_ack(ctx, &mut st, msg.src_uid, lc, uid, req_lc).await
            }
            BankingPayload::LockRelease { uid, req_lc, .. } => {
                self.handle_lock_release(ctx, &mut st, msg.src_uid, uid, req_lc).await
            }
            BankingPayload::TransactStart { msg_id, target, balance, percent, .. } => {
                self.handle_transact_start(ctx, &mut st, msg.src_uid, msg_id, target, balance, percent)
                    .await
            }
            BankingPayload::TransactGetBalance { msg_id, target, .. } => {
                self.handle_transact_get_balance(ctx, &mut st, msg.src_uid, msg_id, target).await
            }
            BankingPayload::TransactBalance { msg_id, balance, .. } => {
                self.handle_transact_balance(ctx, &mut st, msg.src_uid, msg_id, balance).await
            }
            BankingPayload::TransactAck { msg_id, .. } => {
                self.handle_transact_ack(ctx, &mut st, msg.src_uid, msg_id).await
            }
            BankingPayload::Marker { .. } | BankingPayload::State { .. } => unreachable!(),
        }
    }

    // ---- Lamport mutual exclusion ------------------------------------

    async fn handle_lock_request(
        &self,
        ctx: &NodeContext,
        st: &mut BankingState,
        src: u32,
        uid: u32,
        req_lc: u64,
    ) -> Result<()> {
        let became_head = self.queue.add(req_lc, uid)?;
        if became_head {
            self.distribute_tree(ctx, st, BankingPayload::LockAck { lc: 0, uid, req_lc }, None)
                .await;
        }
        // Everyone on the tree gets to see the request.
        self.distribute_tree(
            ctx,
            st,
            BankingPayload::LockRequest { lc: 0, uid, req_lc },
            Some(src),
        )
        .await;
        Ok(())
    }

    async fn handle_lock_ack(
        &self,
        ctx: &NodeContext,
        st: &mut BankingState,
        src: u32,
        hop_lc: u64,
        uid: u32,
        req_lc: u64,
    ) -> Result<()> {
        if uid != ctx.uid {
            self.distribute_tree(ctx, st, BankingPayload::LockAck { lc: 0, uid, req_lc }, Some(src))
                .await;
            return Ok(());
        }

        // An ack counts only for the outstanding request, and only if it
        // causally follows it.
        if st.pending_req_lc == Some(req_lc) && hop_lc > req_lc {
            st.lock_ack_counter += 1;
        }
        self.maybe_activate_lock(ctx, st);
        Ok(())
    }

    /// The critical section opens once every other node has acked the
    /// outstanding request *and* that request heads the local queue.
    fn maybe_activate_lock(&self, ctx: &NodeContext, st: &mut BankingState) {
        let Some(pending) = st.pending_req_lc else {
            return;
        };
        if st.lock_active {
            return;
        }
        let others = ctx.neighbourhood.cluster_size().saturating_sub(1);
        if st.lock_ack_counter >= others && self.queue.peek() == Some((pending, ctx.uid)) {
            st.lock_active = true;
            info!(uid = ctx.uid, req_lc = pending, "mutex lock active on this node");
        } else {
            debug!(
                uid = ctx.uid,
                acks = st.lock_ack_counter,
                others,
                "lock not yet available"
            );
        }
    }

    async fn handle_lock_release(
        &self,
        ctx: &NodeContext,
        st: &mut BankingState,
        src: u32,
        uid: u32,
        req_lc: u64,
    ) -> Result<()> {
        let Some((head_lc, head_uid)) = self.queue.pop() else {
            return Err(ProtocolError::invariant("lockRelease with an empty queue"));
        };
        if head_lc != req_lc || head_uid != uid {
            return Err(ProtocolError::invariant(format!(
                "lockRelease {req_lc}@{uid} does not match queue head {head_lc}@{head_uid}"
            )));
        }

        if let Some((next_lc, next_uid)) = self.queue.peek() {
            self.distribute_tree(
                ctx,
                st,
                BankingPayload::LockAck { lc: 0, uid: next_uid, req_lc: next_lc },
                None,
            )
            .await;
        }
        self.distribute_tree(
            ctx,
            st,
            BankingPayload::LockRelease { lc: 0, uid, req_lc },
            Some(src),
        )
        .await;

        // The departing head may have been the only thing between this
        // node's own request and the lock.
        self.maybe_activate_lock(ctx, st);
        Ok(())
    }

    async fn request_lock(&self, ctx: &NodeContext) -> Result<u64> {
        let req_lc = self.clock.tick();
        let mut st = self.state.lock().await;
        st.lock_ack_counter = 0;
        st.lock_active = false;
        st.pending_req_lc = Some(req_lc);
        self.queue.add(req_lc, ctx.uid)?;
        // Alone in the cluster there is nobody to ask.
        self.maybe_activate_lock(ctx, &mut st);
        self.distribute_tree(
            ctx,
            &st,
            BankingPayload::LockRequest { lc: 0, uid: ctx.uid, req_lc },
            None,
        )
        .await;
        debug!(uid = ctx.uid, req_lc, "lock requested");
        Ok(req_lc)
    }

    async fn release_lock(&self, ctx: &NodeContext, req_lc: u64) -> Result<()> {
        let mut st = self.state.lock().await;
        match self.queue.pop() {
            Some((head_lc, head_uid)) if head_lc == req_lc && head_uid == ctx.uid => {}
            other => {
                return Err(ProtocolError::invariant(format!(
                    "releasing {req_lc}@{} but queue head was {other:?}",
                    ctx.uid
                )))
            }
        }
        st.lock_active = false;
        st.pending_req_lc = None;
        self.distribute_tree(
            ctx,
            &st,
            BankingPayload::LockRelease { lc: 0, uid: ctx.uid, req_lc },
            None,
        )
        .await;
        if let Some((next_lc, next_uid)) = self.queue.peek() {
            self.distribute_tree(
                ctx,
                &st,
                BankingPayload::LockAck { lc: 0, uid: next_uid, req_lc: next_lc },
                None,
            )
            .await;
        }
        Ok(())
    }

    // ---- Transactions ------------------------------------------------

    async fn start_transaction(&self, ctx: &NodeContext, target: u32, percent: i64) {
        let mut st = self.state.lock().await;
        st.ack_received = false;
        st.balance_received = false;
        st.rand_p = percent;
        let balance = st.balance;

        let get_id = short_id();
        let start_id = short_id();
        let get_balance = BankingPayload::TransactGetBalance {
            lc: 0,
            msg_id: get_id.clone(),
            target,
        };
        let start = BankingPayload::TransactStart {
            lc: 0,
            msg_id: start_id.clone(),
            target,
            balance,
            percent,
        };
        // Own flood ids are known so echoes over cycles are dropped.
        st.known.insert(get_id);
        st.known.insert(start_id);

        info!(uid = ctx.uid, target, balance, percent, "starting transaction");
        self.flood_lamport(ctx, get_balance, None).await;
        self.flood_lamport(ctx, start, None).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_transact_start(
        &self,
        ctx: &NodeContext,
        st: &mut BankingState,
        src: u32,
        msg_id: String,
        target: u32,
        balance: i64,
        percent: i64,
    ) -> Result<()> {
        if st.known.contains(&msg_id) {
            debug!(uid = ctx.uid, msg_id, "deduplicating transactStart");
            return Ok(());
        }

        if target == ctx.uid {
            let old_balance = st.balance;
            // The richer side pays the poorer side.
            if balance >= st.balance {
                st.balance += (balance / 100) * percent;
            } else {
                st.balance -= (balance / 100) * percent;
            }
            info!(uid = ctx.uid, old_balance, new_balance = st.balance, "updated balance");
            st.known.insert(msg_id);

            let ack_id = short_id();
            st.known.insert(ack_id.clone());
            self.flood_lamport(ctx, BankingPayload::TransactAck { lc: 0, msg_id: ack_id }, None)
                .await;
        } else {
            st.known.insert(msg_id.clone());
            self.flood_lamport(
                ctx,
                BankingPayload::TransactStart { lc: 0, msg_id, target, balance, percent },
                Some(src),
            )
            .await;
        }
        Ok(())
    }

    async fn handle_transact_get_balance(
        &self,
        ctx: &NodeContext,
        st: &mut BankingState,
        src: u32,
        msg_id: String,
        target: u32,
    ) -> Result<()> {
        if st.known.contains(&msg_id) {
            debug!(uid = ctx.uid, msg_id, "deduplicating transactGetBalance");
            return Ok(());
        }

        if target == ctx.uid {
            st.known.insert(msg_id);
            let reply_id = short_id();
            st.known.insert(reply_id.clone());
            let reply = BankingPayload::TransactBalance {
                lc: 0,
                msg_id: reply_id,
                balance: st.balance,
            };
            self.flood_lamport(ctx, reply, None).await;
        } else {
            st.known.insert(msg_id.clone());
            self.flood_lamport(
                ctx,
                BankingPayload::TransactGetBalance { lc: 0, msg_id, target },
                Some(src),
            )
            .await;
        }
        Ok(())
    }

    async fn handle_transact_balance(
        &self,
        ctx: &NodeContext,
        st: &mut BankingState,
        src: u32,
        msg_id: String,
        balance: i64,
    ) -> Result<()> {
        if st.known.contains(&msg_id) {
            debug!(uid = ctx.uid, msg_id, "deduplicating transactBalance");
            return Ok(());
        }

        if st.lock_active {
            // The symmetric half of the update on the initiator.
            let old_balance = st.balance;
            if balance >= st.balance {
                st.balance += (balance / 100) * st.rand_p;
            } else {
                st.balance -= (balance / 100) * st.rand_p;
            }
            info!(uid = ctx.uid, old_balance, new_balance = st.balance, "updated balance");
            st.balance_received = true;
            st.known.insert(msg_id);
        } else {
            st.known.insert(msg_id.clone());
            self.flood_lamport(
                ctx,
                BankingPayload::TransactBalance { lc: 0, msg_id, balance },
                Some(src),
            )
            .await;
        }
        Ok(())
    }

    async fn handle_transact_ack(
        &self,
        ctx: &NodeContext,
        st: &mut BankingState,
        src: u32,
        msg_id: String,
    ) -> Result<()> {
        if st.known.contains(&msg_id) {
            debug!(uid = ctx.uid, msg_id, "deduplicating transactAck");
            return Ok(());
        }

        if st.lock_active {
            st.ack_received = true;
            st.known.insert(msg_id);
        } else {
            st.known.insert(msg_id.clone());
            self.flood_lamport(ctx, BankingPayload::TransactAck { lc: 0, msg_id }, Some(src))
                .await;
        }
        Ok(())
    }

    // ---- Chandy-Lamport snapshots ------------------------------------

    async fn handle_marker(
        &self,
        ctx: &NodeContext,
        st: &mut BankingState,
        src: u32,
        marker: String,
    ) -> Result<()> {
        if let Some(snapshot) = st.snapshots.get_mut(&marker) {
            // Marker already known: the channel from the sender closes.
            snapshot.close_channel(src);
        } else {
            let mut record = SnapshotRecord::new(
                ctx.uid,
                st.balance,
                ctx.neighbourhood.neighbours().map(|(uid, _)| uid),
            );
            record.close_channel(src);
            st.snapshots.insert(marker.clone(), record);

            // First sight: the marker goes out on every edge, the reverse
            // channel to the sender included.
            let forwarded =
                Message::new(ctx.uid, MessageType::Banking, BankingPayload::Marker { marker: marker.clone() }.to_string());
            ctx.broadcast(&forwarded).await;
        }

        self.finish_snapshot(ctx, st, &marker).await
    }

    /// Report a completed snapshot exactly once: the leader stores it,
    /// everyone else compresses it up the tree.
    async fn finish_snapshot(
        &self,
        ctx: &NodeContext,
        st: &mut BankingState,
        marker: &str,
    ) -> Result<()> {
        let record = match st.snapshots.get_mut(marker) {
            Some(record) => {
                if record.is_complete() && record.take_report() {
                    record.clone()
                } else {
                    return Ok(());
                }
            }
            None => return Ok(()),
        };

        if st.election.is_leader() {
            info!(uid = ctx.uid, marker, "snapshot complete (coordinator), storing");
            st.received_snapshots
                .entry(marker.to_string())
                .or_default()
                .push(record);
        } else if st.election.complete() {
            info!(uid = ctx.uid, marker, "snapshot complete, forwarding to coordinator");
            let blob = record.compress()?;
            let state_msg = Message::new(
                ctx.uid,
                MessageType::Banking,
                BankingPayload::State { marker: marker.to_string(), blob }.to_string(),
            );
            ctx.send_or_log(st.election.parent_uid(), state_msg).await;
        } else {
            warn!(uid = ctx.uid, marker, "snapshot complete but no leader to report to");
        }
        Ok(())
    }

    async fn handle_state(
        &self,
        ctx: &NodeContext,
        st: &mut BankingState,
        msg: &Message,
        marker: String,
        blob: String,
    ) -> Result<()> {
        if st.election.is_leader() {
            let record = SnapshotRecord::decompress(&blob)?;
            info!(uid = ctx.uid, marker, from = record.uid, "received snapshot state");
            st.received_snapshots.entry(marker).or_default().push(record);
            Ok(())
        } else if st.election.complete() {
            debug!(uid = ctx.uid, marker, "forwarding snapshot state up the tree");
            ctx.send_or_log(st.election.parent_uid(), Message::forward(ctx.uid, msg))
                .await;
            Ok(())
        } else {
            Err(ProtocolError::invariant(
                "snapshot state received with no elected leader",
            ))
        }
    }

    async fn begin_snapshot(&self, ctx: &NodeContext) -> Result<String> {
        let mut st = self.state.lock().await;
        if !st.election.is_leader() {
            return Err(ProtocolError::invariant(
                "snapshot initiation requires the banking leader",
            ));
        }

        let marker = short_id();
        info!(uid = ctx.uid, marker, "starting consistent snapshot");
        let record = SnapshotRecord::new(
            ctx.uid,
            st.balance,
            ctx.neighbourhood.neighbours().map(|(uid, _)| uid),
        );
        st.snapshots.insert(marker.clone(), record);
        st.received_snapshots.entry(marker.clone()).or_default();

        let announce = Message::new(
            ctx.uid,
            MessageType::Banking,
            BankingPayload::Marker { marker: marker.clone() }.to_string(),
        );
        ctx.broadcast(&announce).await;

        // A leader without neighbours completes on the spot.
        self.finish_snapshot(ctx, &mut st, &marker).await?;
        Ok(marker)
    }

    // ---- Send helpers ------------------------------------------------

    /// Forward along the spanning tree, re-ticking the clock per hop.
    async fn distribute_tree(
        &self,
        ctx: &NodeContext,
        st: &BankingState,
        payload: BankingPayload,
        exclude: Option<u32>,
    ) -> usize {
        if !st.election.complete() {
            error!(uid = ctx.uid, "tree distribution requires a completed leader election");
            return 0;
        }
        let mut total = 0;
        for peer in st.election.tree_peers() {
            if Some(peer) == exclude || peer == ctx.uid {
                continue;
            }
            let mut hop = payload.clone();
            hop.set_lc(self.clock.tick());
            ctx.send_or_log(peer, Message::new(ctx.uid, MessageType::Banking, hop.to_string()))
                .await;
            total += 1;
        }
        total
    }

    /// Flood to every neighbour except `exclude`, re-ticking the clock per
    /// hop. Deduplication is the caller's business via `known`.
    async fn flood_lamport(
        &self,
        ctx: &NodeContext,
        payload: BankingPayload,
        exclude: Option<u32>,
    ) -> usize {
        let mut total = 0;
        let peers: Vec<u32> = ctx.neighbourhood.neighbours().map(|(uid, _)| uid).collect();
        for peer in peers {
            if Some(peer) == exclude {
                continue;
            }
            let mut hop = payload.clone();
            hop.set_lc(self.clock.tick());
            ctx.send_or_log(peer, Message::new(ctx.uid, MessageType::Banking, hop.to_string()))
                .await;
            total += 1;
        }
        total
    }

    // ---- Workers -----------------------------------------------------

    /// Block until the election has terminated. Returns false on shutdown.
    async fn wait_for_election(&self, ctx: &NodeContext) -> bool {
        loop {
            if !ctx.sleep_unless_shutdown(Duration::from_millis(50)).await {
                return false;
            }
            if self.state.lock().await.election.complete() {
                return true;
            }
        }
    }

    async fn transaction_loop(self: Arc<Self>, ctx: Arc<NodeContext>) {
        if !self.wait_for_election(&ctx).await {
            info!(uid = ctx.uid, "stopping transaction loop (banking)");
            return;
        }
        info!(uid = ctx.uid, "starting transaction loop (banking)");

        loop {
            let pause = Duration::from_millis(self.rng.lock().gen_range(0..3000));
            if !ctx.sleep_unless_shutdown(pause).await {
                break;
            }

            let req_lc = match self.request_lock(&ctx).await {
                Ok(req_lc) => req_lc,
                Err(err) => {
                    warn!(uid = ctx.uid, error = %err, "lock request failed");
                    continue;
                }
            };

            // Wait for acks from every other node.
            loop {
                if !ctx.sleep_unless_shutdown(Duration::from_millis(50)).await {
                    return;
                }
                if self.state.lock().await.lock_active {
                    break;
                }
            }
            info!(uid = ctx.uid, "entering critical section");

            let target = {
                let mut rng = self.rng.lock();
                let peers: Vec<u32> = ctx
                    .neighbourhood
                    .cluster_uids()
                    .into_iter()
                    .filter(|&uid| uid != ctx.uid)
                    .collect();
                peers.choose(&mut *rng).copied()
            };

            if let Some(target) = target {
                let percent = self.rng.lock().gen_range(0..100);
                self.start_transaction(&ctx, target, percent).await;

                // Both the balance reply and the ack must arrive before the
                // lock may be released.
                loop {
                    if !ctx.sleep_unless_shutdown(Duration::from_millis(100)).await {
                        return;
                    }
                    let st = self.state.lock().await;
                    if st.ack_received && st.balance_received {
                        break;
                    }
                }
            }

            info!(uid = ctx.uid, "exit critical section");
            if let Err(err) = self.release_lock(&ctx, req_lc).await {
                warn!(uid = ctx.uid, error = %err, "lock release failed");
            }
        }
        info!(uid = ctx.uid, "stopping transaction loop (banking)");
    }

    async fn snapshot_loop(self: Arc<Self>, ctx: Arc<NodeContext>) {
        if !self.wait_for_election(&ctx).await {
            info!(uid = ctx.uid, "stopping snapshot loop (banking)");
            return;
        }
        if !self.state.lock().await.election.is_leader() {
            info!(uid = ctx.uid, "lost the election (banking), no snapshot duty");
            return;
        }
        info!(uid = ctx.uid, "starting snapshot coordinator (banking)");

        let mut marker: Option<String> = None;
        loop {
            if !ctx.sleep_unless_shutdown(Duration::from_secs(1)).await {
                break;
            }

            let rotate = match &marker {
                None => true,
                Some(current) => {
                    let st = self.state.lock().await;
                    st.received_snapshots.get(current).map_or(0, Vec::len)
                        == ctx.neighbourhood.cluster_size()
                }
            };
            if rotate {
                match self.begin_snapshot(&ctx).await {
                    Ok(fresh) => marker = Some(fresh),
                    Err(err) => warn!(uid = ctx.uid, error = %err, "snapshot rotation failed"),
                }
            }
        }
        info!(uid = ctx.uid, "stopping snapshot coordinator (banking)");
    }
}
