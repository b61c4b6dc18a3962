// Copyright (c) Flock Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end protocol scenarios over an in-process cluster.

mod common;

use common::{NodeProfile, TestCluster};
use flock_node::ext::ConsensusKnobs;
use flock_wire::MessageType;

fn profiles(uids: &[u32], mutate: impl Fn(u32, &mut NodeProfile)) -> Vec<(u32, NodeProfile)> {
    uids.iter()
        .map(|&uid| {
            let mut profile = NodeProfile::default();
            mutate(uid, &mut profile);
            (uid, profile)
        })
        .collect()
}

#[tokio::test]
async fn startup_populates_registration_maps() {
    let mut cluster = TestCluster::full_mesh(profiles(&[1, 2], |_, _| {}));

    cluster.inject(1, MessageType::Control, "STARTUP").await;
    cluster.inject(2, MessageType::Control, "STARTUP").await;
    cluster.pump().await;

    assert!(cluster.node(1).ctx.neighbourhood.is_registered(2));
    assert!(cluster.node(2).ctx.neighbourhood.is_registered(1));

    // A second STARTUP is a no-op: only the control message itself moves.
    cluster.inject(1, MessageType::Control, "STARTUP").await;
    assert_eq!(cluster.pump().await, 1);
}

#[tokio::test]
async fn two_node_election_picks_the_higher_uid() {
    let mut cluster = TestCluster::full_mesh(profiles(&[1, 2], |_, profile| {
        profile.consensus_leader = true;
    }));

    cluster.inject(1, MessageType::Consensus, "coordinator").await;
    cluster.inject(2, MessageType::Consensus, "coordinator").await;
    cluster.pump().await;

    for uid in cluster.uids() {
        assert_eq!(cluster.node(uid).consensus.leader_uid().await, 2, "node {uid}");
    }
    assert!(!cluster.node(1).consensus.is_leader().await);
    assert!(cluster.node(2).consensus.is_leader().await);

    // Spanning tree: 1 hangs off 2, 2 is its own parent.
    assert_eq!(cluster.node(1).consensus.parent_uid().await, 2);
    assert!(cluster.node(1).consensus.child_uids().await.is_empty());
    assert_eq!(cluster.node(2).consensus.parent_uid().await, 2);
    assert_eq!(cluster.node(2).consensus.child_uids().await, vec![1]);
}

#[tokio::test]
async fn election_waves_of_different_domains_do_not_interfere() {
    let mut cluster = TestCluster::full_mesh(profiles(&[1, 2, 3], |uid, profile| {
        profile.banking_leader = uid == 1;
        profile.consensus_leader = uid == 3;
    }));

    cluster.inject(1, MessageType::Banking, "coordinator").await;
    cluster.inject(3, MessageType::Consensus, "coordinator").await;
    cluster.pump().await;

    for uid in cluster.uids() {
        assert_eq!(cluster.node(uid).banking.leader_uid().await, 1, "banking on node {uid}");
        assert_eq!(cluster.node(uid).consensus.leader_uid().await, 3, "consensus on node {uid}");
    }
}

#[tokio::test]
async fn rumor_line_trusts_after_reinjection() {
    let mut cluster = TestCluster::with_graph(
        profiles(&[1, 2, 3], |_, _| {}),
        &[(1, 2), (2, 3)],
    );

    cluster.inject(1, MessageType::Rumor, "2;hello").await;
    cluster.pump().await;
    for uid in cluster.uids() {
        let ledger = cluster.node(uid).rumor.ledger();
        assert_eq!(ledger.seen_count("hello"), 1, "node {uid}");
        assert!(!ledger.is_trusted("hello"), "node {uid}");
    }

    cluster.inject(3, MessageType::Rumor, "2;hello").await;
    cluster.pump().await;
    for uid in cluster.uids() {
        let ledger = cluster.node(uid).rumor.ledger();
        assert_eq!(ledger.seen_count("hello"), 2, "node {uid}");
        assert!(ledger.is_trusted("hello"), "node {uid}");
    }
}

#[tokio::test]
async fn distribute_control_floods_a_rumor_to_trust() {
    let mut cluster = TestCluster::full_mesh(profiles(&[1, 2, 3], |_, _| {}));

    cluster
        .inject(2, MessageType::Control, "DISTRIBUTE RUMOR 1;news")
        .await;
    cluster.pump().await;

    for uid in cluster.uids() {
        assert!(
            cluster.node(uid).rumor.ledger().is_trusted("news"),
            "node {uid} should trust a threshold-1 rumor"
        );
    }
}

#[tokio::test]
async fn lamport_lock_is_granted_in_timestamp_order() {
    // Ring 1-2-3-4-1; node 4 becomes the banking leader.
    let mut cluster = TestCluster::with_graph(
        profiles(&[1, 2, 3, 4], |uid, profile| {
            profile.banking_leader = uid == 4;
        }),
        &[(1, 2), (2, 3), (3, 4), (4, 1)],
    );

    cluster.inject(4, MessageType::Banking, "coordinator").await;
    cluster.pump().await;
    for uid in cluster.uids() {
        assert_eq!(cluster.node(uid).banking.leader_uid().await, 4, "node {uid}");
    }

    // Node 2 requests first; acks from all three other nodes grant it.
    let ctx2 = cluster.node(2).ctx.clone();
    let req2 = cluster.node(2).banking.request_lock(&ctx2).await.unwrap();
    cluster.pump().await;
    assert!(cluster.node(2).banking.lock_active().await);
    for uid in cluster.uids() {
        assert_eq!(
            cluster.node(uid).banking.queue().peek(),
            Some((req2, 2)),
            "node {uid} queue head"
        );
    }

    // Node 3 requests later, with a causally larger timestamp, and waits.
    let ctx3 = cluster.node(3).ctx.clone();
    let req3 = cluster.node(3).banking.request_lock(&ctx3).await.unwrap();
    cluster.pump().await;
    assert!(req3 > req2, "later request must carry a larger timestamp");
    assert!(!cluster.node(3).banking.lock_active().await);
    assert!(cluster.node(2).banking.lock_active().await);

    // Releasing the head hands the lock to node 3.
    cluster.node(2).banking.release_lock(&ctx2, req2).await.unwrap();
    cluster.pump().await;
    assert!(!cluster.node(2).banking.lock_active().await);
    assert!(cluster.node(3).banking.lock_active().await);
    for uid in cluster.uids() {
        assert_eq!(
            cluster.node(uid).banking.queue().peek(),
            Some((req3, 3)),
            "node {uid} queue head after release"
        );
    }
}

#[tokio::test]
async fn transaction_updates_both_sides_under_the_lock() {
    let mut cluster = TestCluster::full_mesh(profiles(&[1, 2, 3], |uid, profile| {
        profile.banking_leader = uid == 1;
        profile.balance = match uid {
            2 => 10_000,
            3 => 5_000,
            _ => 1_000,
        };
    }));

    cluster.inject(1, MessageType::Banking, "coordinator").await;
    cluster.pump().await;

    let ctx2 = cluster.node(2).ctx.clone();
    let req2 = cluster.node(2).banking.request_lock(&ctx2).await.unwrap();
    cluster.pump().await;
    assert!(cluster.node(2).banking.lock_active().await);

    // Initiator 2 (balance 10000) transacts with target 3 (balance 5000),
    // percent 50. The target gains (10000/100)*50; the initiator, seeing
    // the target's pre-transaction balance, pays (5000/100)*50.
    cluster.node(2).banking.start_transaction(&ctx2, 3, 50).await;
    cluster.pump().await;

    assert!(cluster.node(2).banking.transaction_settled().await);
    assert_eq!(cluster.node(3).banking.balance().await, 10_000);
    assert_eq!(cluster.node(2).banking.balance().await, 7_500);
    assert_eq!(cluster.node(1).banking.balance().await, 1_000);

    cluster.node(2).banking.release_lock(&ctx2, req2).await.unwrap();
    cluster.pump().await;
    assert!(!cluster.node(2).banking.lock_active().await);
}

#[tokio::test]
async fn snapshot_collects_every_node_exactly_once() {
    let mut cluster = TestCluster::full_mesh(profiles(&[1, 2, 3], |uid, profile| {
        profile.banking_leader = uid == 3;
        profile.balance = 1_000 * uid as i64;
    }));

    cluster.inject(3, MessageType::Banking, "coordinator").await;
    cluster.pump().await;
    assert!(cluster.node(3).banking.is_leader().await);

    let ctx3 = cluster.node(3).ctx.clone();
    let marker = cluster.node(3).banking.begin_snapshot(&ctx3).await.unwrap();
    cluster.pump().await;

    assert_eq!(cluster.node(3).banking.collected_snapshots(&marker).await, 3);

    // A second round with a fresh marker works the same way.
    let marker2 = cluster.node(3).banking.begin_snapshot(&ctx3).await.unwrap();
    assert_ne!(marker, marker2);
    cluster.pump().await;
    assert_eq!(cluster.node(3).banking.collected_snapshots(&marker2).await, 3);
    assert_eq!(cluster.node(3).banking.collected_snapshots(&marker).await, 3);
}

#[tokio::test]
async fn snapshot_initiation_requires_the_leader() {
    let mut cluster = TestCluster::full_mesh(profiles(&[1, 2], |uid, profile| {
        profile.banking_leader = uid == 2;
    }));
    cluster.inject(2, MessageType::Banking, "coordinator").await;
    cluster.pump().await;

    let ctx1 = cluster.node(1).ctx.clone();
    assert!(cluster.node(1).banking.begin_snapshot(&ctx1).await.is_err());
}

#[tokio::test]
async fn single_node_cluster_elects_itself_and_locks_freely() {
    let mut cluster = TestCluster::full_mesh(profiles(&[7], |_, profile| {
        profile.banking_leader = true;
    }));

    cluster.inject(7, MessageType::Banking, "coordinator").await;
    cluster.pump().await;
    assert!(cluster.node(7).banking.is_leader().await);
    assert_eq!(cluster.node(7).banking.leader_uid().await, 7);

    // No other node needs to ack the lock.
    let ctx = cluster.node(7).ctx.clone();
    let req = cluster.node(7).banking.request_lock(&ctx).await.unwrap();
    assert!(cluster.node(7).banking.lock_active().await);
    cluster.node(7).banking.release_lock(&ctx, req).await.unwrap();

    // The leader's snapshot completes on the spot.
    let marker = cluster.node(7).banking.begin_snapshot(&ctx).await.unwrap();
    assert_eq!(cluster.node(7).banking.collected_snapshots(&marker).await, 1);
}

#[tokio::test]
async fn consensus_aligns_quiesces_and_collects_a_consistent_verdict() {
    let knobs = ConsensusKnobs {
        vote_initiators: 3,
        timestamp_range: 10,
        proposal_fanout: 2,
        max_accepted: 3,
    };
    let mut cluster = TestCluster::full_mesh(profiles(&[1, 2, 3, 4, 5], |uid, profile| {
        profile.consensus_leader = uid == 5;
        profile.knobs = knobs;
        profile.t_k = 2 * uid as i64;
    }));

    cluster.inject(5, MessageType::Consensus, "coordinator").await;
    cluster.pump().await;
    for uid in cluster.uids() {
        assert_eq!(cluster.node(uid).consensus.leader_uid().await, 5, "node {uid}");
    }

    // Seed the alignment and let the proposal cascades drain.
    let ctx5 = cluster.node(5).ctx.clone();
    cluster.node(5).consensus.begin_vote(&ctx5).await.unwrap();
    cluster.pump().await;
    for uid in cluster.uids() {
        let accepted = cluster.node(uid).consensus.accepted_rounds().await;
        assert!(accepted <= knobs.max_accepted, "node {uid} over budget");
    }

    // Quiescence: two consecutive state rounds, both balanced and equal.
    let sid1 = cluster.node(5).consensus.begin_state_round(&ctx5).await.unwrap();
    cluster.pump().await;
    assert!(cluster.node(5).consensus.state_round_done(&sid1).await);
    let (_, in1, out1) = cluster.node(5).consensus.state_round_aggregate(&sid1).await.unwrap();
    assert_eq!(in1, out1, "drained cluster must be balanced");

    let sid2 = cluster.node(5).consensus.begin_state_round(&ctx5).await.unwrap();
    cluster.pump().await;
    assert!(cluster.node(5).consensus.state_round_done(&sid2).await);
    let (_, in2, out2) = cluster.node(5).consensus.state_round_aggregate(&sid2).await.unwrap();
    assert_eq!(in2, out2);
    assert_eq!((in1, out1), (in2, out2), "consecutive rounds must agree");

    // The verdict mirrors the actual timestamp distribution.
    let mut timestamps = Vec::new();
    for uid in cluster.uids() {
        timestamps.push(cluster.node(uid).consensus.timestamp().await);
    }
    let all_equal = timestamps.windows(2).all(|pair| pair[0] == pair[1]);

    cluster.node(5).consensus.begin_collect_round(&ctx5).await.unwrap();
    cluster.pump().await;
    let (agreement, timestamp) = cluster
        .node(5)
        .consensus
        .final_result()
        .await
        .expect("collect round must finish");
    if all_equal {
        assert!(agreement);
        assert_eq!(timestamp, timestamps[0]);
    } else {
        assert!(!agreement);
        assert_eq!(timestamp, -1);
    }
}

#[tokio::test]
async fn proposal_cascade_respects_the_acceptance_budget() {
    let knobs = ConsensusKnobs {
        vote_initiators: 1,
        timestamp_range: 10,
        proposal_fanout: 1,
        max_accepted: 1,
    };
    let mut cluster = TestCluster::full_mesh(profiles(&[1, 2], |uid, profile| {
        profile.consensus_leader = uid == 2;
        profile.knobs = knobs;
        profile.t_k = if uid == 1 { 3 } else { 9 };
    }));

    cluster.inject(2, MessageType::Consensus, "coordinator").await;
    cluster.pump().await;

    let ctx2 = cluster.node(2).ctx.clone();
    cluster.node(2).consensus.begin_vote(&ctx2).await.unwrap();
    cluster.pump().await;

    assert!(cluster.node(1).consensus.accepted_rounds().await <= 1);
    assert!(cluster.node(2).consensus.accepted_rounds().await <= 1);
}
