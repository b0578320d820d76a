//! Protocol scenario tests for the consensus state machine.
//!
//! Each test drives a single node through a choreographed exchange with
//! scripted peer validators, observing transitions through per-kind event
//! subscriptions and round-state snapshots. Timeouts run on the paused
//! tokio clock, so waiting steps expire deterministically whenever the
//! test is blocked on an expected event.

mod common;

use common::*;
use meridian_consensus::{ConsensusConfig, Event, EventKind, VoteType};
use meridian_types::{BlockId, CommitSigFlag};

/// Happy path with a single validator: propose, prevote, precommit and
/// commit in one round, then roll into the next height.
#[tokio::test(start_paused = true)]
async fn s1_happy_path_single_validator() {
    let node = node(1, 0, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut prop_rx = node.subscribe(EventKind::CompleteProposal);
    let mut vote_rx = node.subscribe(EventKind::Vote);
    let mut block_rx = node.subscribe(EventKind::NewBlock);

    node.start(1, 0).await;

    ensure_new_round(&mut round_rx, 1, 0).await;
    let block_id = ensure_complete_proposal(&mut prop_rx, 1).await;

    let prevote = ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    assert_eq!(prevote.block_id, block_id);
    let precommit = ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    assert_eq!(precommit.block_id, block_id);

    let block = ensure_new_block(&mut block_rx, 1).await;
    assert_eq!(block.hash(), block_id.hash);

    ensure_new_round(&mut round_rx, 2, 0).await;

    // The sole validator's precommit is the entire justification of block
    // one, visible in the last_commit the next block embeds.
    let block2 = ensure_new_block(&mut block_rx, 2).await;
    assert_eq!(block2.last_commit.height, 1);
    assert_eq!(block2.last_commit.block_id, block_id);
    assert_eq!(block2.last_commit.signatures.len(), 1);
    assert_eq!(block2.last_commit.signatures[0].flag, CommitSigFlag::Commit);
}

/// Proposer rotation starting at round 3: with four equal validators the
/// accumulator hands rounds 3..=7 to distinct proposers in order, and nil
/// precommits advance the rounds without a commit.
#[tokio::test(start_paused = true)]
async fn s2_proposer_rotation_from_round_three() {
    let node = node(4, 0, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);

    node.start(1, 3).await;

    for i in 0..4u32 {
        let round = 3 + i;
        let proposer = ensure_new_round_proposer(&mut round_rx, 1, round).await;
        let expected = node.vals[((round - 1) % 4) as usize].address();
        assert_eq!(proposer, expected, "wrong proposer for round {round}");

        // Everyone else precommits nil; the node follows and the round
        // times out into the next one.
        node.add_votes(&[1, 2, 3], VoteType::Precommit, 1, round, BlockId::nil())
            .await;
    }

    ensure_new_round(&mut round_rx, 1, 7).await;
    let snapshot = node.snapshot().await;
    assert_eq!(snapshot.height, 1, "nil rounds must not commit");
}

/// Lock without POL: the node locks in round 0 and keeps prevoting its
/// lock while precommitting nil across three more rounds, never unlocking.
#[tokio::test(start_paused = true)]
async fn s3_lock_no_pol() {
    let node = node(2, 0, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut prop_rx = node.subscribe(EventKind::CompleteProposal);
    let mut vote_rx = node.subscribe(EventKind::Vote);
    let mut unlock_rx = node.subscribe(EventKind::Unlock);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    // Round 0: the node proposes, both prevote it, the node locks.
    let block_id = ensure_complete_proposal(&mut prop_rx, 1).await;
    let prevote = ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    assert_eq!(prevote.block_id, block_id);

    node.add_votes(&[1], VoteType::Prevote, 1, 0, block_id.clone()).await;
    let precommit = ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    assert_eq!(precommit.block_id, block_id);

    // The peer precommits some other block; no decision, next round.
    node.add_votes(&[1], VoteType::Precommit, 1, 0, node.opaque_block_id(0xCC))
        .await;
    ensure_new_round(&mut round_rx, 1, 1).await;

    // Round 1: the node proposes again (its valid block) and prevotes its
    // lock; the peer prevotes and precommits nil.
    let re_proposed = ensure_complete_proposal(&mut prop_rx, 1).await;
    assert_eq!(re_proposed.hash, block_id.hash);
    let prevote = ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    assert_eq!(prevote.block_id, block_id);

    node.add_votes(&[1], VoteType::Prevote, 1, 1, BlockId::nil()).await;
    let precommit = ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    assert!(precommit.is_nil(), "locked without polka precommits nil");

    node.add_votes(&[1], VoteType::Precommit, 1, 1, BlockId::nil()).await;
    ensure_new_round(&mut round_rx, 1, 2).await;

    // Round 2: the peer proposes a different block; the lock still rules
    // the node's prevote.
    let other = node.make_block(1, "other");
    let other_id = node.block_id(&other);
    node.deliver_proposal_and_block(2, &other, -1).await;

    let prevote = ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    assert_eq!(prevote.block_id, block_id, "lock overrides the new proposal");

    node.add_votes(&[1], VoteType::Prevote, 1, 2, other_id.clone()).await;
    let precommit = ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    assert!(precommit.is_nil());

    node.add_votes(&[1], VoteType::Precommit, 1, 2, other_id).await;
    ensure_new_round(&mut round_rx, 1, 3).await;

    // Round 3: the node proposes its locked block once more.
    let re_proposed = ensure_complete_proposal(&mut prop_rx, 1).await;
    assert_eq!(re_proposed.hash, block_id.hash);
    let prevote = ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    assert_eq!(prevote.block_id, block_id);

    let snapshot = node.snapshot().await;
    assert_eq!(snapshot.locked_round, 0);
    assert_eq!(snapshot.locked_block.unwrap().hash(), block_id.hash);
    assert_no_event(&mut unlock_rx);
}

/// POL relock: locked on the round-0 block, the node sees a round-1 polka
/// for a different block it holds, releases the old lock, takes the new
/// one and commits it.
#[tokio::test(start_paused = true)]
async fn s4_pol_relock() {
    let node = node(4, 3, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut vote_rx = node.subscribe(EventKind::Vote);
    let mut lock_rx = node.subscribe(EventKind::Lock);
    let mut unlock_rx = node.subscribe(EventKind::Unlock);
    let mut block_rx = node.subscribe(EventKind::NewBlock);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    // Round 0: polka for the first block, the node locks it.
    let b1 = node.make_block(1, "first");
    let id1 = node.block_id(&b1);
    node.deliver_proposal_and_block(0, &b1, -1).await;

    let prevote = ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    assert_eq!(prevote.block_id, id1);
    node.add_votes(&[0, 1], VoteType::Prevote, 1, 0, id1.clone()).await;

    let precommit = ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    assert_eq!(precommit.block_id, id1);
    match next_event(&mut lock_rx).await {
        Event::Lock { block_id, .. } => assert_eq!(block_id, id1),
        other => panic!("expected Lock, got {other:?}"),
    }

    // The others precommit nil; consensus moves to round 1.
    node.add_votes(&[0, 1, 2], VoteType::Precommit, 1, 0, BlockId::nil()).await;
    ensure_new_round(&mut round_rx, 1, 1).await;

    // Round 1: a different block is proposed; the node prevotes its lock,
    // but the peers produce a polka for the new block.
    let b2 = node.make_block(1, "second");
    let id2 = node.block_id(&b2);
    node.deliver_proposal_and_block(1, &b2, -1).await;

    let prevote = ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    assert_eq!(prevote.block_id, id1, "the lock rules the first prevote");

    node.add_votes(&[0, 1, 2], VoteType::Prevote, 1, 1, id2.clone()).await;

    ensure_unlock(&mut unlock_rx, 1).await;
    match next_event(&mut lock_rx).await {
        Event::Lock { block_id, round, .. } => {
            assert_eq!(block_id, id2);
            assert_eq!(round, 1);
        }
        other => panic!("expected Lock, got {other:?}"),
    }
    let precommit = ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    assert_eq!(precommit.block_id, id2);

    // Round-1 precommits decide the new block.
    node.add_votes(&[0, 1, 2], VoteType::Precommit, 1, 1, id2.clone()).await;
    let committed = ensure_new_block(&mut block_rx, 1).await;
    assert_eq!(committed.hash(), id2.hash);
}

/// POL unlock: locked on the round-0 block, the node misses the round-1
/// proposal and sees a nil polka; it unlocks and precommits nil.
#[tokio::test(start_paused = true)]
async fn s5_pol_unlock_on_nil_polka() {
    let node = node(4, 3, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut vote_rx = node.subscribe(EventKind::Vote);
    let mut unlock_rx = node.subscribe(EventKind::Unlock);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    // Round 0: lock.
    let b1 = node.make_block(1, "first");
    let id1 = node.block_id(&b1);
    node.deliver_proposal_and_block(0, &b1, -1).await;
    ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    node.add_votes(&[0, 1], VoteType::Prevote, 1, 0, id1.clone()).await;
    let precommit = ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    assert_eq!(precommit.block_id, id1);

    node.add_votes(&[0, 1, 2], VoteType::Precommit, 1, 0, BlockId::nil()).await;
    ensure_new_round(&mut round_rx, 1, 1).await;

    // Round 1: no proposal reaches the node; it prevotes its lock, the
    // peers prevote nil.
    let prevote = ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    assert_eq!(prevote.block_id, id1);

    node.add_votes(&[0, 1, 2], VoteType::Prevote, 1, 1, BlockId::nil()).await;

    ensure_unlock(&mut unlock_rx, 1).await;
    let precommit = ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    assert!(precommit.is_nil());

    let snapshot = node.snapshot().await;
    assert_eq!(snapshot.locked_round, -1);
    assert!(snapshot.locked_block.is_none());
}

/// A delayed prevote completes a polka after the node already
/// precommitted nil: the valid block updates, the precommit does not.
#[tokio::test(start_paused = true)]
async fn s6_delayed_prevote_sets_valid_block() {
    let node = node(4, 3, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut vote_rx = node.subscribe(EventKind::Vote);
    let mut valid_rx = node.subscribe(EventKind::ValidBlock);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    let b = node.make_block(1, "delayed");
    let id = node.block_id(&b);
    node.deliver_proposal_and_block(0, &b, -1).await;

    let prevote = ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    assert_eq!(prevote.block_id, id);

    // One peer prevotes the block, another nil; the prevote wait times out
    // and the node precommits nil.
    node.add_votes(&[0], VoteType::Prevote, 1, 0, id.clone()).await;
    node.add_votes(&[1], VoteType::Prevote, 1, 0, BlockId::nil()).await;
    let precommit = ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    assert!(precommit.is_nil(), "no polka before the timeout");

    // The slow peer's prevote lands and completes the polka.
    node.add_votes(&[2], VoteType::Prevote, 1, 0, id.clone()).await;

    let valid_id = ensure_valid_block(&mut valid_rx, 1).await;
    assert_eq!(valid_id, id);

    let snapshot = node.snapshot().await;
    assert_eq!(snapshot.valid_round, 0);
    assert_eq!(snapshot.valid_block.unwrap().hash(), id.hash);
    assert_eq!(snapshot.locked_round, -1, "a late polka must not lock");
    assert_eq!(snapshot.step, Step::Precommit, "no retroactive precommit");
}

/// Commit triggered by precommits from an earlier round: the node is in
/// round 1 when a round-0 majority appears, waits for the block parts,
/// then commits and advances.
#[tokio::test(start_paused = true)]
async fn s7_commit_from_previous_round() {
    let node = node(4, 3, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut valid_rx = node.subscribe(EventKind::ValidBlock);
    let mut block_rx = node.subscribe(EventKind::NewBlock);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    // Two peers already voting in round 1 pull the node forward.
    node.add_votes(&[0, 1], VoteType::Prevote, 1, 1, BlockId::nil()).await;
    ensure_new_round(&mut round_rx, 1, 1).await;

    // A round-0 precommit majority for a block the node never received.
    let b = node.make_block(1, "decided");
    let id = node.block_id(&b);
    node.add_votes(&[0, 1, 2], VoteType::Precommit, 1, 0, id.clone()).await;

    let valid_id = ensure_valid_block(&mut valid_rx, 1).await;
    assert_eq!(valid_id, id);

    let snapshot = node.snapshot().await;
    assert_eq!(snapshot.step, Step::Commit);
    assert_eq!(snapshot.commit_round, Some(0));

    // The parts arrive; the commit completes and the next height begins.
    node.deliver_block_parts(1, 0, &b).await;
    let committed = ensure_new_block(&mut block_rx, 1).await;
    assert_eq!(committed.hash(), id.hash);
    ensure_new_round(&mut round_rx, 2, 0).await;
}

/// A proposal whose block fails application validation draws a nil
/// prevote and never becomes lockable.
#[tokio::test(start_paused = true)]
async fn bad_proposal_prevotes_nil() {
    let node = node(2, 1, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut vote_rx = node.subscribe(EventKind::Vote);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    let mut bad = node.make_block(1, "tampered");
    bad.header.app_hash = INVALID_APP_HASH;
    let bad_id = node.block_id(&bad);
    node.deliver_proposal_and_block(0, &bad, -1).await;

    let prevote = ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    assert!(prevote.is_nil(), "invalid blocks draw nil prevotes");

    // The Byzantine peer prevotes its own bad block anyway.
    node.add_votes(&[0], VoteType::Prevote, 1, 0, bad_id).await;
    let precommit = ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    assert!(precommit.is_nil());

    let snapshot = node.snapshot().await;
    assert_eq!(snapshot.locked_round, -1);
}

/// With nothing to propose, a lone validator walks through nil prevote
/// and nil precommit and keeps advancing rounds.
#[tokio::test(start_paused = true)]
async fn full_round_nil_without_proposal() {
    let node = node(1, 0, ConsensusConfig::test());
    *node.app.propose_enabled.lock() = false;
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut vote_rx = node.subscribe(EventKind::Vote);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    let prevote = ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    assert!(prevote.is_nil());
    let precommit = ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    assert!(precommit.is_nil());

    ensure_new_round(&mut round_rx, 1, 1).await;
}

/// A polka observed before the block finishes assembling: completion of
/// the parts promotes the proposal to valid block.
#[tokio::test(start_paused = true)]
async fn valid_block_on_delayed_proposal_block() {
    let node = node(4, 3, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut valid_rx = node.subscribe(EventKind::ValidBlock);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    // Proposal header arrives, parts do not.
    let b = node.make_block(1, "slow-parts");
    let id = node.block_id(&b);
    let proposer = &node.vals[node.proposer_index(0)];
    let proposal = proposer.proposal(1, 0, -1, id.clone());
    node.handle
        .proposal(proposal, Some(meridian_consensus::PeerId::from("test-peer")))
        .await
        .unwrap();

    // The peers polka the block the node cannot assemble yet.
    node.add_votes(&[0, 1, 2], VoteType::Prevote, 1, 0, id.clone()).await;

    // Parts arrive; the waiting polka makes it the valid block.
    node.deliver_block_parts(1, 0, &b).await;
    let valid_id = ensure_valid_block(&mut valid_rx, 1).await;
    assert_eq!(valid_id, id);

    let snapshot = node.snapshot().await;
    assert_eq!(snapshot.valid_round, 0);
    assert_eq!(snapshot.valid_block.unwrap().hash(), id.hash);
}

/// Conflicting votes from one validator surface as evidence and are not
/// double counted toward any threshold.
#[tokio::test(start_paused = true)]
async fn conflicting_vote_emits_evidence() {
    let node = node(4, 3, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut evidence_rx = node.subscribe(EventKind::Evidence);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    let b = node.make_block(1, "one");
    let id_a = node.block_id(&b);
    let id_b = node.opaque_block_id(0xAB);

    node.add_votes(&[0], VoteType::Prevote, 1, 0, id_a.clone()).await;
    node.add_votes(&[0], VoteType::Prevote, 1, 0, id_b).await;

    match next_event(&mut evidence_rx).await {
        Event::Evidence(evidence) => {
            assert_eq!(evidence.validator_address, node.vals[0].address());
            assert_eq!(evidence.height, 1);
        }
        other => panic!("expected Evidence, got {other:?}"),
    }
}
