//! Crash-recovery tests: replaying the WAL must reproduce the round state
//! the node held when it stopped.

mod common;

use common::*;
use meridian_consensus::{ConsensusConfig, EventKind, VoteType};

/// A node that locked mid-height recovers its lock, its votes and its
/// step from the log.
#[tokio::test(start_paused = true)]
async fn replay_restores_lock_and_step() {
    let mut node = node(4, 3, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut vote_rx = node.subscribe(EventKind::Vote);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    let b = node.make_block(1, "locked");
    let id = node.block_id(&b);
    node.deliver_proposal_and_block(0, &b, -1).await;
    ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    node.add_votes(&[0, 1], VoteType::Prevote, 1, 0, id.clone()).await;
    let precommit = ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    assert_eq!(precommit.block_id, id);

    let before = node.snapshot().await;
    drop(round_rx);
    drop(vote_rx);
    node.restart().await;
    let after = node.snapshot().await;

    assert_eq!(after.height, before.height);
    assert_eq!(after.round, before.round);
    assert_eq!(after.step, before.step);
    assert_eq!(after.locked_round, 0);
    assert_eq!(after.locked_block.unwrap().hash(), id.hash);
    assert_eq!(after.valid_round, 0);
}

/// A node that committed a height and crashed before any progress on the
/// next one resumes at the next height.
#[tokio::test(start_paused = true)]
async fn replay_resumes_after_committed_height() {
    let mut node = node(4, 3, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut vote_rx = node.subscribe(EventKind::Vote);
    let mut block_rx = node.subscribe(EventKind::NewBlock);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    // Full decision in round 0: all four validators precommit the block.
    let b = node.make_block(1, "committed");
    let id = node.block_id(&b);
    node.deliver_proposal_and_block(0, &b, -1).await;
    ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    node.add_votes(&[0, 1], VoteType::Prevote, 1, 0, id.clone()).await;
    ensure_own_vote(&mut vote_rx, &node, VoteType::Precommit).await;
    node.add_votes(&[0, 1, 2], VoteType::Precommit, 1, 0, id.clone()).await;

    ensure_new_block(&mut block_rx, 1).await;
    ensure_new_round(&mut round_rx, 2, 0).await;

    drop(round_rx);
    drop(vote_rx);
    drop(block_rx);
    node.restart().await;

    let after = node.snapshot().await;
    assert_eq!(after.height, 2);
    assert_eq!(after.round, 0);
    assert_eq!(after.locked_round, -1);
}

/// Replay must not re-broadcast or re-sign: after recovery the signer has
/// no memory, yet the recovered vote sets hold the pre-crash votes, so the
/// node does not equivocate when consensus resumes.
#[tokio::test(start_paused = true)]
async fn replay_preserves_vote_tallies() {
    let mut node = node(4, 3, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);
    let mut vote_rx = node.subscribe(EventKind::Vote);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    let b = node.make_block(1, "tallied");
    let id = node.block_id(&b);
    node.deliver_proposal_and_block(0, &b, -1).await;
    ensure_own_vote(&mut vote_rx, &node, VoteType::Prevote).await;
    // One peer prevote: no polka yet.
    node.add_votes(&[0], VoteType::Prevote, 1, 0, id.clone()).await;

    drop(round_rx);
    drop(vote_rx);
    node.restart().await;

    // The recovered tally still needs exactly one more prevote for the
    // polka; if replay had lost either vote, this could not lock.
    let mut lock_rx = node.subscribe(EventKind::Lock);
    node.add_votes(&[1], VoteType::Prevote, 1, 0, id.clone()).await;
    match next_event(&mut lock_rx).await {
        meridian_consensus::Event::Lock { block_id, .. } => assert_eq!(block_id, id),
        other => panic!("expected Lock, got {other:?}"),
    }

    let snapshot = node.snapshot().await;
    assert_eq!(snapshot.locked_round, 0);
    assert_eq!(snapshot.locked_block.unwrap().hash(), id.hash);
}

/// Stale timeouts recorded before a crash are ignored on replay.
#[tokio::test(start_paused = true)]
async fn replay_ignores_injected_stale_timeouts() {
    let mut node = node(4, 3, ConsensusConfig::test());
    let mut round_rx = node.subscribe(EventKind::NewRound);

    node.start(1, 0).await;
    ensure_new_round(&mut round_rx, 1, 0).await;

    // An old-round tick is logged and dropped both live and on replay.
    node.handle
        .timeout(meridian_consensus::TimeoutInfo {
            duration: std::time::Duration::from_millis(1),
            height: 1,
            round: 0,
            step: Step::NewHeight,
        })
        .await
        .unwrap();

    drop(round_rx);
    node.restart().await;

    let after = node.snapshot().await;
    assert_eq!(after.height, 1);
    assert_eq!(after.round, 0);
    assert_eq!(after.locked_round, -1);
    assert!(after.commit_round.is_none());

    // The recovered node still reaches a decision.
    let b = node.make_block(1, "after-restart");
    let id = node.block_id(&b);
    let mut block_rx = node.subscribe(EventKind::NewBlock);
    node.deliver_proposal_and_block(0, &b, -1).await;
    node.add_votes(&[0, 1], VoteType::Prevote, 1, 0, id.clone()).await;
    node.add_votes(&[0, 1, 2], VoteType::Precommit, 1, 0, id.clone()).await;
    let committed = ensure_new_block(&mut block_rx, 1).await;
    assert_eq!(committed.hash(), id.hash);
}
