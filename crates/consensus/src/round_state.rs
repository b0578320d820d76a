//! Per-height round state.
//!
//! [`RoundState`] is the single mutable record of the consensus core. It is
//! owned exclusively by the state-machine task; everything outside the task
//! sees it only through [`RoundStateSnapshot`] deep copies served over the
//! snapshot request message.

use std::fmt;

use meridian_types::{Block, BlockId, PartSet};
use serde::{Deserialize, Serialize};

use crate::types::{Height, Proposal, Round, Step};
use crate::vote_set::{HeightVoteSet, VoteSet};

/// Mutable consensus state for one height.
#[derive(Debug)]
pub struct RoundState {
    /// Current height
    pub height: Height,
    /// Current round within the height
    pub round: Round,
    /// Current step within the round
    pub step: Step,
    /// Wall-clock start of this height (Unix millis)
    pub start_time_ms: u64,

    /// The accepted proposal for this round, if any
    pub proposal: Option<Proposal>,
    /// The proposal's block, once all parts arrived
    pub proposal_block: Option<Block>,
    /// The proposal's part set, growing as gossip delivers parts
    pub proposal_block_parts: Option<PartSet>,

    /// Round we locked in (-1 when unlocked)
    pub locked_round: i64,
    /// The block we are locked on
    pub locked_block: Option<Block>,
    /// Parts of the locked block
    pub locked_block_parts: Option<PartSet>,

    /// Most recent round with a polka we know of (-1 when none)
    pub valid_round: i64,
    /// The most recently polka'd block, when we have it
    pub valid_block: Option<Block>,
    /// Parts of the valid block (may be partial when the block is absent)
    pub valid_block_parts: Option<PartSet>,

    /// All votes received for this height, by round and type
    pub votes: HeightVoteSet,
    /// The round whose precommits triggered the commit (once committing)
    pub commit_round: Option<Round>,
    /// Precommits justifying the previous block
    pub last_commit: Option<VoteSet>,
    /// Whether the precommit-wait timeout was already scheduled this round
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    /// Fresh state for a new height. Locks, valid block, proposal and
    /// commit round all reset; `last_commit` carries over from the
    /// previous height's decision.
    pub fn new(
        chain_id: impl Into<String>,
        height: Height,
        start_time_ms: u64,
        last_commit: Option<VoteSet>,
    ) -> Self {
        Self {
            height,
            round: 0,
            step: Step::NewHeight,
            start_time_ms,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: -1,
            locked_block: None,
            locked_block_parts: None,
            valid_round: -1,
            valid_block: None,
            valid_block_parts: None,
            votes: HeightVoteSet::new(chain_id, height),
            commit_round: None,
            last_commit,
            triggered_timeout_precommit: false,
        }
    }

    /// Whether the complete proposal block is in hand and hashes to `id`.
    pub fn proposal_block_matches(&self, id: &BlockId) -> bool {
        self.proposal_block
            .as_ref()
            .map(|b| b.hash() == id.hash)
            .unwrap_or(false)
    }

    /// Whether the locked block hashes to `id`.
    pub fn locked_block_matches(&self, id: &BlockId) -> bool {
        self.locked_block
            .as_ref()
            .map(|b| b.hash() == id.hash)
            .unwrap_or(false)
    }

    /// Deep-copy snapshot for subscribers and RPC.
    pub fn snapshot(&self) -> RoundStateSnapshot {
        RoundStateSnapshot {
            height: self.height,
            round: self.round,
            step: self.step,
            start_time_ms: self.start_time_ms,
            proposal: self.proposal.clone(),
            proposal_block: self.proposal_block.clone(),
            locked_round: self.locked_round,
            locked_block: self.locked_block.clone(),
            valid_round: self.valid_round,
            valid_block: self.valid_block.clone(),
            commit_round: self.commit_round,
            last_commit_power: self
                .last_commit
                .as_ref()
                .map(|set| set.voted_power())
                .unwrap_or(0),
        }
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RoundState(h={} r={} step={} locked={} valid={})",
            self.height,
            self.round,
            self.step,
            if self.locked_round >= 0 {
                format!("r{}", self.locked_round)
            } else {
                "none".to_string()
            },
            if self.valid_round >= 0 {
                format!("r{}", self.valid_round)
            } else {
                "none".to_string()
            },
        )
    }
}

/// By-value snapshot of the round state.
///
/// Large fields are deep copies; holders can never observe later mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundStateSnapshot {
    /// Current height
    pub height: Height,
    /// Current round
    pub round: Round,
    /// Current step
    pub step: Step,
    /// Wall-clock start of this height (Unix millis)
    pub start_time_ms: u64,
    /// The accepted proposal, if any
    pub proposal: Option<Proposal>,
    /// The complete proposal block, if assembled
    pub proposal_block: Option<Block>,
    /// Locked round (-1 when unlocked)
    pub locked_round: i64,
    /// Locked block
    pub locked_block: Option<Block>,
    /// Valid round (-1 when none)
    pub valid_round: i64,
    /// Valid block, when the node has it
    pub valid_block: Option<Block>,
    /// Commit round, once committing
    pub commit_round: Option<Round>,
    /// Total voting power recorded in `last_commit`
    pub last_commit_power: u128,
}

impl fmt::Display for RoundStateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RoundState(h={} r={} step={} locked={} valid={})",
            self.height,
            self.round,
            self.step,
            if self.locked_round >= 0 {
                format!("r{}", self.locked_round)
            } else {
                "none".to_string()
            },
            if self.valid_round >= 0 {
                format!("r{}", self.valid_round)
            } else {
                "none".to_string()
            },
        )
    }
}
