//! Consensus-specific types for the Meridian BFT protocol.
//!
//! This module defines the core data structures used in the consensus
//! protocol:
//! - [`Step`] - Consensus step within a round
//! - [`VoteType`] - Type of vote (Prevote or Precommit)
//! - [`Vote`] - Vote message for prevotes and precommits
//! - [`Proposal`] - Block proposal message
//! - [`Validator`] and [`ValidatorSet`] - Validator management with
//!   accumulator-based proposer rotation

use std::fmt;

use meridian_crypto::{Address, PublicKey, Signature};
use meridian_types::BlockId;
use serde::{Deserialize, Serialize};

/// Block height. The first agreed block has height 1.
pub type Height = u64;

/// Round within a height, starting at 0.
pub type Round = u32;

/// Identifier of the peer a message arrived from. `None` marks messages the
/// node generated itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Domain separators for signature security.
///
/// A signature over a proposal cannot be replayed as a vote signature and
/// vice versa; the chain id is mixed in separately by the signing bytes.
pub mod domains {
    /// Domain separator for block proposals
    pub const PROPOSAL: &[u8] = b"MERIDIAN_PROPOSAL_V1";
    /// Domain separator for prevote messages
    pub const PREVOTE: &[u8] = b"MERIDIAN_PREVOTE_V1";
    /// Domain separator for precommit messages
    pub const PRECOMMIT: &[u8] = b"MERIDIAN_PRECOMMIT_V1";
}

/// Consensus step within a round.
///
/// Ordered: a later step compares greater, which the state machine uses to
/// drop stale transitions and timeouts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Step {
    /// Waiting out `timeout_commit` before the next height begins
    NewHeight,
    /// A round has started but proposing has not
    NewRound,
    /// Waiting for the proposer's block
    Propose,
    /// Prevote sent, collecting prevotes
    Prevote,
    /// 2/3 of prevote power seen without a polka, waiting for stragglers
    PrevoteWait,
    /// Precommit sent, collecting precommits
    Precommit,
    /// 2/3 of precommit power seen without a decision, waiting for stragglers
    PrecommitWait,
    /// A block reached 2/3 precommits, assembling and applying it
    Commit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::NewHeight => "NewHeight",
            Step::NewRound => "NewRound",
            Step::Propose => "Propose",
            Step::Prevote => "Prevote",
            Step::PrevoteWait => "PrevoteWait",
            Step::Precommit => "Precommit",
            Step::PrecommitWait => "PrecommitWait",
            Step::Commit => "Commit",
        };
        write!(f, "{}", name)
    }
}

/// Vote type for consensus messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteType {
    /// First voting phase: the validator saw a valid proposal
    Prevote,
    /// Second voting phase: the validator saw a polka
    Precommit,
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "Prevote"),
            VoteType::Precommit => write!(f, "Precommit"),
        }
    }
}

/// Vote message (prevote or precommit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Type of vote
    pub vote_type: VoteType,
    /// Block height
    pub height: Height,
    /// Round number
    pub round: Round,
    /// Identity of the block voted for (nil for a nil vote)
    pub block_id: BlockId,
    /// When the vote was signed (Unix millis)
    pub timestamp_ms: u64,
    /// Address of the voting validator
    pub validator_address: Address,
    /// Index of the validator in the set for this height
    pub validator_index: u32,
    /// The validator's signature
    pub signature: Signature,
}

impl Vote {
    /// Create a new unsigned vote.
    pub fn new(
        vote_type: VoteType,
        height: Height,
        round: Round,
        block_id: BlockId,
        validator_address: Address,
        validator_index: u32,
    ) -> Self {
        Self {
            vote_type,
            height,
            round,
            block_id,
            timestamp_ms: 0,
            validator_address,
            validator_index,
            signature: Signature::default(),
        }
    }

    /// The canonical signing bytes for this vote.
    ///
    /// Includes the vote-type domain separator and the chain id, so a
    /// signature can be replayed neither across vote types nor across
    /// chains. The timestamp is excluded: two votes for the same
    /// `(height, round, type, block_id)` are the same vote.
    pub fn signing_bytes(&self, chain_id: &str) -> Vec<u8> {
        let domain = match self.vote_type {
            VoteType::Prevote => domains::PREVOTE,
            VoteType::Precommit => domains::PRECOMMIT,
        };
        let mut bytes = Vec::with_capacity(domain.len() + chain_id.len() + 64);
        bytes.extend_from_slice(domain);
        bytes.extend_from_slice(&(chain_id.len() as u32).to_le_bytes());
        bytes.extend_from_slice(chain_id.as_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&self.round.to_le_bytes());
        bytes.extend_from_slice(&self.block_id.hash);
        bytes.extend_from_slice(&self.block_id.parts_header.total.to_le_bytes());
        bytes.extend_from_slice(&self.block_id.parts_header.hash);
        bytes
    }

    /// Whether this is a nil vote.
    pub fn is_nil(&self) -> bool {
        self.block_id.is_nil()
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(h={} r={} {} val={})",
            self.vote_type, self.height, self.round, self.block_id, self.validator_index
        )
    }
}

/// Block proposal message from the designated proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Block height
    pub height: Height,
    /// Round number
    pub round: Round,
    /// Round whose polka justifies re-proposing this block (-1 = none)
    pub pol_round: i64,
    /// Identity of the proposed block
    pub block_id: BlockId,
    /// When the proposal was signed (Unix millis)
    pub timestamp_ms: u64,
    /// Proposer's signature
    pub signature: Signature,
}

impl Proposal {
    /// Create a new unsigned proposal.
    pub fn new(height: Height, round: Round, pol_round: i64, block_id: BlockId) -> Self {
        Self {
            height,
            round,
            pol_round,
            block_id,
            timestamp_ms: 0,
            signature: Signature::default(),
        }
    }

    /// The canonical signing bytes for this proposal.
    pub fn signing_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(domains::PROPOSAL.len() + chain_id.len() + 72);
        bytes.extend_from_slice(domains::PROPOSAL);
        bytes.extend_from_slice(&(chain_id.len() as u32).to_le_bytes());
        bytes.extend_from_slice(chain_id.as_bytes());
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&self.round.to_le_bytes());
        bytes.extend_from_slice(&self.pol_round.to_le_bytes());
        bytes.extend_from_slice(&self.block_id.hash);
        bytes.extend_from_slice(&self.block_id.parts_header.total.to_le_bytes());
        bytes.extend_from_slice(&self.block_id.parts_header.hash);
        bytes
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal(h={} r={} pol={} {})",
            self.height, self.round, self.pol_round, self.block_id
        )
    }
}

/// Validator information for one height.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validator {
    /// The validator's address (orders the set)
    pub address: Address,
    /// Public key for vote verification
    pub pub_key: PublicKey,
    /// Voting power (positive)
    pub voting_power: u64,
    /// Rotation accumulator; the proposer is the validator with the highest
    /// priority, ties broken by smallest address
    pub proposer_priority: i64,
}

impl Validator {
    /// Create a new validator with zeroed priority.
    pub fn new(pub_key: PublicKey, voting_power: u64) -> Self {
        Self {
            address: pub_key.to_address(),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }
}

/// Set of validators for a single height.
///
/// Immutable per height aside from the proposer-priority accumulator, which
/// advances one step per round and one step per height transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_power: u64,
    /// Index of the proposer chosen by the last accumulator step; `None`
    /// until the accumulator has run (fresh sets fall back to the
    /// highest-priority validator).
    proposer_index: Option<u32>,
}

impl ValidatorSet {
    /// Build a set from validators, ordering them by address.
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        let total_power = validators.iter().map(|v| v.voting_power).sum();
        Self {
            validators,
            total_power,
            proposer_index: None,
        }
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Total voting power.
    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    /// Power required for a 2/3 majority.
    pub fn quorum_power(&self) -> u128 {
        (self.total_power as u128) * 2 / 3 + 1
    }

    /// All validators in address order.
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Look up a validator by index.
    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    /// Look up a validator and its index by address.
    pub fn get_by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.validators
            .iter()
            .enumerate()
            .find(|(_, v)| &v.address == address)
            .map(|(i, v)| (i as u32, v))
    }

    /// Whether the address belongs to the set.
    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Hash committing to the members and their powers.
    pub fn hash(&self) -> meridian_crypto::Hash {
        let leaves: Vec<Vec<u8>> = self
            .validators
            .iter()
            .map(|v| {
                let mut bytes = Vec::with_capacity(60);
                bytes.extend_from_slice(v.address.as_bytes());
                bytes.extend_from_slice(&v.pub_key.to_bytes());
                bytes.extend_from_slice(&v.voting_power.to_le_bytes());
                bytes
            })
            .collect();
        meridian_crypto::merkle_root(&leaves)
    }

    /// The current proposer.
    ///
    /// The validator charged by the last accumulator step; on a fresh set
    /// (no steps yet) the highest-priority validator, ties broken by
    /// smallest address - with all-zero priorities, the first validator in
    /// address order.
    pub fn proposer(&self) -> &Validator {
        match self.proposer_index {
            Some(index) => &self.validators[index as usize],
            None => &self.validators[self.proposer_index_by_priority()],
        }
    }

    /// Advance the rotation accumulator `times` steps.
    ///
    /// Each step adds every validator's power to its priority, selects the
    /// highest-priority validator (ties broken by smallest address) and
    /// charges it the total power. The validator selected by the final
    /// step becomes the proposer.
    pub fn increment_proposer_priority(&mut self, times: u32) {
        for _ in 0..times {
            for v in &mut self.validators {
                v.proposer_priority =
                    v.proposer_priority.saturating_add(v.voting_power as i64);
            }
            let selected = self.proposer_index_by_priority();
            self.validators[selected].proposer_priority = self.validators[selected]
                .proposer_priority
                .saturating_sub(self.total_power as i64);
            self.proposer_index = Some(selected as u32);
        }
    }

    fn proposer_index_by_priority(&self) -> usize {
        let mut best = 0usize;
        for (i, v) in self.validators.iter().enumerate().skip(1) {
            let b = &self.validators[best];
            if v.proposer_priority > b.proposer_priority
                || (v.proposer_priority == b.proposer_priority && v.address < b.address)
            {
                best = i;
            }
        }
        best
    }

    /// The proposer for a given round of this height.
    ///
    /// A pure function of the set and the round: round 0 reads the current
    /// accumulator state, later rounds replay the rotation on a copy.
    pub fn proposer_for_round(&self, round: Round) -> Validator {
        if round == 0 {
            return self.proposer().clone();
        }
        let mut copy = self.clone();
        copy.increment_proposer_priority(round);
        copy.proposer().clone()
    }
}
