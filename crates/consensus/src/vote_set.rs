//! Vote collection and threshold detection.
//!
//! A [`VoteSet`] tallies the votes of one `(height, round, vote_type)`:
//! one slot per validator index, running power totals per block id, and the
//! three thresholds the state machine acts on (2/3 majority for one block,
//! 2/3 of total power across all blocks, 1/3 of total power across all
//! blocks). A conflicting second vote from the same validator is returned as
//! [`DuplicateVoteEvidence`] and never tallied.
//!
//! [`HeightVoteSet`] owns the vote sets of every round of the current
//! height, plus the future-round power tally behind the round-skip rule.

use std::collections::{BTreeMap, HashMap, HashSet};

use meridian_types::{BlockId, Commit, CommitSig, CommitSigFlag};
use tracing::{debug, trace};

use crate::evidence::DuplicateVoteEvidence;
use crate::types::{Height, PeerId, Round, ValidatorSet, Vote, VoteType};

/// Reasons a vote is rejected without being tallied.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VoteSetError {
    /// Vote height does not match the set
    #[error("vote height {vote_height} does not match expected {expected_height}")]
    WrongHeight {
        vote_height: u64,
        expected_height: u64,
    },

    /// Vote round does not match the set
    #[error("vote round {vote_round} does not match expected {expected_round}")]
    WrongRound {
        vote_round: u32,
        expected_round: u32,
    },

    /// Vote type does not match the set
    #[error("vote type mismatch")]
    WrongType,

    /// The claimed validator index is not in the set
    #[error("unknown validator index {0}")]
    UnknownValidator(u32),

    /// The vote's address does not belong to the claimed index
    #[error("address mismatch for validator index {0}")]
    AddressMismatch(u32),

    /// The signature does not verify
    #[error("invalid signature from validator index {0}")]
    InvalidSignature(u32),

    /// The validator already voted identically, or re-voted in a way that is
    /// not slashable (one side nil)
    #[error("duplicate vote from validator index {0}")]
    DuplicateVote(u32),

    /// A peer claimed two different 2/3 majorities for this set
    #[error("peer {peer} already claimed a different 2/3 majority")]
    ConflictingMaj23Claim { peer: PeerId },
}

/// Outcome of a successful `add_vote`.
///
/// `conflicting` carries slashable evidence when the validator had already
/// voted for a different non-nil block; the new vote is then *not* tallied.
#[derive(Debug)]
pub struct VoteAdded {
    /// Evidence of equivocation, if the vote conflicted
    pub conflicting: Option<DuplicateVoteEvidence>,
}

impl VoteAdded {
    fn clean() -> Self {
        Self { conflicting: None }
    }
}

/// Collection of votes for a specific `(height, round, vote_type)`.
#[derive(Debug, Clone)]
pub struct VoteSet {
    chain_id: String,
    height: Height,
    round: Round,
    vote_type: VoteType,
    /// One slot per validator index
    votes: Vec<Option<Vote>>,
    /// Tallied power per block id
    power_by_block: HashMap<BlockId, u128>,
    /// Total tallied power across all block ids
    voted_power: u128,
    /// Which peers claim to have seen a 2/3 majority, and for what
    peer_maj23: HashMap<PeerId, BlockId>,
}

impl VoteSet {
    /// Create a vote set sized for the given validator set.
    pub fn new(
        chain_id: impl Into<String>,
        height: Height,
        round: Round,
        vote_type: VoteType,
        validators: &ValidatorSet,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            height,
            round,
            vote_type,
            votes: vec![None; validators.len()],
            power_by_block: HashMap::new(),
            voted_power: 0,
            peer_maj23: HashMap::new(),
        }
    }

    /// The height of this set.
    pub fn height(&self) -> Height {
        self.height
    }

    /// The round of this set.
    pub fn round(&self) -> Round {
        self.round
    }

    /// The vote type of this set.
    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Number of tallied votes.
    pub fn count(&self) -> usize {
        self.votes.iter().filter(|v| v.is_some()).count()
    }

    /// Whether every validator has voted.
    pub fn has_all(&self) -> bool {
        self.votes.iter().all(|v| v.is_some())
    }

    /// The tallied vote of a validator, if any.
    pub fn get_vote(&self, validator_index: u32) -> Option<&Vote> {
        self.votes.get(validator_index as usize)?.as_ref()
    }

    /// Tallied power for a specific block id.
    pub fn power_of(&self, block_id: &BlockId) -> u128 {
        self.power_by_block.get(block_id).copied().unwrap_or(0)
    }

    /// Total tallied power.
    pub fn voted_power(&self) -> u128 {
        self.voted_power
    }

    /// Indices of validators with a tallied vote.
    pub fn voter_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.votes
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_some())
            .map(|(i, _)| i as u32)
    }

    /// Add a vote, verifying membership and signature.
    ///
    /// Returns [`VoteAdded`] on success; a conflicting non-nil re-vote is
    /// reported as evidence and not tallied. All other anomalies are
    /// rejections that leave the set unchanged.
    pub fn add_vote(
        &mut self,
        vote: Vote,
        validators: &ValidatorSet,
    ) -> Result<VoteAdded, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::WrongHeight {
                vote_height: vote.height,
                expected_height: self.height,
            });
        }
        if vote.round != self.round {
            return Err(VoteSetError::WrongRound {
                vote_round: vote.round,
                expected_round: self.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(VoteSetError::WrongType);
        }

        let validator = validators
            .get_by_index(vote.validator_index)
            .ok_or(VoteSetError::UnknownValidator(vote.validator_index))?;
        if validator.address != vote.validator_address {
            return Err(VoteSetError::AddressMismatch(vote.validator_index));
        }

        if !validator
            .pub_key
            .verify(&vote.signing_bytes(&self.chain_id), &vote.signature)
        {
            return Err(VoteSetError::InvalidSignature(vote.validator_index));
        }

        if let Some(existing) = &self.votes[vote.validator_index as usize] {
            if existing.block_id == vote.block_id {
                return Err(VoteSetError::DuplicateVote(vote.validator_index));
            }
            // A differing re-vote: slashable when both sides are non-nil.
            return match DuplicateVoteEvidence::new(existing.clone(), vote.clone()) {
                Ok(evidence) => {
                    debug!(
                        height = self.height,
                        round = self.round,
                        vote_type = %self.vote_type,
                        validator = %evidence.validator_address,
                        "Conflicting vote recorded as evidence"
                    );
                    Ok(VoteAdded {
                        conflicting: Some(evidence),
                    })
                }
                Err(_) => Err(VoteSetError::DuplicateVote(vote.validator_index)),
            };
        }

        trace!(
            height = self.height,
            round = self.round,
            vote_type = %self.vote_type,
            validator = vote.validator_index,
            block_id = %vote.block_id,
            "Adding vote"
        );

        let power = validator.voting_power as u128;
        let validator_index = vote.validator_index as usize;
        *self.power_by_block.entry(vote.block_id.clone()).or_default() += power;
        self.voted_power += power;
        self.votes[validator_index] = Some(vote);

        Ok(VoteAdded::clean())
    }

    /// The block id holding a 2/3 majority, if any (may be nil).
    pub fn two_thirds_majority(&self, validators: &ValidatorSet) -> Option<BlockId> {
        let quorum = validators.quorum_power();
        self.power_by_block
            .iter()
            .find(|(_, power)| **power >= quorum)
            .map(|(id, _)| id.clone())
    }

    /// Whether a specific block id holds a 2/3 majority.
    pub fn has_two_thirds_for(&self, block_id: &BlockId, validators: &ValidatorSet) -> bool {
        self.power_of(block_id) >= validators.quorum_power()
    }

    /// Whether more than 2/3 of total power has voted, for any block ids.
    pub fn has_two_thirds_any(&self, validators: &ValidatorSet) -> bool {
        self.voted_power * 3 > (validators.total_power() as u128) * 2
    }

    /// Whether more than 1/3 of total power has voted, for any block ids.
    pub fn has_one_third_any(&self, validators: &ValidatorSet) -> bool {
        self.voted_power * 3 > validators.total_power() as u128
    }

    /// Record a peer's claim of a 2/3 majority for a block id.
    ///
    /// Used by gossip to learn which parts to request. A peer changing its
    /// claim is rejected.
    pub fn set_peer_maj23(
        &mut self,
        peer: PeerId,
        block_id: BlockId,
    ) -> Result<(), VoteSetError> {
        match self.peer_maj23.get(&peer) {
            Some(existing) if *existing != block_id => {
                Err(VoteSetError::ConflictingMaj23Claim { peer })
            }
            _ => {
                self.peer_maj23.insert(peer, block_id);
                Ok(())
            }
        }
    }

    /// The block id a peer claims has a 2/3 majority, if recorded.
    pub fn peer_maj23(&self, peer: &PeerId) -> Option<&BlockId> {
        self.peer_maj23.get(peer)
    }

    /// Build the commit justified by this precommit set.
    ///
    /// Returns `None` unless this is a precommit set with a non-nil 2/3
    /// majority.
    pub fn make_commit(&self, validators: &ValidatorSet) -> Option<Commit> {
        if self.vote_type != VoteType::Precommit {
            return None;
        }
        let block_id = self.two_thirds_majority(validators)?;
        if block_id.is_nil() {
            return None;
        }

        let signatures = validators
            .validators()
            .iter()
            .enumerate()
            .map(|(i, v)| match &self.votes[i] {
                Some(vote) if vote.block_id == block_id => CommitSig {
                    flag: CommitSigFlag::Commit,
                    validator_address: v.address,
                    timestamp_ms: vote.timestamp_ms,
                    signature: vote.signature.clone(),
                },
                Some(vote) if vote.is_nil() => CommitSig {
                    flag: CommitSigFlag::Nil,
                    validator_address: v.address,
                    timestamp_ms: vote.timestamp_ms,
                    signature: vote.signature.clone(),
                },
                _ => CommitSig::absent(v.address),
            })
            .collect();

        Some(Commit {
            height: self.height,
            round: self.round,
            block_id,
            signatures,
        })
    }
}

/// Tracks vote sets across all rounds of a single height.
#[derive(Debug)]
pub struct HeightVoteSet {
    chain_id: String,
    height: Height,
    round: Round,
    prevotes: BTreeMap<Round, VoteSet>,
    precommits: BTreeMap<Round, VoteSet>,
}

impl HeightVoteSet {
    /// Create an empty height vote set.
    pub fn new(chain_id: impl Into<String>, height: Height) -> Self {
        Self {
            chain_id: chain_id.into(),
            height,
            round: 0,
            prevotes: BTreeMap::new(),
            precommits: BTreeMap::new(),
        }
    }

    /// The height this set tracks.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Advance the current-round marker.
    pub fn set_round(&mut self, round: Round) {
        if round > self.round {
            self.round = round;
        }
    }

    /// The prevote set of a round, created on first use.
    pub fn prevotes_mut(&mut self, round: Round, validators: &ValidatorSet) -> &mut VoteSet {
        self.prevotes.entry(round).or_insert_with(|| {
            VoteSet::new(
                self.chain_id.clone(),
                self.height,
                round,
                VoteType::Prevote,
                validators,
            )
        })
    }

    /// The precommit set of a round, created on first use.
    pub fn precommits_mut(&mut self, round: Round, validators: &ValidatorSet) -> &mut VoteSet {
        self.precommits.entry(round).or_insert_with(|| {
            VoteSet::new(
                self.chain_id.clone(),
                self.height,
                round,
                VoteType::Precommit,
                validators,
            )
        })
    }

    /// The prevote set of a round, if any votes arrived.
    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.prevotes.get(&round)
    }

    /// The precommit set of a round, if any votes arrived.
    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.precommits.get(&round)
    }

    /// Route a vote into the matching per-round set.
    pub fn add_vote(
        &mut self,
        vote: Vote,
        validators: &ValidatorSet,
    ) -> Result<VoteAdded, VoteSetError> {
        let round = vote.round;
        match vote.vote_type {
            VoteType::Prevote => self.prevotes_mut(round, validators).add_vote(vote, validators),
            VoteType::Precommit => self
                .precommits_mut(round, validators)
                .add_vote(vote, validators),
        }
    }

    /// Whether a prevote polka for `block_id` exists at `round`.
    pub fn has_polka_at(
        &self,
        round: Round,
        block_id: &BlockId,
        validators: &ValidatorSet,
    ) -> bool {
        self.prevotes(round)
            .map(|set| set.has_two_thirds_for(block_id, validators))
            .unwrap_or(false)
    }

    /// Whether more than 1/3 of total power has voted (either type) at `round`.
    ///
    /// The round-skip rule: such a round has at least one honest validator,
    /// so a lagging node can safely jump to it.
    pub fn one_third_any_at(&self, round: Round, validators: &ValidatorSet) -> bool {
        let mut indices: HashSet<u32> = HashSet::new();
        if let Some(set) = self.prevotes(round) {
            indices.extend(set.voter_indices());
        }
        if let Some(set) = self.precommits(round) {
            indices.extend(set.voter_indices());
        }
        let power: u128 = indices
            .iter()
            .filter_map(|i| validators.get_by_index(*i))
            .map(|v| v.voting_power as u128)
            .sum();
        power * 3 > validators.total_power() as u128
    }
}
