//! Duplicate-vote evidence.
//!
//! A validator that signs two different non-nil votes at the same
//! `(height, round, vote_type)` has equivocated. The conflicting pair is
//! proof: both votes carry valid signatures from the same key, so the pair
//! is slashable by anyone who can verify it. The tallier produces evidence
//! values as plain data; the state machine forwards them upstream and keeps
//! no reference past the current handler.

use meridian_crypto::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ValidatorSet, Vote, VoteType};

/// Errors that can occur while building or validating evidence.
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// Votes are from different validators
    #[error("votes from different validators: {0} vs {1}")]
    DifferentValidators(Address, Address),

    /// Votes are at different heights
    #[error("votes at different heights: {0} vs {1}")]
    DifferentHeights(u64, u64),

    /// Votes are in different rounds
    #[error("votes in different rounds: {0} vs {1}")]
    DifferentRounds(u32, u32),

    /// Votes have different types (prevote vs precommit)
    #[error("votes have different types: {0} vs {1}")]
    DifferentVoteTypes(VoteType, VoteType),

    /// Votes have the same block id, which is not equivocation
    #[error("votes have the same block id - not equivocation")]
    SameBlockId,

    /// One of the votes is nil; only conflicting non-nil votes are slashable
    #[error("nil vote cannot form duplicate-vote evidence")]
    NilVote,

    /// Validator not found in the validator set
    #[error("validator {0} not found in validator set")]
    UnknownValidator(Address),

    /// A signature on one of the votes does not verify
    #[error("invalid signature on {0} vote from {1}")]
    InvalidSignature(&'static str, Address),
}

/// Proof that a validator double-signed: two conflicting votes at the same
/// `(height, round, vote_type)` with different non-nil block ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateVoteEvidence {
    /// First conflicting vote
    pub vote_a: Vote,
    /// Second conflicting vote
    pub vote_b: Vote,
    /// Height at which the equivocation occurred
    pub height: u64,
    /// The offending validator
    pub validator_address: Address,
}

impl DuplicateVoteEvidence {
    /// Build evidence from two conflicting votes.
    ///
    /// Performs the structural checks only; call [`Self::verify`] with the
    /// validator set to check both signatures.
    pub fn new(vote_a: Vote, vote_b: Vote) -> Result<Self, EvidenceError> {
        if vote_a.validator_address != vote_b.validator_address {
            return Err(EvidenceError::DifferentValidators(
                vote_a.validator_address,
                vote_b.validator_address,
            ));
        }
        if vote_a.height != vote_b.height {
            return Err(EvidenceError::DifferentHeights(vote_a.height, vote_b.height));
        }
        if vote_a.round != vote_b.round {
            return Err(EvidenceError::DifferentRounds(vote_a.round, vote_b.round));
        }
        if vote_a.vote_type != vote_b.vote_type {
            return Err(EvidenceError::DifferentVoteTypes(
                vote_a.vote_type,
                vote_b.vote_type,
            ));
        }
        if vote_a.block_id == vote_b.block_id {
            return Err(EvidenceError::SameBlockId);
        }
        if vote_a.block_id.is_nil() || vote_b.block_id.is_nil() {
            return Err(EvidenceError::NilVote);
        }

        Ok(Self {
            height: vote_a.height,
            validator_address: vote_a.validator_address,
            vote_a,
            vote_b,
        })
    }

    /// Verify both signatures against the validator set for this height.
    pub fn verify(
        &self,
        chain_id: &str,
        validators: &ValidatorSet,
    ) -> Result<(), EvidenceError> {
        let (_, validator) = validators
            .get_by_address(&self.validator_address)
            .ok_or(EvidenceError::UnknownValidator(self.validator_address))?;

        if !validator
            .pub_key
            .verify(&self.vote_a.signing_bytes(chain_id), &self.vote_a.signature)
        {
            return Err(EvidenceError::InvalidSignature("first", self.validator_address));
        }
        if !validator
            .pub_key
            .verify(&self.vote_b.signing_bytes(chain_id), &self.vote_b.signature)
        {
            return Err(EvidenceError::InvalidSignature(
                "second",
                self.validator_address,
            ));
        }
        Ok(())
    }
}
