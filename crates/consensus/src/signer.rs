//! Vote and proposal signing.
//!
//! The [`Signer`] is the only component that touches private keys. It is
//! injected into the core, and it enforces the last line of defense against
//! equivocation: once it has signed a vote at `(height, round, type)` it
//! refuses to sign a different block id at the same position, whatever the
//! state machine asks for.

use std::collections::HashMap;

use meridian_crypto::{Address, PrivateKey, PublicKey};
use meridian_types::BlockId;
use parking_lot::Mutex;
use thiserror::Error;

use crate::types::{Height, Proposal, Round, Vote, VoteType};

/// Errors returned by signers.
#[derive(Debug, Error)]
pub enum SignerError {
    /// A conflicting message at the same position was already signed
    #[error(
        "refusing to double-sign at height {height} round {round}: already signed {existing}"
    )]
    DoubleSign {
        /// Height of the conflict
        height: Height,
        /// Round of the conflict
        round: Round,
        /// The block id signed previously
        existing: BlockId,
    },

    /// The signer backend rejected the request
    #[error("signing rejected: {0}")]
    Rejected(String),
}

/// Interface to the component holding the validator's private key.
pub trait Signer: Send + Sync {
    /// The validator address of this signer.
    fn address(&self) -> Address;

    /// The public key of this signer.
    fn public_key(&self) -> PublicKey;

    /// Sign a vote in place. Must be deterministic, and must refuse to sign
    /// a vote conflicting with one already signed at the same
    /// `(height, round, type)`.
    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError>;

    /// Sign a proposal in place, with the same double-sign refusal per
    /// `(height, round)`.
    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError>;
}

#[derive(Default)]
struct LastSignState {
    votes: HashMap<(Height, Round, VoteType), BlockId>,
    proposals: HashMap<(Height, Round), BlockId>,
}

/// In-memory signer around a raw private key.
///
/// Deterministic (Ed25519 signatures carry no randomness), so re-signing
/// the identical message is idempotent and allowed.
pub struct LocalSigner {
    key: PrivateKey,
    last: Mutex<LastSignState>,
}

impl LocalSigner {
    /// Wrap a private key.
    pub fn new(key: PrivateKey) -> Self {
        Self {
            key,
            last: Mutex::new(LastSignState::default()),
        }
    }
}

impl Signer for LocalSigner {
    fn address(&self) -> Address {
        self.key.address()
    }

    fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError> {
        let mut last = self.last.lock();
        let slot = (vote.height, vote.round, vote.vote_type);
        if let Some(existing) = last.votes.get(&slot) {
            if *existing != vote.block_id {
                return Err(SignerError::DoubleSign {
                    height: vote.height,
                    round: vote.round,
                    existing: existing.clone(),
                });
            }
        }
        last.votes.insert(slot, vote.block_id.clone());
        vote.signature = self.key.sign(&vote.signing_bytes(chain_id));
        Ok(())
    }

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError> {
        let mut last = self.last.lock();
        let slot = (proposal.height, proposal.round);
        if let Some(existing) = last.proposals.get(&slot) {
            if *existing != proposal.block_id {
                return Err(SignerError::DoubleSign {
                    height: proposal.height,
                    round: proposal.round,
                    existing: existing.clone(),
                });
            }
        }
        last.proposals.insert(slot, proposal.block_id.clone());
        proposal.signature = self.key.sign(&proposal.signing_bytes(chain_id));
        Ok(())
    }
}
