//! External collaborators of the consensus core.
//!
//! Block production, validation and application belong to the application
//! layer; persistence of decided blocks belongs to the store. The core
//! drives both through these traits and holds no other coupling to them.

use async_trait::async_trait;
use meridian_types::{Block, Commit, PartSet};

use crate::types::{Height, ValidatorSet};

/// Application hooks for creating, validating and applying blocks.
#[async_trait]
pub trait BlockExecutor: Send + Sync {
    /// Build a fresh proposal block for `height`.
    ///
    /// `last_commit` is the precommit set justifying the previous block and
    /// is embedded in the new block. Returning `None` means there is
    /// nothing to propose yet (empty-block creation disabled and no
    /// payload available).
    async fn create_proposal_block(&self, height: Height, last_commit: &Commit) -> Option<Block>;

    /// Validate a proposed block against application rules.
    async fn validate_block(&self, block: &Block) -> Result<(), String>;

    /// Apply a committed block to application state.
    ///
    /// Returns the validator set for the next height, or `None` if it is
    /// unchanged. A failure here is fatal to consensus.
    async fn apply_block(&self, block: &Block, commit: &Commit)
        -> Result<Option<ValidatorSet>, String>;
}

/// Persistent storage for decided blocks.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Persist a committed block, its part set and its justifying commit.
    /// A height once written is immutable.
    async fn save_block(&self, block: Block, parts: PartSet, commit: Commit)
        -> Result<(), String>;
}
