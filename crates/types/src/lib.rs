//! # Meridian Types
//!
//! Core chain types shared by consensus, storage and networking:
//! - [`BlockHeader`] and [`Block`] - the unit of agreement
//! - [`BlockId`] - hash plus parts header, the identity votes refer to
//! - [`PartSet`] - a block streamed as fixed-size, Merkle-committed parts
//! - [`Commit`] - the set of precommits justifying a committed block

pub mod block;
pub mod part_set;

pub use block::{Block, BlockHeader, BlockId, Commit, CommitSig, CommitSigFlag};
pub use part_set::{Part, PartSet, PartSetError, PartSetHeader, MAX_BLOCK_PARTS};

pub use meridian_crypto::{Address, Hash};

/// Errors produced by type-level validation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A structural rule on a block or header was violated
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// A commit failed basic validation
    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    /// Encoding or decoding failed
    #[error("codec error: {0}")]
    Codec(String),
}

/// Result type for type-level operations.
pub type Result<T> = std::result::Result<T, Error>;
