//! Block, BlockId and Commit types for Meridian.
//!
//! This module provides the block-related types:
//! - [`BlockHeader`] - metadata, data root and validator-set commitment
//! - [`Block`] - a complete block with header, data and the previous commit
//! - [`BlockId`] - the identity consensus votes refer to (hash + parts header)
//! - [`Commit`] - the precommit set that justified a committed block

use std::fmt;

use meridian_crypto::{merkle_root, Address, Hash, Hasher, Signature};
use serde::{Deserialize, Serialize};

use crate::part_set::{PartSet, PartSetHeader};
use crate::{Error, Result};

/// A block header containing all metadata about a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Chain identifier (prevents cross-chain replay)
    pub chain_id: String,
    /// Block height (1-indexed, the first agreed block is height 1)
    pub height: u64,
    /// Unix timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Identity of the previous block (nil for the first block)
    pub last_block_id: BlockId,
    /// Hash of the commit that finalized the previous block
    pub last_commit_hash: Hash,
    /// Merkle root of the data entries in this block
    pub data_hash: Hash,
    /// Hash of the validator set that may commit this block
    pub validators_hash: Hash,
    /// Application state hash after the previous block
    pub app_hash: Hash,
    /// Address of the block proposer
    pub proposer_address: Address,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            chain_id: String::new(),
            height: 0,
            timestamp_ms: 0,
            last_block_id: BlockId::nil(),
            last_commit_hash: [0u8; 32],
            data_hash: [0u8; 32],
            validators_hash: [0u8; 32],
            app_hash: [0u8; 32],
            proposer_address: Address::default(),
        }
    }
}

impl BlockHeader {
    /// Computes the hash of this block header.
    ///
    /// The hash is the SHA-256 of the canonical field encoding.
    pub fn hash(&self) -> Hash {
        let mut hasher = Hasher::new();
        hasher.update(&(self.chain_id.len() as u32).to_le_bytes());
        hasher.update(self.chain_id.as_bytes());
        hasher.update(&self.height.to_le_bytes());
        hasher.update(&self.timestamp_ms.to_le_bytes());
        hasher.update(&self.last_block_id.hash);
        hasher.update(&self.last_block_id.parts_header.total.to_le_bytes());
        hasher.update(&self.last_block_id.parts_header.hash);
        hasher.update(&self.last_commit_hash);
        hasher.update(&self.data_hash);
        hasher.update(&self.validators_hash);
        hasher.update(&self.app_hash);
        hasher.update(self.proposer_address.as_bytes());
        hasher.finalize()
    }

    /// Validates the header against basic structural rules.
    pub fn validate_basic(&self) -> Result<()> {
        if self.height == 0 {
            return Err(Error::InvalidBlock("header height must be positive".into()));
        }
        if self.height > 1 && self.last_block_id.is_nil() {
            return Err(Error::InvalidBlock(
                "non-initial block must reference its parent".into(),
            ));
        }
        Ok(())
    }
}

/// A complete block: header, opaque data entries and the previous commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// Opaque application payloads
    pub data: Vec<Vec<u8>>,
    /// Precommits that finalized the previous block (empty for height 1)
    pub last_commit: Commit,
}

impl Block {
    /// Build a block and fill in the header's data hash.
    pub fn new(mut header: BlockHeader, data: Vec<Vec<u8>>, last_commit: Commit) -> Self {
        header.data_hash = merkle_root(&data);
        header.last_commit_hash = last_commit.hash();
        Self {
            header,
            data,
            last_commit,
        }
    }

    /// The block hash (the header hash).
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Canonical byte encoding for part-splitting and storage.
    pub fn encode(&self) -> Vec<u8> {
        // Infallible for this type: every field serializes.
        serde_json::to_vec(self).expect("block encoding cannot fail")
    }

    /// Decode a block from its canonical encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
    }

    /// Split the encoded block into fixed-size parts.
    pub fn make_part_set(&self, part_size: usize) -> PartSet {
        PartSet::from_data(&self.encode(), part_size)
    }

    /// The full identity of this block under the given part size.
    pub fn block_id(&self, part_size: usize) -> BlockId {
        BlockId::new(self.hash(), self.make_part_set(part_size).header().clone())
    }

    /// Validates the block against basic structural rules.
    pub fn validate_basic(&self) -> Result<()> {
        self.header.validate_basic()?;
        let data_hash = merkle_root(&self.data);
        if data_hash != self.header.data_hash {
            return Err(Error::InvalidBlock(format!(
                "data hash mismatch: header {} computed {}",
                hex::encode(&self.header.data_hash[..8]),
                hex::encode(&data_hash[..8]),
            )));
        }
        if self.last_commit.hash() != self.header.last_commit_hash {
            return Err(Error::InvalidBlock("last commit hash mismatch".into()));
        }
        Ok(())
    }
}

/// The identity consensus votes refer to: block hash plus parts header.
///
/// Two `BlockId`s are equal iff both the hash and the parts header match.
/// The distinguished nil value stands for "no block" in votes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    /// Hash of the block header
    pub hash: Hash,
    /// Commitment to the block's part set
    pub parts_header: PartSetHeader,
}

impl BlockId {
    /// Construct a block id from its components.
    pub fn new(hash: Hash, parts_header: PartSetHeader) -> Self {
        Self { hash, parts_header }
    }

    /// The distinguished empty block id.
    pub fn nil() -> Self {
        Self {
            hash: [0u8; 32],
            parts_header: PartSetHeader::zero(),
        }
    }

    /// Whether this is the nil block id.
    pub fn is_nil(&self) -> bool {
        self.hash == [0u8; 32] && self.parts_header.is_zero()
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else {
            write!(
                f,
                "{}:{}",
                hex::encode(&self.hash[..8]),
                self.parts_header.total
            )
        }
    }
}

/// How a validator's slot in a commit was filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitSigFlag {
    /// The validator did not vote
    Absent,
    /// The validator precommitted the committed block
    Commit,
    /// The validator precommitted nil
    Nil,
}

/// One validator's precommit inside a [`Commit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSig {
    /// How the slot was filled
    pub flag: CommitSigFlag,
    /// The validator's address
    pub validator_address: Address,
    /// When the vote was signed (Unix millis)
    pub timestamp_ms: u64,
    /// The vote signature (all zero for absent slots)
    pub signature: Signature,
}

impl CommitSig {
    /// A placeholder for a validator that did not vote.
    pub fn absent(validator_address: Address) -> Self {
        Self {
            flag: CommitSigFlag::Absent,
            validator_address,
            timestamp_ms: 0,
            signature: Signature::default(),
        }
    }
}

/// The set of precommits meeting the 2/3 threshold for a block.
///
/// Recorded as that block's justification in the next height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Height of the committed block
    pub height: u64,
    /// Round in which the block was committed
    pub round: u32,
    /// Identity of the committed block
    pub block_id: BlockId,
    /// One entry per validator, in validator-set order
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    /// An empty commit, used as `last_commit` of the first block.
    pub fn empty() -> Self {
        Self {
            height: 0,
            round: 0,
            block_id: BlockId::nil(),
            signatures: Vec::new(),
        }
    }

    /// Whether any signatures are present.
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Hash committing to the full signature set.
    pub fn hash(&self) -> Hash {
        if self.is_empty() && self.height == 0 {
            return [0u8; 32];
        }
        let leaves: Vec<Vec<u8>> = self
            .signatures
            .iter()
            .map(|sig| {
                let mut bytes = Vec::with_capacity(96);
                bytes.push(match sig.flag {
                    CommitSigFlag::Absent => 0,
                    CommitSigFlag::Commit => 1,
                    CommitSigFlag::Nil => 2,
                });
                bytes.extend_from_slice(sig.validator_address.as_bytes());
                bytes.extend_from_slice(&sig.timestamp_ms.to_le_bytes());
                bytes.extend_from_slice(&sig.signature.to_bytes());
                bytes
            })
            .collect();
        let mut hasher = Hasher::new();
        hasher.update(&self.height.to_le_bytes());
        hasher.update(&self.round.to_le_bytes());
        hasher.update(&self.block_id.hash);
        hasher.update(&merkle_root(&leaves));
        hasher.finalize()
    }

    /// Validates the commit against basic structural rules.
    pub fn validate_basic(&self) -> Result<()> {
        if self.height == 0 {
            // The empty commit carries no signatures.
            if !self.is_empty() {
                return Err(Error::InvalidCommit(
                    "empty commit must not carry signatures".into(),
                ));
            }
            return Ok(());
        }
        if self.block_id.is_nil() {
            return Err(Error::InvalidCommit("commit for nil block".into()));
        }
        if self.is_empty() {
            return Err(Error::InvalidCommit("commit without signatures".into()));
        }
        Ok(())
    }
}
