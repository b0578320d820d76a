//! Block parts: streaming a block as fixed-size, Merkle-committed chunks.
//!
//! A block is encoded and split into parts of `part_size` bytes (the final
//! part may be shorter). The Merkle root over the parts is carried in the
//! [`PartSetHeader`], which travels inside every `BlockId`. Receivers collect
//! parts out of order and can only decode the block once every part is
//! present and the recomputed root matches the header.

use meridian_crypto::{merkle_root, Hash};
use serde::{Deserialize, Serialize};

/// Upper bound on the number of parts in a single block.
///
/// Caps memory for a partially assembled block regardless of what a peer
/// claims in a parts header.
pub const MAX_BLOCK_PARTS: u32 = 1601;

/// Errors from part-set assembly.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PartSetError {
    /// Part index is outside the header's range
    #[error("part index {index} out of bounds (total {total})")]
    IndexOutOfBounds { index: u32, total: u32 },

    /// Part payload exceeds the configured part size
    #[error("part {index} is {size} bytes, exceeding the {max} byte part size")]
    PartTooLarge { index: u32, size: usize, max: usize },

    /// Header claims more parts than the protocol allows
    #[error("parts header claims {total} parts, above the {MAX_BLOCK_PARTS} cap")]
    TooManyParts { total: u32 },

    /// All parts are present but their Merkle root disagrees with the header
    #[error("parts root mismatch: header {header}, computed {computed}")]
    RootMismatch { header: String, computed: String },

    /// Not every part has arrived yet
    #[error("part set incomplete: {count}/{total}")]
    Incomplete { count: u32, total: u32 },
}

/// Commitment to a block's part set: part count and Merkle root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartSetHeader {
    /// Number of parts the encoded block was split into
    pub total: u32,
    /// Merkle root over the part payloads
    pub hash: Hash,
}

impl PartSetHeader {
    /// Construct a parts header.
    pub fn new(total: u32, hash: Hash) -> Self {
        Self { total, hash }
    }

    /// The zero header, used inside the nil `BlockId`.
    pub fn zero() -> Self {
        Self {
            total: 0,
            hash: [0u8; 32],
        }
    }

    /// Whether this is the zero header.
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash == [0u8; 32]
    }
}

impl Default for PartSetHeader {
    fn default() -> Self {
        Self::zero()
    }
}

/// One chunk of an encoded block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// Position of this chunk, `0..total`
    pub index: u32,
    /// Raw chunk bytes
    pub bytes: Vec<u8>,
}

/// A (possibly partial) set of block parts.
///
/// Constructed either from the full encoded block (proposer side) or from a
/// parts header alone (receiver side, filled in by gossip).
#[derive(Debug, Clone)]
pub struct PartSet {
    header: PartSetHeader,
    part_size: usize,
    parts: Vec<Option<Part>>,
    count: u32,
    byte_size: usize,
}

impl PartSet {
    /// Split encoded data into parts and compute the committing header.
    pub fn from_data(data: &[u8], part_size: usize) -> Self {
        assert!(part_size > 0, "part size must be positive");
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(part_size).collect()
        };
        let hash = merkle_root(&chunks);
        let total = chunks.len() as u32;
        let parts: Vec<Option<Part>> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                Some(Part {
                    index: i as u32,
                    bytes: c.to_vec(),
                })
            })
            .collect();
        Self {
            header: PartSetHeader::new(total, hash),
            part_size,
            count: total,
            byte_size: data.len(),
            parts,
        }
    }

    /// Start an empty set that will be filled from gossip.
    pub fn new_from_header(header: PartSetHeader, part_size: usize) -> Result<Self, PartSetError> {
        if header.total > MAX_BLOCK_PARTS {
            return Err(PartSetError::TooManyParts {
                total: header.total,
            });
        }
        Ok(Self {
            parts: vec![None; header.total as usize],
            header,
            part_size,
            count: 0,
            byte_size: 0,
        })
    }

    /// The committing header.
    pub fn header(&self) -> &PartSetHeader {
        &self.header
    }

    /// Parts received so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Parts expected in total.
    pub fn total(&self) -> u32 {
        self.header.total
    }

    /// Total bytes buffered so far.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Whether every part has arrived.
    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    /// Whether the part at `index` is present.
    pub fn has_part(&self, index: u32) -> bool {
        self.parts
            .get(index as usize)
            .map(|p| p.is_some())
            .unwrap_or(false)
    }

    /// Fetch a part for gossip, if present.
    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(|p| p.as_ref())
    }

    /// Add a part received from a peer.
    ///
    /// Returns `Ok(true)` if the part was new, `Ok(false)` if it was already
    /// present. Index and size bounds are enforced here; the Merkle root is
    /// checked at assembly time, once all parts are in.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        if part.index >= self.header.total {
            return Err(PartSetError::IndexOutOfBounds {
                index: part.index,
                total: self.header.total,
            });
        }
        if part.bytes.len() > self.part_size {
            return Err(PartSetError::PartTooLarge {
                index: part.index,
                size: part.bytes.len(),
                max: self.part_size,
            });
        }
        let slot = &mut self.parts[part.index as usize];
        if slot.is_some() {
            return Ok(false);
        }
        self.count += 1;
        self.byte_size += part.bytes.len();
        *slot = Some(part);
        Ok(true)
    }

    /// Reassemble the encoded block.
    ///
    /// Fails with [`PartSetError::Incomplete`] while parts are missing and
    /// with [`PartSetError::RootMismatch`] if the collected parts do not
    /// hash to the committed root; on mismatch the caller must discard the
    /// whole set and re-request gossip.
    pub fn assemble(&self) -> Result<Vec<u8>, PartSetError> {
        if !self.is_complete() {
            return Err(PartSetError::Incomplete {
                count: self.count,
                total: self.header.total,
            });
        }
        let chunks: Vec<&[u8]> = self
            .parts
            .iter()
            .map(|p| p.as_ref().expect("complete set has every part").bytes.as_slice())
            .collect();
        let computed = merkle_root(&chunks);
        if computed != self.header.hash {
            return Err(PartSetError::RootMismatch {
                header: hex::encode(&self.header.hash[..8]),
                computed: hex::encode(&computed[..8]),
            });
        }
        Ok(chunks.concat())
    }
}
