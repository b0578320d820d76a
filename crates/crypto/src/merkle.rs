//! Binary Merkle trees over byte vectors.
//!
//! Used for the block-parts root (the parts header commits to every part of
//! an encoded block) and for the validator-set hash. Leaves and inner nodes
//! are domain-prefixed so a leaf can never be reinterpreted as an inner node.

use crate::hash::{sha256, sha256_concat};
use crate::Hash;

/// Prefix for leaf nodes.
const LEAF_PREFIX: &[u8] = &[0x00];
/// Prefix for inner nodes.
const INNER_PREFIX: &[u8] = &[0x01];

/// Compute the Merkle root of a list of byte vectors.
///
/// An empty list hashes to the hash of the empty string; a single leaf is
/// the hash of that leaf. Odd nodes are promoted unpaired, so the tree shape
/// is unbalanced-right for non-power-of-two counts.
pub fn merkle_root<T: AsRef<[u8]>>(items: &[T]) -> Hash {
    match items.len() {
        0 => sha256(&[]),
        1 => leaf_hash(items[0].as_ref()),
        _ => {
            let mut level: Vec<Hash> = items.iter().map(|i| leaf_hash(i.as_ref())).collect();
            while level.len() > 1 {
                let mut next = Vec::with_capacity(level.len().div_ceil(2));
                for pair in level.chunks(2) {
                    match pair {
                        [left, right] => next.push(inner_hash(left, right)),
                        [odd] => next.push(*odd),
                        _ => unreachable!(),
                    }
                }
                level = next;
            }
            level[0]
        }
    }
}

#[inline]
fn leaf_hash(data: &[u8]) -> Hash {
    sha256_concat(&[LEAF_PREFIX, data])
}

#[inline]
fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    sha256_concat(&[INNER_PREFIX, left, right])
}
