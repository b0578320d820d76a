//! # SHA-256 Hashing Utilities
//!
//! This module provides the SHA-256 hashing functions used throughout
//! Meridian for block hashes, vote digests and part roots.
//!
//! ## Functions
//!
//! - `sha256` - Hash a single byte slice
//! - `sha256_concat` - Hash multiple byte slices concatenated
//!
//! ## Streaming Hasher
//!
//! For large or incremental data, use the `Hasher` struct:
//!
//! ```rust
//! use meridian_crypto::hash::Hasher;
//!
//! let mut hasher = Hasher::new();
//! hasher.update(b"hello");
//! hasher.update(b" world");
//! let hash = hasher.finalize();
//! ```

use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of the input data.
///
/// # Arguments
///
/// * `data` - The byte slice to hash
///
/// # Returns
///
/// A 32-byte array containing the SHA-256 hash
#[inline]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the SHA-256 hash of multiple concatenated inputs.
///
/// This is more efficient than manually concatenating the inputs
/// and then hashing, as it avoids allocating a temporary buffer.
#[inline]
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// A streaming SHA-256 hasher for incremental input.
#[derive(Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    /// Create a new empty hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more data into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Consume the hasher and return the final digest.
    pub fn finalize(self) -> [u8; 32] {
        self.inner.finalize().into()
    }
}
