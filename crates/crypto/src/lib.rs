//! # Meridian Crypto
//!
//! Cryptographic primitives for the Meridian blockchain.
//!
//! This crate provides:
//! - **SHA-256 hashing** - the canonical hash used for blocks, votes and parts
//! - **Merkle trees** - binary Merkle roots for block parts and validator sets
//! - **Ed25519 signatures** - validator signing and verification
//!
//! ## Example
//!
//! ```rust
//! use meridian_crypto::{sha256, keys::PrivateKey};
//!
//! // Hash some data
//! let hash = sha256(b"hello world");
//!
//! // Generate an Ed25519 key and sign
//! let private_key = PrivateKey::random();
//! let public_key = private_key.public_key();
//! let signature = private_key.sign(b"message");
//!
//! // Verify signature
//! assert!(public_key.verify(b"message", &signature));
//! ```

pub mod hash;
pub mod keys;
pub mod merkle;

// Re-export commonly used items
pub use hash::{sha256, sha256_concat, Hasher};
pub use keys::{Address, PrivateKey, PublicKey, Signature, ADDRESS_LENGTH};
pub use merkle::merkle_root;

/// Common type alias for a 32-byte hash
pub type Hash = [u8; 32];

/// Error types for cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Invalid private key bytes
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Invalid public key bytes
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid signature bytes
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Signature verification failed
    #[error("signature verification failed")]
    VerificationFailed,

    /// Invalid input length
    #[error("invalid input length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex decoding error
    #[error("hex decoding error: {0}")]
    HexError(String),
}

impl From<hex::FromHexError> for CryptoError {
    fn from(e: hex::FromHexError) -> Self {
        CryptoError::HexError(e.to_string())
    }
}

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;
