//! Core digest types used throughout the Signet ledger.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// ---------------------------------------------------------------------------
// Hash: 32-byte SHA-256 digest wrapper
// ---------------------------------------------------------------------------

/// A SHA-256 hash digest.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Number of hex characters in a rendered digest.
    pub const HEX_LEN: usize = 64;

    /// Create a hash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute SHA-256 of arbitrary data.
    pub fn compute(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    /// Finalize an in-progress SHA-256 state.
    pub fn from_hasher(hasher: Sha256) -> Self {
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Return the hex-encoded representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Count leading `'0'` characters of the hex rendering without allocating.
    pub fn leading_zero_hex_digits(&self) -> usize {
        let mut count = 0;
        for byte in self.0 {
            if byte == 0 {
                count += 2;
                continue;
            }
            if byte < 0x10 {
                count += 1;
            }
            break;
        }
        count
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}..{})", &self.to_hex()[..8], &self.to_hex()[56..])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// SHA-256 over the UTF-8 bytes of `input`, lowercase hex.
pub fn sha256_hex(input: &str) -> String {
    Hash::compute(input.as_bytes()).to_hex()
}

// ---------------------------------------------------------------------------
// Hashable trait
// ---------------------------------------------------------------------------

/// Trait for types that can produce a canonical byte representation for hashing.
pub trait Hashable {
    /// Serialize to canonical bytes for hashing.
    fn to_hash_bytes(&self) -> Vec<u8>;

    /// Compute the SHA-256 hash of the canonical bytes.
    fn hash(&self) -> Hash {
        Hash::compute(&self.to_hash_bytes())
    }
}

// ---------------------------------------------------------------------------
// Utility functions
// ---------------------------------------------------------------------------

/// Return a simple current timestamp in milliseconds.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
