//! Block structure for the Signet ledger.
//!
//! A block is a single record `{index, timestamp, data, previousHash, nonce,
//! difficulty}`. Its digest is the SHA-256 of those fields rendered as
//! decimal/plain strings and concatenated with no separators.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{Hash, Hashable};

/// Payload of the genesis block.
pub const GENESIS_DATA: &str = "Genesis";

/// A single ledger block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Position in the chain (0 for genesis).
    pub index: u64,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// Transaction payload.
    pub data: String,
    /// Hex digest of the predecessor (empty for genesis).
    pub previous_hash: String,
    /// Mutated only by the proof-of-work engine.
    pub nonce: u64,
    /// Required leading zero hex digits. Values <= 0 are always satisfied.
    pub difficulty: i32,
}

impl Block {
    /// Create an unmined block with an empty previous hash and zero nonce.
    pub fn new(index: u64, timestamp: u64, data: impl Into<String>, difficulty: i32) -> Self {
        Self {
            index,
            timestamp,
            data: data.into(),
            previous_hash: String::new(),
            nonce: 0,
            difficulty,
        }
    }

    /// Create the (unmined) genesis block.
    pub fn genesis(timestamp: u64, difficulty: i32) -> Self {
        Self::new(0, timestamp, GENESIS_DATA, difficulty)
    }

    /// The part of the hash input that does not change while mining.
    pub fn hash_prefix(&self) -> String {
        format!(
            "{}{}{}{}",
            self.index, self.timestamp, self.data, self.previous_hash
        )
    }

    /// SHA-256 state primed with [`Block::hash_prefix`].
    pub fn prefix_hasher(&self) -> Sha256 {
        Sha256::new_with_prefix(self.hash_prefix().as_bytes())
    }

    /// Recompute this block's digest from its current fields.
    pub fn calculate_hash(&self) -> Hash {
        self.hash()
    }

    /// Hex rendering of [`Block::calculate_hash`].
    pub fn hash_hex(&self) -> String {
        self.calculate_hash().to_hex()
    }
}

impl Hashable for Block {
    fn to_hash_bytes(&self) -> Vec<u8> {
        format!("{}{}{}", self.hash_prefix(), self.nonce, self.difficulty).into_bytes()
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sha256_hex;

    fn now() -> u64 {
        1_700_000_000_000
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis(now(), 2);

        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.data, GENESIS_DATA);
        assert!(genesis.previous_hash.is_empty());
        assert_eq!(genesis.nonce, 0);
        assert_eq!(genesis.difficulty, 2);
    }

    #[test]
    fn test_hash_input_is_plain_concatenation() {
        let mut block = Block::new(3, 1234, "pay bob", 4);
        block.previous_hash = "00ab".into();
        block.nonce = 77;

        assert_eq!(block.hash_prefix(), "31234pay bob00ab");
        assert_eq!(block.hash_hex(), sha256_hex("31234pay bob00ab774"));
    }

    #[test]
    fn test_block_hash_deterministic() {
        let block = Block::genesis(now(), 2);
        assert_eq!(block.calculate_hash(), block.calculate_hash());
    }

    #[test]
    fn test_nonce_changes_hash() {
        let mut block = Block::genesis(now(), 2);
        let before = block.calculate_hash();
        block.nonce += 1;
        assert_ne!(before, block.calculate_hash());
    }

    #[test]
    fn test_prefix_hasher_matches_full_hash() {
        let mut block = Block::new(1, now(), "x", 3);
        block.previous_hash = sha256_hex("prev");
        block.nonce = 9001;

        let mut hasher = block.prefix_hasher();
        hasher.update(block.nonce.to_string().as_bytes());
        hasher.update(block.difficulty.to_string().as_bytes());
        assert_eq!(Hash::from_hasher(hasher), block.calculate_hash());
    }

    #[test]
    fn test_block_serialization_field_names() {
        let block = Block::genesis(now(), 2);
        let json = serde_json::to_value(&block).expect("serialize");

        assert!(json.get("previousHash").is_some());
        assert_eq!(json["data"], "Genesis");
        assert_eq!(json["difficulty"], 2);
        assert_eq!(block.to_string(), serde_json::to_string(&block).unwrap());
    }
}
