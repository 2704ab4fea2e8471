//! Proof-of-work engine.
//!
//! Mining searches for a nonce such that the block digest starts with
//! `difficulty` zero hex digits. The search has no upper bound on attempts;
//! difficulty is the only cost knob. The cancellable variant polls a
//! [`CancelToken`] every [`CANCEL_CHECK_INTERVAL`] attempts so callers can
//! bound the work without changing its semantics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::block::Block;
use crate::error::{ChainError, Result};
use crate::types::Hash;

/// Attempts between two cancellation checks.
pub const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Highest satisfiable difficulty: one zero per hex digit of the digest.
pub const MAX_DIFFICULTY: i32 = Hash::HEX_LEN as i32;

/// Input hashed repeatedly when measuring local throughput.
pub const HASH_RATE_INPUT: &str = "00000000";

// ---------------------------------------------------------------------------
// Difficulty predicate
// ---------------------------------------------------------------------------

/// Whether a hex digest starts with `difficulty` `'0'` characters.
///
/// `difficulty <= 0` is always satisfied; a difficulty longer than the
/// digest can never be.
pub fn meets_difficulty(hex_digest: &str, difficulty: i32) -> bool {
    if difficulty <= 0 {
        return true;
    }
    let required = difficulty as usize;
    if required > hex_digest.len() {
        return false;
    }
    hex_digest.bytes().take(required).all(|c| c == b'0')
}

/// [`meets_difficulty`] on a raw digest, without hex encoding it.
pub fn hash_meets_difficulty(hash: &Hash, difficulty: i32) -> bool {
    difficulty <= 0 || hash.leading_zero_hex_digits() >= difficulty as usize
}

/// Theoretical number of attempts to meet `difficulty` (`16^difficulty`).
pub fn expected_attempts(difficulty: i32) -> f64 {
    16f64.powi(difficulty)
}

// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Shared cancellation flag for long-running mining work.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Miner
// ---------------------------------------------------------------------------

/// Incremental nonce search over one block.
///
/// The SHA-256 state over the fixed prefix is computed once and cloned per
/// attempt; only `nonce ‖ difficulty` is hashed on each step.
struct Miner<'a> {
    block: &'a mut Block,
    prefix: Sha256,
    difficulty: String,
}

impl<'a> Miner<'a> {
    fn new(block: &'a mut Block) -> Self {
        let prefix = block.prefix_hasher();
        let difficulty = block.difficulty.to_string();
        Self {
            block,
            prefix,
            difficulty,
        }
    }

    fn current_hash(&mut self) -> Hash {
        let mut hasher = self.prefix.clone();
        hasher.update(self.block.nonce.to_string().as_bytes());
        hasher.update(self.difficulty.as_bytes());
        Hash::from_hasher(hasher)
    }

    /// Try up to `attempts` nonces, starting with the current one.
    fn run(&mut self, attempts: u64) -> Option<Hash> {
        for _ in 0..attempts {
            let hash = self.current_hash();
            if hash_meets_difficulty(&hash, self.block.difficulty) {
                return Some(hash);
            }
            // 2^64 attempts is far beyond any reachable difficulty
            self.block.nonce = self.block.nonce.wrapping_add(1);
        }
        None
    }
}

/// Mine `block` in place and return its digest.
///
/// The search starts from the block's current nonce, so a block that already
/// satisfies its difficulty is returned unchanged.
pub fn mine(block: &mut Block) -> Hash {
    let mut miner = Miner::new(block);
    loop {
        if let Some(hash) = miner.run(CANCEL_CHECK_INTERVAL) {
            return hash;
        }
    }
}

/// Like [`mine`], but gives up with [`ChainError::MiningCancelled`] once
/// `cancel` is set.
pub fn mine_cancellable(block: &mut Block, cancel: &CancelToken) -> Result<Hash> {
    let mut miner = Miner::new(block);
    loop {
        if let Some(hash) = miner.run(CANCEL_CHECK_INTERVAL) {
            return Ok(hash);
        }
        if cancel.is_cancelled() {
            return Err(ChainError::MiningCancelled);
        }
    }
}

// ---------------------------------------------------------------------------
// Throughput
// ---------------------------------------------------------------------------

/// Time `samples` SHA-256 digests of a fixed short input and return the
/// observed hashes per second.
pub fn measure_hashes_per_second(samples: u64) -> u64 {
    if samples == 0 {
        return 0;
    }
    let start = Instant::now();
    let mut sink = 0u8;
    for _ in 0..samples {
        let digest = Sha256::digest(HASH_RATE_INPUT.as_bytes());
        sink ^= digest[0];
    }
    std::hint::black_box(sink);
    let secs = start.elapsed().as_secs_f64();
    if secs <= f64::EPSILON {
        return samples;
    }
    (samples as f64 / secs) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
