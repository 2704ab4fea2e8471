//! In-memory ledger for the Signet chain.
//!
//! [`BlockChain`] owns the ordered blocks and the cached head hash
//! (`chain_hash`). It creates, validates, corrupts and repairs blocks.
//! [`SharedLedger`] is the single owner handed to every connection worker: all
//! access goes through one mutex, and proof-of-work runs outside of it.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::Block;
use crate::config::LedgerConfig;
use crate::error::{ChainError, Result};
use crate::pow::{self, CancelToken};
use crate::types::{current_timestamp, Hash};

// ---------------------------------------------------------------------------
// Validation results
// ---------------------------------------------------------------------------

/// The kind of invariant a block violates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    /// `previous_hash` differs from the recomputed digest of the predecessor.
    BrokenLink,
    /// The block's digest does not have `difficulty` leading zero hex digits.
    DifficultyNotMet,
    /// The cached head hash differs from the digest of the last block.
    StaleHead,
}

/// First violation found while walking the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainViolation {
    pub index: u64,
    pub kind: ViolationKind,
}

impl fmt::Display for ChainViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ViolationKind::BrokenLink => write!(f, "Hashes do not match at block {}", self.index),
            ViolationKind::DifficultyNotMet => write!(
                f,
                "Hash does not meet difficulty requirement at block {}",
                self.index
            ),
            ViolationKind::StaleHead => write!(f, "Chain hash does not match latest block hash."),
        }
    }
}

/// Outcome of [`BlockChain::is_valid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(ChainViolation),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn violation(&self) -> Option<ChainViolation> {
        match self {
            ValidationResult::Valid => None,
            ValidationResult::Invalid(v) => Some(*v),
        }
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationResult::Valid => write!(f, "TRUE"),
            ValidationResult::Invalid(v) => write!(f, "{v}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Read-only views
// ---------------------------------------------------------------------------

/// Summary of the ledger returned by `viewStatus`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatus {
    pub chain_size: usize,
    pub latest_difficulty: i32,
    pub total_difficulty: i64,
    pub hashes_per_second: u64,
    pub total_expected_hashes: f64,
    pub latest_nonce: u64,
    pub chain_hash: String,
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Current size of chain: {}", self.chain_size)?;
        writeln!(f, "Difficulty of most recent block: {}", self.latest_difficulty)?;
        writeln!(f, "Total difficulty for all blocks: {}", self.total_difficulty)?;
        writeln!(
            f,
            "Approximate hashes per second on this machine: {}",
            self.hashes_per_second
        )?;
        writeln!(
            f,
            "Expected total hashes required for the whole chain: {:.6}",
            self.total_expected_hashes
        )?;
        writeln!(f, "Nonce for most recent block: {}", self.latest_nonce)?;
        write!(f, "Chain hash: {}", self.chain_hash)
    }
}

/// Full serialization of the ledger: ordered blocks plus the head hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerView {
    pub ds_chain: Vec<Block>,
    #[serde(rename = "chainHash")]
    pub chain_hash: String,
}

// ---------------------------------------------------------------------------
// BlockChain
// ---------------------------------------------------------------------------

/// Ordered blocks with a cached head hash.
#[derive(Clone, Debug)]
pub struct BlockChain {
    chain: Vec<Block>,
    chain_hash: String,
    hashes_per_second: u64,
    /// Bumped by every mutation; detects concurrent changes to a snapshot.
    generation: u64,
}

impl BlockChain {
    /// Create a ledger with the default configuration.
    pub fn new() -> Self {
        Self::with_config(&LedgerConfig::default())
    }

    /// Measure local hash throughput, then mine and append the genesis block.
    pub fn with_config(config: &LedgerConfig) -> Self {
        let hashes_per_second = pow::measure_hashes_per_second(config.hash_rate_samples);
        debug!(
            samples = config.hash_rate_samples,
            hashes_per_second, "measured local hash rate"
        );

        let mut genesis = Block::genesis(current_timestamp(), config.genesis_difficulty);
        let hash = pow::mine(&mut genesis);
        info!(nonce = genesis.nonce, hash = %hash, "genesis block mined");

        Self {
            chain: vec![genesis],
            chain_hash: hash.to_hex(),
            hashes_per_second,
            generation: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn block(&self, index: usize) -> Option<&Block> {
        self.chain.get(index)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.chain
    }

    pub fn latest_block(&self) -> Option<&Block> {
        self.chain.last()
    }

    /// Cached digest of the last block as of the last append or repair.
    pub fn chain_hash(&self) -> &str {
        &self.chain_hash
    }

    pub fn hashes_per_second(&self) -> u64 {
        self.hashes_per_second
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Sum of all block difficulties.
    pub fn total_difficulty(&self) -> i64 {
        self.chain.iter().map(|b| i64::from(b.difficulty)).sum()
    }

    /// Σ 16^difficulty over all blocks. An estimate, not a guarantee.
    pub fn total_expected_hashes(&self) -> f64 {
        self.chain
            .iter()
            .map(|b| pow::expected_attempts(b.difficulty))
            .sum()
    }

    pub fn status(&self) -> ChainStatus {
        let latest = self.latest_block();
        ChainStatus {
            chain_size: self.len(),
            latest_difficulty: latest.map_or(0, |b| b.difficulty),
            total_difficulty: self.total_difficulty(),
            hashes_per_second: self.hashes_per_second,
            total_expected_hashes: self.total_expected_hashes(),
            latest_nonce: latest.map_or(0, |b| b.nonce),
            chain_hash: self.chain_hash.clone(),
        }
    }

    pub fn view(&self) -> LedgerView {
        LedgerView {
            ds_chain: self.chain.clone(),
            chain_hash: self.chain_hash.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Appending
    // -----------------------------------------------------------------------

    /// Build an unmined block that would extend the current head.
    pub fn prepare_block(&self, data: impl Into<String>, difficulty: i32) -> Block {
        let mut block = Block::new(self.len() as u64, current_timestamp(), data, difficulty);
        block.previous_hash = self.chain_hash.clone();
        block
    }

    /// Append a block mined from [`BlockChain::prepare_block`].
    ///
    /// Fails with [`ChainError::StaleBlock`] when the head moved since the
    /// template was prepared.
    pub fn commit_block(&mut self, block: Block) -> Result<Block> {
        let expected = self.len() as u64;
        if block.index != expected || block.previous_hash != self.chain_hash {
            return Err(ChainError::StaleBlock {
                expected,
                got: block.index,
            });
        }
        Ok(self.append_mined(block))
    }

    /// Mine a new block on top of the head and append it.
    pub fn add_block(&mut self, data: impl Into<String>, difficulty: i32) -> Block {
        let start = Instant::now();
        let mut block = self.prepare_block(data, difficulty);
        pow::mine(&mut block);
        let block = self.append_mined(block);
        info!(
            index = block.index,
            difficulty,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "block added"
        );
        block
    }

    fn append_mined(&mut self, block: Block) -> Block {
        self.chain_hash = block.hash_hex();
        self.chain.push(block.clone());
        self.generation += 1;
        block
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Walk the chain and report the first violated invariant.
    ///
    /// A genesis-only chain has no links to check: its digest must meet its
    /// difficulty and equal the head hash.
    pub fn is_valid(&self) -> ValidationResult {
        let Some(genesis) = self.chain.first() else {
            return ValidationResult::Valid;
        };

        let mut prev_hash = genesis.hash_hex();
        if !pow::meets_difficulty(&prev_hash, genesis.difficulty) {
            return invalid(0, ViolationKind::DifficultyNotMet);
        }

        for block in self.chain.iter().skip(1) {
            if block.previous_hash != prev_hash {
                return invalid(block.index, ViolationKind::BrokenLink);
            }
            let hash = block.hash_hex();
            if !pow::meets_difficulty(&hash, block.difficulty) {
                return invalid(block.index, ViolationKind::DifficultyNotMet);
            }
            prev_hash = hash;
        }

        if self.chain_hash != prev_hash {
            return invalid(self.len() as u64 - 1, ViolationKind::StaleHead);
        }
        ValidationResult::Valid
    }

    // -----------------------------------------------------------------------
    // Tampering and repair
    // -----------------------------------------------------------------------

    /// Overwrite a block's payload without re-mining or relinking.
    pub fn corrupt(&mut self, index: u64, data: impl Into<String>) -> Result<()> {
        let len = self.len();
        let block = usize::try_from(index)
            .ok()
            .and_then(|i| self.chain.get_mut(i))
            .ok_or(ChainError::InvalidBlockIndex { index, len })?;
        block.data = data.into();
        self.generation += 1;
        warn!(index, "block payload overwritten without re-mining");
        Ok(())
    }

    /// Relink every block to its predecessor's digest and re-mine it.
    ///
    /// Payloads are kept: repair fixes hashes and links, not content. Blocks
    /// that still meet their difficulty keep their nonce, so a second repair
    /// is a no-op.
    pub fn repair(&mut self) -> usize {
        match self.repair_with(|block| Ok::<_, Infallible>(pow::mine(block))) {
            Ok(remined) => remined,
            Err(never) => match never {},
        }
    }

    /// [`BlockChain::repair`] that stops with [`ChainError::MiningCancelled`].
    ///
    /// On cancellation the chain is left partially repaired.
    pub fn repair_cancellable(&mut self, cancel: &CancelToken) -> Result<usize> {
        self.repair_with(|block| pow::mine_cancellable(block, cancel))
    }

    fn repair_with<E>(
        &mut self,
        mut mine: impl FnMut(&mut Block) -> std::result::Result<Hash, E>,
    ) -> std::result::Result<usize, E> {
        let start = Instant::now();
        let mut remined = 0;
        let mut prev_hash: Option<String> = None;

        for block in self.chain.iter_mut() {
            if let Some(prev) = prev_hash.take() {
                block.previous_hash = prev;
            }
            let nonce = block.nonce;
            let hash = mine(block)?;
            if block.nonce != nonce {
                remined += 1;
            }
            prev_hash = Some(hash.to_hex());
        }

        if let Some(head) = prev_hash {
            self.chain_hash = head;
        }
        self.generation += 1;
        info!(
            blocks = self.len(),
            remined,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "chain repaired"
        );
        Ok(remined)
    }
}

impl Default for BlockChain {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(index: u64, kind: ViolationKind) -> ValidationResult {
    ValidationResult::Invalid(ChainViolation { index, kind })
}

// ---------------------------------------------------------------------------
// SharedLedger
// ---------------------------------------------------------------------------

/// Off-lock attempts a mutation makes before it works under the lock.
pub const OPTIMISTIC_ATTEMPTS: usize = 2;

/// The process-wide ledger shared by all connection workers.
///
/// Every read and write of the chain happens under one mutex. Mining is done
/// on the blocking thread pool without holding it; results are committed
/// only if the chain did not move in the meantime. After
/// [`OPTIMISTIC_ATTEMPTS`] stale results the work is redone while holding the
/// lock, so a busy ledger delays a mutation but never starves it.
#[derive(Clone, Debug)]
pub struct SharedLedger {
    inner: Arc<Mutex<BlockChain>>,
}

impl SharedLedger {
    pub fn new(chain: BlockChain) -> Self {
        Self {
            inner: Arc::new(Mutex::new(chain)),
        }
    }

    /// Run `f` with shared access to the chain.
    pub fn read<R>(&self, f: impl FnOnce(&BlockChain) -> R) -> R {
        f(&self.inner.lock())
    }

    /// Run `f` with exclusive access to the chain.
    pub fn write<R>(&self, f: impl FnOnce(&mut BlockChain) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Mine a block and append it.
    pub async fn add_block(
        &self,
        data: impl Into<String>,
        difficulty: i32,
        cancel: &CancelToken,
    ) -> Result<Block> {
        let data = data.into();
        let start = Instant::now();

        for attempt in 1..=OPTIMISTIC_ATTEMPTS {
            let template = self.read(|chain| chain.prepare_block(data.clone(), difficulty));
            let token = cancel.clone();
            let mined = tokio::task::spawn_blocking(move || {
                let mut block = template;
                pow::mine_cancellable(&mut block, &token).map(|_| block)
            })
            .await??;

            match self.write(|chain| chain.commit_block(mined)) {
                Ok(block) => {
                    log_block_added(&block, start);
                    return Ok(block);
                }
                Err(ChainError::StaleBlock { expected, got }) => {
                    debug!(attempt, expected, got, "head moved while mining");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(difficulty, "mining under the ledger lock");
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let block = tokio::task::spawn_blocking(move || {
            let mut chain = inner.lock();
            let mut block = chain.prepare_block(data, difficulty);
            pow::mine_cancellable(&mut block, &token)?;
            chain.commit_block(block)
        })
        .await??;
        log_block_added(&block, start);
        Ok(block)
    }

    /// Repair a snapshot and install it.
    ///
    /// A snapshot is discarded when the chain changed while it was being
    /// repaired. Once the attempts run out the snapshot is taken and
    /// installed under the lock.
    pub async fn repair(&self, cancel: &CancelToken) -> Result<usize> {
        for attempt in 1..=OPTIMISTIC_ATTEMPTS {
            let snapshot = self.read(|chain| chain.clone());
            let generation = snapshot.generation();
            let token = cancel.clone();
            let (repaired, remined) = tokio::task::spawn_blocking(move || {
                let mut chain = snapshot;
                chain.repair_cancellable(&token).map(|n| (chain, n))
            })
            .await??;

            let installed = self.write(|chain| {
                if chain.generation() != generation {
                    return false;
                }
                *chain = repaired;
                true
            });
            if installed {
                return Ok(remined);
            }
            debug!(attempt, generation, "chain changed during repair");
        }

        debug!("repairing under the ledger lock");
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut chain = inner.lock();
            // A cancelled repair leaves the installed chain untouched.
            let mut repaired = chain.clone();
            let remined = repaired.repair_cancellable(&token)?;
            *chain = repaired;
            Ok::<_, ChainError>(remined)
        })
        .await?
    }
}

fn log_block_added(block: &Block, start: Instant) {
    info!(
        index = block.index,
        difficulty = block.difficulty,
        nonce = block.nonce,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "block added"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chain() -> BlockChain {
        BlockChain::with_config(&LedgerConfig {
            genesis_difficulty: 2,
            hash_rate_samples: 1_000,
        })
    }

    #[test]
    fn test_genesis_state() {
        let chain = test_chain();
        assert_eq!(chain.len(), 1);

        let genesis = chain.block(0).expect("genesis");
        assert_eq!(genesis.data, "Genesis");
        assert_eq!(genesis.difficulty, 2);
        assert!(genesis.previous_hash.is_empty());
        assert_eq!(chain.chain_hash(), genesis.hash_hex());
        assert!(chain.hashes_per_second() > 0);
        assert!(chain.is_valid().is_valid());
    }

    #[test]
    fn test_add_block_links_to_head() {
        let mut chain = test_chain();
        let head = chain.chain_hash().to_string();

        let block = chain.add_block("A", 2);
        assert_eq!(block.index, 1);
        assert_eq!(block.previous_hash, head);
        assert!(pow::meets_difficulty(&block.hash_hex(), 2));
        assert_eq!(chain.chain_hash(), block.hash_hex());
        assert_eq!(chain.latest_block(), Some(&block));
    }

    #[test]
    fn test_single_block_stale_head_detected() {
        let mut chain = test_chain();
        chain.chain_hash = "ff".repeat(32);

        let result = chain.is_valid();
        assert_eq!(
            result.violation(),
            Some(ChainViolation {
                index: 0,
                kind: ViolationKind::StaleHead
            })
        );
        assert_eq!(result.to_string(), "Chain hash does not match latest block hash.");
    }

    #[test]
    fn test_genesis_difficulty_checked() {
        let mut chain = test_chain();
        // Pick a nonce whose digest misses the difficulty
        let genesis = &mut chain.chain[0];
        while pow::meets_difficulty(&genesis.hash_hex(), genesis.difficulty) {
            genesis.nonce += 1;
        }
        chain.chain_hash = chain.chain[0].hash_hex();

        assert_eq!(
            chain.is_valid().violation(),
            Some(ChainViolation {
                index: 0,
                kind: ViolationKind::DifficultyNotMet
            })
        );
    }

    #[test]
    fn test_broken_link_reported() {
        let mut chain = test_chain();
        chain.add_block("A", 1);
        chain.add_block("B", 1);
        chain.chain[2].previous_hash = "00".repeat(32);

        let result = chain.is_valid();
        assert_eq!(
            result.violation(),
            Some(ChainViolation {
                index: 2,
                kind: ViolationKind::BrokenLink
            })
        );
        assert_eq!(result.to_string(), "Hashes do not match at block 2");
    }

    #[test]
    fn test_corrupt_then_repair() {
        let mut chain = test_chain();
        chain.add_block("A", 2);
        chain.add_block("B", 2);
        assert!(chain.is_valid().is_valid());

        chain.corrupt(1, "TAMPERED").expect("index in range");
        let violation = chain.is_valid().violation().expect("tampering detected");
        assert!(violation.index == 1 || violation.index == 2, "{violation:?}");

        chain.repair();
        assert!(chain.is_valid().is_valid());
        assert_eq!(chain.block(1).unwrap().data, "TAMPERED");
    }

    #[test]
    fn test_corrupt_invalid_index() {
        let mut chain = test_chain();
        let err = chain.corrupt(5, "x").unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlockIndex { index: 5, len: 1 }));
    }

    #[test]
    fn test_repair_is_idempotent() {
        let mut chain = test_chain();
        chain.add_block("A", 2);
        chain.add_block("B", 1);
        chain.corrupt(1, "changed").unwrap();

        chain.repair();
        let head = chain.chain_hash().to_string();
        let remined = chain.repair();

        assert_eq!(remined, 0);
        assert_eq!(chain.chain_hash(), head);
        assert!(chain.is_valid().is_valid());
    }

    #[test]
    fn test_repair_fixes_stale_head() {
        let mut chain = test_chain();
        chain.add_block("A", 1);
        chain.chain_hash = String::new();

        chain.repair();
        assert_eq!(chain.chain_hash(), chain.latest_block().unwrap().hash_hex());
    }

    #[test]
    fn test_repair_cancelled() {
        let mut chain = test_chain();
        chain.add_block("A", 1);
        chain.chain[1].difficulty = 64;

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            chain.repair_cancellable(&cancel),
            Err(ChainError::MiningCancelled)
        ));
    }

    #[test]
    fn test_commit_rejects_stale_template() {
        let mut chain = test_chain();
        let mut first = chain.prepare_block("first", 1);
        let mut second = chain.prepare_block("second", 1);
        pow::mine(&mut first);
        pow::mine(&mut second);

        chain.commit_block(first).expect("fresh template");
        let err = chain.commit_block(second).unwrap_err();
        assert!(matches!(err, ChainError::StaleBlock { expected: 2, got: 1 }));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_totals_and_status() {
        let mut chain = test_chain();
        chain.add_block("A", 3);
        chain.add_block("B", 1);

        assert_eq!(chain.total_difficulty(), 6);
        assert_eq!(chain.total_expected_hashes(), 256.0 + 4096.0 + 16.0);

        let status = chain.status();
        assert_eq!(status.chain_size, 3);
        assert_eq!(status.latest_difficulty, 1);
        assert_eq!(status.latest_nonce, chain.latest_block().unwrap().nonce);
        assert_eq!(status.chain_hash, chain.chain_hash());
        assert!(status.to_string().contains("Current size of chain: 3"));
    }

    #[test]
    fn test_view_serialization() {
        let mut chain = test_chain();
        chain.add_block("A", 1);

        let json = serde_json::to_value(chain.view()).expect("serialize");
        assert_eq!(json["ds_chain"].as_array().map(Vec::len), Some(2));
        assert_eq!(json["chainHash"], chain.chain_hash());
        assert_eq!(json["ds_chain"][1]["data"], "A");
    }

    #[test]
    fn test_generation_tracks_mutations() {
        let mut chain = test_chain();
        let g0 = chain.generation();
        chain.add_block("A", 1);
        chain.corrupt(1, "B").unwrap();
        chain.repair();
        assert_eq!(chain.generation(), g0 + 3);
    }

    #[tokio::test]
    async fn test_shared_ledger_add_and_repair() {
        let ledger = SharedLedger::new(test_chain());
        let cancel = CancelToken::new();

        let block = ledger.add_block("A", 2, &cancel).await.expect("mined");
        assert_eq!(block.index, 1);

        ledger.write(|chain| chain.corrupt(1, "TAMPERED")).unwrap();
        assert!(!ledger.read(|chain| chain.is_valid().is_valid()));

        ledger.repair(&cancel).await.expect("repaired");
        assert!(ledger.read(|chain| chain.is_valid().is_valid()));
        assert_eq!(ledger.read(|chain| chain.block(1).unwrap().data.clone()), "TAMPERED");
    }

    #[tokio::test]
    async fn test_shared_ledger_cancelled_add_leaves_chain_untouched() {
        let ledger = SharedLedger::new(test_chain());
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = ledger.add_block("never", 64, &cancel).await;
        assert!(matches!(result, Err(ChainError::MiningCancelled)));
        assert_eq!(ledger.read(BlockChain::len), 1);
    }
}
