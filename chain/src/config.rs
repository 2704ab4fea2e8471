//! Configuration for the ledger, the verifying server and the signing client.
//!
//! The structs double as clap argument groups so the CLI can flatten them,
//! and every server option can also be set from the environment.

use std::net::{Ipv4Addr, SocketAddr};

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::pow::MAX_DIFFICULTY;

/// Default TCP port of the verifying server.
pub const DEFAULT_PORT: u16 = 7777;

/// Difficulty of the genesis block.
pub const DEFAULT_GENESIS_DIFFICULTY: i32 = 2;

/// Digests timed at startup to estimate local hash throughput.
pub const DEFAULT_HASH_RATE_SAMPLES: u64 = 2_000_000;

/// Longest request line the server buffers.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024;

/// RSA modulus size used by the client when none is given.
pub const DEFAULT_KEY_BITS: u64 = 2048;

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT))
}

/// Parameters fixed when a [`crate::ledger::BlockChain`] is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub genesis_difficulty: i32,
    pub hash_rate_samples: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            genesis_difficulty: DEFAULT_GENESIS_DIFFICULTY,
            hash_rate_samples: DEFAULT_HASH_RATE_SAMPLES,
        }
    }
}

/// Verifying server options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Args)]
pub struct ServerConfig {
    /// Address the server listens on
    #[arg(long, env = "SIGNET_LISTEN", default_value_t = default_listen())]
    pub listen: SocketAddr,

    /// Leading zero hex digits required of the genesis block
    #[arg(
        long,
        env = "SIGNET_GENESIS_DIFFICULTY",
        default_value_t = DEFAULT_GENESIS_DIFFICULTY,
        value_parser = clap::value_parser!(i32).range(..=i64::from(MAX_DIFFICULTY))
    )]
    pub genesis_difficulty: i32,

    /// Number of digests timed to estimate hashes per second
    #[arg(long, env = "SIGNET_HASH_RATE_SAMPLES", default_value_t = DEFAULT_HASH_RATE_SAMPLES)]
    pub hash_rate_samples: u64,

    /// Longest accepted request line in bytes
    #[arg(long, env = "SIGNET_MAX_REQUEST_BYTES", default_value_t = DEFAULT_MAX_REQUEST_BYTES)]
    pub max_request_bytes: usize,
}

impl ServerConfig {
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            genesis_difficulty: self.genesis_difficulty,
            hash_rate_samples: self.hash_rate_samples,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            genesis_difficulty: DEFAULT_GENESIS_DIFFICULTY,
            hash_rate_samples: DEFAULT_HASH_RATE_SAMPLES,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

/// Signing client options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Args)]
pub struct ClientConfig {
    /// Server address (host:port)
    #[arg(long, env = "SIGNET_SERVER", default_value = "127.0.0.1:7777")]
    pub server: String,

    /// RSA modulus size in bits
    #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
    pub key_bits: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_listen().to_string(),
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}
