//! Signet Chain: a proof-of-work ledger behind an authenticated TCP protocol.
//!
//! The crate holds the in-memory chain of blocks, the mining engine, textbook
//! RSA identities used to sign requests, the line-delimited JSON wire
//! protocol, and the verifying server and signing client that speak it.

pub mod block;
pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod pow;
pub mod protocol;
pub mod session;
pub mod types;

pub use block::Block;
pub use error::{ChainError, Result};
pub use identity::KeyPair;
pub use ledger::{BlockChain, SharedLedger, ValidationResult};
pub use pow::CancelToken;
pub use protocol::{Command, RequestMessage, ResponseMessage};
pub use session::{Client, Server};
