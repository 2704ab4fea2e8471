//! Error types for the Signet ledger and its protocol.

use thiserror::Error;

/// Top-level error type for ledger, identity and protocol operations.
#[derive(Debug, Error)]
pub enum ChainError {
    // -- authentication ----------------------------------------------------
    #[error("Client identifier does not match public key.")]
    ClientIdMismatch,

    #[error("Digital signature verification failed.")]
    InvalidSignature,

    #[error("invalid decimal integer in field {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("field {field} exceeds {max_bits} bits")]
    OversizedNumber { field: &'static str, max_bits: u64 },

    #[error("invalid public key: {0}")]
    InvalidPublicKey(&'static str),

    // -- malformed requests ------------------------------------------------
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("request line exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    #[error("request is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // -- ledger ------------------------------------------------------------
    #[error("Invalid block index {index}: chain has {len} blocks.")]
    InvalidBlockIndex { index: u64, len: usize },

    #[error("block template is stale: expected index {expected}, got {got}")]
    StaleBlock { expected: u64, got: u64 },

    #[error("mining cancelled")]
    MiningCancelled,

    #[error("background mining task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    // -- setup -------------------------------------------------------------
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChainError {
    /// Whether the error came from the authentication checks.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            ChainError::ClientIdMismatch
                | ChainError::InvalidSignature
                | ChainError::InvalidNumber { .. }
                | ChainError::OversizedNumber { .. }
                | ChainError::InvalidPublicKey(_)
        )
    }
}

/// Result type alias using ChainError.
pub type Result<T> = std::result::Result<T, ChainError>;
