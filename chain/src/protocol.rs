//! Wire protocol for the verifying server.
//!
//! Requests and responses are single-line JSON objects. A request carries
//! the command name, the command-specific fields, the client's public key as
//! decimal strings, the client identifier and a decimal RSA signature over
//! the canonical payload:
//!
//! ```text
//! clientId ‖ publicKeyE ‖ publicKeyN ‖ command
//!     [‖ difficulty ‖ transaction | ‖ blockIndex ‖ newData]
//! ```
//!
//! Signer and verifier must build this string byte-for-byte identically.

use serde::{Deserialize, Serialize};

use crate::error::{ChainError, Result};
use crate::identity::KeyPair;
use crate::ledger::LedgerView;

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A ledger operation requested by a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    ViewStatus,
    AddTransaction { difficulty: i32, transaction: String },
    VerifyChain,
    ViewBlockchain,
    CorruptChain { block_index: u64, new_data: String },
    RepairChain,
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ViewStatus => "viewStatus",
            Command::AddTransaction { .. } => "addTransaction",
            Command::VerifyChain => "verifyChain",
            Command::ViewBlockchain => "viewBlockchain",
            Command::CorruptChain { .. } => "corruptChain",
            Command::RepairChain => "repairChain",
        }
    }

    /// Command-specific tail of the canonical payload.
    fn payload_suffix(&self) -> String {
        match self {
            Command::AddTransaction {
                difficulty,
                transaction,
            } => format!("{difficulty}{transaction}"),
            Command::CorruptChain {
                block_index,
                new_data,
            } => format!("{block_index}{new_data}"),
            _ => String::new(),
        }
    }
}

/// The exact string that is hashed and signed for a request.
pub fn canonical_payload(
    client_id: &str,
    public_key_e: &str,
    public_key_n: &str,
    command: &Command,
) -> String {
    format!(
        "{client_id}{public_key_e}{public_key_n}{}{}",
        command.name(),
        command.payload_suffix()
    )
}

// ---------------------------------------------------------------------------
// RequestMessage
// ---------------------------------------------------------------------------

/// A request as it appears on the wire. Every field is optional there;
/// [`RequestMessage::parse_command`] enforces what each command needs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_data: Option<String>,
}

impl RequestMessage {
    /// Unsigned request carrying only the command fields.
    pub fn for_command(command: &Command) -> Self {
        let mut request = Self {
            command: Some(command.name().to_string()),
            ..Self::default()
        };
        match command {
            Command::AddTransaction {
                difficulty,
                transaction,
            } => {
                request.difficulty = Some(*difficulty);
                request.transaction = Some(transaction.clone());
            }
            Command::CorruptChain {
                block_index,
                new_data,
            } => {
                request.block_index = i64::try_from(*block_index).ok();
                request.new_data = Some(new_data.clone());
            }
            _ => {}
        }
        request
    }

    /// Build a request for `command` signed with `keypair`.
    pub fn signed(keypair: &KeyPair, command: &Command) -> Self {
        let mut request = Self::for_command(command);
        request.client_id = Some(keypair.client_id().to_string());
        request.public_key_e = Some(keypair.public.e.to_string());
        request.public_key_n = Some(keypair.public.n.to_string());

        let payload = request.canonical_payload(command);
        request.signature = Some(keypair.sign(payload).to_string());
        request
    }

    /// Canonical payload using this request's identity fields as transmitted.
    /// Absent identity fields contribute nothing.
    pub fn canonical_payload(&self, command: &Command) -> String {
        canonical_payload(
            self.client_id.as_deref().unwrap_or_default(),
            self.public_key_e.as_deref().unwrap_or_default(),
            self.public_key_n.as_deref().unwrap_or_default(),
            command,
        )
    }

    /// Turn the stringly-typed wire fields into a [`Command`].
    pub fn parse_command(&self) -> Result<Command> {
        let name = self
            .command
            .as_deref()
            .ok_or(ChainError::MissingField("command"))?;

        let command = match name {
            "viewStatus" => Command::ViewStatus,
            "addTransaction" => Command::AddTransaction {
                difficulty: self.difficulty.ok_or(ChainError::MissingField("difficulty"))?,
                transaction: self
                    .transaction
                    .clone()
                    .ok_or(ChainError::MissingField("transaction"))?,
            },
            "verifyChain" => Command::VerifyChain,
            "viewBlockchain" => Command::ViewBlockchain,
            "corruptChain" => {
                let index = self.block_index.ok_or(ChainError::MissingField("blockIndex"))?;
                Command::CorruptChain {
                    block_index: u64::try_from(index).map_err(|_| {
                        ChainError::MalformedRequest(format!("negative blockIndex {index}"))
                    })?,
                    new_data: self
                        .new_data
                        .clone()
                        .ok_or(ChainError::MissingField("newData"))?,
                }
            }
            "repairChain" => Command::RepairChain,
            other => return Err(ChainError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

// ---------------------------------------------------------------------------
// ResponseMessage
// ---------------------------------------------------------------------------

/// Outcome flag of a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// A response as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<LedgerView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_blocks: Option<usize>,
}

impl ResponseMessage {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: Status::Success,
            message: message.into(),
            chain: None,
            num_blocks: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            ..Self::success(message)
        }
    }

    pub fn with_num_blocks(mut self, num_blocks: usize) -> Self {
        self.num_blocks = Some(num_blocks);
        self
    }

    pub fn with_chain(mut self, chain: LedgerView) -> Self {
        self.num_blocks = Some(chain.ds_chain.len());
        self.chain = Some(chain);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

impl From<&ChainError> for ResponseMessage {
    fn from(err: &ChainError) -> Self {
        ResponseMessage::error(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Line codec
// ---------------------------------------------------------------------------

/// Serialize a message as one JSON line, without the trailing newline.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode_request(line: &str) -> Result<RequestMessage> {
    Ok(serde_json::from_str(line.trim())?)
}

pub fn decode_response(line: &str) -> Result<ResponseMessage> {
    Ok(serde_json::from_str(line.trim())?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
