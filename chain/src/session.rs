//! Verifying server and signing client.
//!
//! Each accepted connection is served by its own task that reads one JSON
//! request per line, authenticates it, applies it to the [`SharedLedger`] and
//! writes one JSON response per line. Any failure inside a request/response
//! cycle, including an over-long or non-UTF-8 line, is reported to the client
//! as an `error` response; only I/O errors close the connection.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{ChainError, Result};
use crate::identity::{self, KeyPair, PublicKey};
use crate::ledger::{BlockChain, SharedLedger};
use crate::pow::{CancelToken, MAX_DIFFICULTY};
use crate::protocol::{
    canonical_payload, decode_request, decode_response, encode_line, Command, RequestMessage,
    ResponseMessage,
};

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// A request whose identity and signature have been checked.
#[derive(Clone, Debug)]
pub struct AuthenticatedRequest {
    pub client_id: String,
    pub public_key: PublicKey,
    pub command: Command,
}

/// Check that the declared key hashes to the declared client id, then that
/// the signature verifies over the payload rebuilt from the request.
///
/// The key strings are used exactly as transmitted. Keys and signatures
/// wider than [`identity::MAX_KEY_BITS`] are refused before any modular
/// exponentiation.
pub fn authenticate(request: &RequestMessage) -> Result<AuthenticatedRequest> {
    let client_id = required(&request.client_id, "clientId")?;
    let e = required(&request.public_key_e, "publicKeyE")?;
    let n = required(&request.public_key_n, "publicKeyN")?;
    let signature = required(&request.signature, "signature")?;

    if identity::client_id_from_strings(e, n) != client_id {
        return Err(ChainError::ClientIdMismatch);
    }

    let command = request.parse_command()?;
    let public_key = PublicKey::from_decimal(e, n)?;
    let signature = identity::parse_signature(signature)?;
    let payload = canonical_payload(client_id, e, n, &command);
    if !identity::verify(payload, &signature, &public_key) {
        return Err(ChainError::InvalidSignature);
    }

    Ok(AuthenticatedRequest {
        client_id: client_id.to_string(),
        public_key,
        command,
    })
}

fn required<'a>(field: &'a Option<String>, name: &'static str) -> Result<&'a str> {
    field.as_deref().ok_or(ChainError::MissingField(name))
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Apply one command to the ledger and describe the outcome.
pub async fn dispatch(
    ledger: &SharedLedger,
    command: Command,
    cancel: &CancelToken,
) -> ResponseMessage {
    let name = command.name();
    match execute(ledger, command, cancel).await {
        Ok(response) => response,
        Err(err) => {
            warn!(command = name, error = %err, "command failed");
            ResponseMessage::from(&err)
        }
    }
}

async fn execute(
    ledger: &SharedLedger,
    command: Command,
    cancel: &CancelToken,
) -> Result<ResponseMessage> {
    match command {
        Command::ViewStatus => {
            let status = ledger.read(BlockChain::status);
            Ok(ResponseMessage::success(status.to_string()).with_num_blocks(status.chain_size))
        }
        Command::AddTransaction {
            difficulty,
            transaction,
        } => {
            if difficulty > MAX_DIFFICULTY {
                return Err(ChainError::MalformedRequest(format!(
                    "difficulty {difficulty} exceeds the {MAX_DIFFICULTY} hex digits of a digest"
                )));
            }
            ledger.add_block(transaction, difficulty, cancel).await?;
            let len = ledger.read(BlockChain::len);
            Ok(ResponseMessage::success("Transaction added.").with_num_blocks(len))
        }
        Command::VerifyChain => {
            let (result, len) = ledger.read(|chain| (chain.is_valid(), chain.len()));
            let message = format!("Chain verification: {result}");
            let response = if result.is_valid() {
                ResponseMessage::success(message)
            } else {
                ResponseMessage::error(message)
            };
            Ok(response.with_num_blocks(len))
        }
        Command::ViewBlockchain => {
            let view = ledger.read(BlockChain::view);
            let json = serde_json::to_string(&view)?;
            Ok(ResponseMessage::success(json).with_chain(view))
        }
        Command::CorruptChain {
            block_index,
            new_data,
        } => {
            ledger.write(|chain| chain.corrupt(block_index, new_data.as_str()))?;
            Ok(ResponseMessage::success(format!(
                "Block {block_index} now contains: {new_data}"
            )))
        }
        Command::RepairChain => {
            ledger.repair(cancel).await?;
            let len = ledger.read(BlockChain::len);
            Ok(ResponseMessage::success("Blockchain repaired.").with_num_blocks(len))
        }
    }
}

/// Authenticate and dispatch a decoded request.
///
/// Signature checking runs on the blocking pool.
pub async fn handle_request(
    ledger: &SharedLedger,
    request: &RequestMessage,
    cancel: &CancelToken,
) -> ResponseMessage {
    let owned = request.clone();
    let authenticated = tokio::task::spawn_blocking(move || authenticate(&owned))
        .await
        .map_err(ChainError::from)
        .and_then(|auth| auth);

    match authenticated {
        Ok(auth) => {
            debug!(
                client_id = %auth.client_id,
                command = auth.command.name(),
                "request authenticated"
            );
            dispatch(ledger, auth.command, cancel).await
        }
        Err(err) => {
            warn!(
                client_id = request.client_id.as_deref().unwrap_or("-"),
                error = %err,
                "request rejected"
            );
            ResponseMessage::from(&err)
        }
    }
}

/// Decode one line and handle it. Undecodable lines get an error response.
pub async fn handle_line(
    ledger: &SharedLedger,
    line: &str,
    cancel: &CancelToken,
) -> ResponseMessage {
    match decode_request(line) {
        Ok(request) => handle_request(ledger, &request, cancel).await,
        Err(err) => {
            warn!(error = %err, "malformed request line");
            ResponseMessage::from(&err)
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// One newline-terminated frame read from a connection.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(Vec<u8>),
    TooLong,
    Closed,
}

/// Read up to the next `\n`, buffering at most `limit` bytes. The rest of an
/// over-long line is consumed and dropped so the next frame starts clean.
async fn read_frame<R>(reader: &mut R, limit: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut overflow = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (overflow, line.is_empty()) {
                (true, _) => Frame::TooLong,
                (false, true) => Frame::Closed,
                (false, false) => Frame::Line(line),
            });
        }

        let (chunk, used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (&available[..pos], pos + 1, true),
            None => (available, available.len(), false),
        };
        if !overflow {
            if line.len() + chunk.len() > limit {
                overflow = true;
                line = Vec::new();
            } else {
                line.extend_from_slice(chunk);
            }
        }
        reader.consume(used);

        if done {
            return Ok(if overflow { Frame::TooLong } else { Frame::Line(line) });
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// TCP front end of the shared ledger.
pub struct Server {
    listener: TcpListener,
    ledger: SharedLedger,
    cancel: CancelToken,
    max_request_bytes: usize,
}

impl Server {
    pub async fn bind(config: &ServerConfig, ledger: SharedLedger) -> Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        info!(addr = %listener.local_addr()?, "verifying server listening");
        Ok(Self {
            listener,
            ledger,
            cancel: CancelToken::new(),
            max_request_bytes: config.max_request_bytes,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    /// Serve until the process is killed.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve connections until `shutdown` completes, then cancel any mining
    /// still running on behalf of a connection and close every connection.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let ledger = self.ledger.clone();
                    let cancel = self.cancel.clone();
                    let limit = self.max_request_bytes;
                    connections.spawn(async move {
                        let served = serve_connection(stream, peer, ledger, cancel, limit).await;
                        if let Err(err) = served {
                            warn!(%peer, error = %err, "connection error");
                        }
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "connection task failed");
                    }
                }
            }
        }

        info!(open = connections.len(), "shutting down verifying server");
        self.cancel.cancel();
        connections.shutdown().await;
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ledger: SharedLedger,
    cancel: CancelToken,
    max_request_bytes: usize,
) -> Result<()> {
    info!(%peer, "client connected");
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut requests = 0u64;

    loop {
        let line = match read_frame(&mut reader, max_request_bytes).await? {
            Frame::Closed => break,
            Frame::TooLong => Err(ChainError::RequestTooLarge {
                limit: max_request_bytes,
            }),
            Frame::Line(bytes) => String::from_utf8(bytes).map_err(ChainError::from),
        };

        let start = Instant::now();
        let response = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&ledger, &line, &cancel).await,
            Err(err) => {
                warn!(%peer, error = %err, "unreadable request line");
                ResponseMessage::from(&err)
            }
        };
        requests += 1;
        debug!(
            %peer,
            success = response.is_success(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "request handled"
        );

        let mut out = encode_line(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }

    info!(%peer, requests, "client disconnected");
    Ok(())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A persistent connection to a verifying server.
pub struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    /// Sign `command` with `keypair`, send it and wait for the reply.
    pub async fn send(&mut self, keypair: &KeyPair, command: &Command) -> Result<ResponseMessage> {
        self.send_raw(&RequestMessage::signed(keypair, command)).await
    }

    /// Send a request exactly as given.
    pub async fn send_raw(&mut self, request: &RequestMessage) -> Result<ResponseMessage> {
        self.send_line(&encode_line(request)?).await
    }

    /// Send one raw line and wait for the reply line.
    pub async fn send_line(&mut self, line: &str) -> Result<ResponseMessage> {
        self.send_bytes(line.as_bytes()).await
    }

    /// Send arbitrary bytes followed by a newline and wait for the reply line.
    pub async fn send_bytes(&mut self, line: &[u8]) -> Result<ResponseMessage> {
        self.writer.write_all(line).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let reply = self.lines.next_line().await?.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "server closed the connection")
        })?;
        decode_response(&reply)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
