//! Signet CLI: run the verifying server, drive it from an interactive signing
//! client, generate keys, or walk through the ledger locally.

use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use signet_chain::config::{ClientConfig, LedgerConfig, ServerConfig, DEFAULT_KEY_BITS};
use signet_chain::identity::KeyPair;
use signet_chain::ledger::{BlockChain, SharedLedger};
use signet_chain::pow::MAX_DIFFICULTY;
use signet_chain::protocol::Command;
use signet_chain::session::{Client, Server};

#[derive(Parser)]
#[command(name = "signet")]
#[command(about = "Signet: proof-of-work ledger behind signed requests")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the verifying server
    Serve(ServerConfig),
    /// Connect to a server and send signed requests from a menu
    Client(ClientConfig),
    /// Generate an RSA keypair and print it with its client identifier
    Keygen {
        /// RSA modulus size in bits
        #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
        bits: u64,
    },
    /// Mine, tamper with and repair a local ledger without networking
    Demo {
        /// Difficulty of the demo transactions
        #[arg(
            long,
            default_value_t = 2,
            value_parser = clap::value_parser!(i32).range(..=i64::from(MAX_DIFFICULTY))
        )]
        difficulty: i32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(config) => cmd_serve(config).await,
        Commands::Client(config) => cmd_client(config).await,
        Commands::Keygen { bits } => cmd_keygen(bits).await,
        Commands::Demo { difficulty } => cmd_demo(difficulty).await,
    }
}

async fn cmd_serve(config: ServerConfig) -> Result<()> {
    let ledger_config = config.ledger_config();
    let chain = tokio::task::spawn_blocking(move || BlockChain::with_config(&ledger_config))
        .await
        .context("building the genesis ledger")?;
    info!(
        hashes_per_second = chain.hashes_per_second(),
        chain_hash = chain.chain_hash(),
        "ledger ready"
    );

    let server = Server::bind(&config, SharedLedger::new(chain))
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;

    server
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "cannot listen for ctrl-c; serving until killed");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

async fn generate_keypair(bits: u64) -> Result<KeyPair> {
    let keypair = tokio::task::spawn_blocking(move || KeyPair::generate(bits))
        .await
        .context("key generation task failed")?
        .with_context(|| format!("generating a {bits}-bit keypair"))?;
    Ok(keypair)
}

fn print_keypair(keypair: &KeyPair) {
    println!("RSA Public Key:");
    println!("  Exponent: {}", keypair.public.e);
    println!("  Modulus: {}", keypair.public.n);
    println!("RSA Private Key:");
    println!("  Exponent: {}", keypair.private.d);
    println!("  Modulus: {}", keypair.private.n);
    println!("Client Identifier: {}", keypair.client_id());
}

async fn cmd_keygen(bits: u64) -> Result<()> {
    let keypair = generate_keypair(bits).await?;
    print_keypair(&keypair);
    Ok(())
}

const MENU: &str = "\
0. View basic blockchain status.
1. Add a transaction to the blockchain.
2. Verify the blockchain.
3. View the blockchain.
4. Corrupt the chain.
5. Hide the corruption by repairing the chain.
6. Quit";

async fn cmd_client(config: ClientConfig) -> Result<()> {
    let keypair = generate_keypair(config.key_bits).await?;
    print_keypair(&keypair);

    let mut client = Client::connect(config.server.as_str())
        .await
        .with_context(|| format!("connecting to {}", config.server))?;
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        println!("\n{MENU}");
        let Some(selection) = prompt(&mut input, "Enter your selection: ").await? else {
            break;
        };

        let command = match selection.as_str() {
            "0" => Command::ViewStatus,
            "1" => {
                let difficulty = prompt_parsed(&mut input, "Enter difficulty > 1: ").await?;
                let transaction =
                    prompt_required(&mut input, "Enter transaction details: ").await?;
                Command::AddTransaction {
                    difficulty,
                    transaction,
                }
            }
            "2" => Command::VerifyChain,
            "3" => Command::ViewBlockchain,
            "4" => {
                let block_index =
                    prompt_parsed(&mut input, "Enter block index to tamper with: ").await?;
                let new_data = prompt_required(
                    &mut input,
                    &format!("Enter new block data for index {block_index}: "),
                )
                .await?;
                Command::CorruptChain {
                    block_index,
                    new_data,
                }
            }
            "5" => Command::RepairChain,
            "6" => break,
            _ => {
                println!("Invalid selection. Please try again.");
                continue;
            }
        };

        let response = client
            .send(&keypair, &command)
            .await
            .context("request to the verifying server failed")?;
        println!("{}", response.message);
    }

    Ok(())
}

/// Print `text` and read one trimmed line. `None` at end of input.
async fn prompt(input: &mut Lines<BufReader<Stdin>>, text: &str) -> Result<Option<String>> {
    print!("{text}");
    std::io::stdout().flush()?;
    Ok(input.next_line().await?.map(|line| line.trim().to_string()))
}

async fn prompt_required(input: &mut Lines<BufReader<Stdin>>, text: &str) -> Result<String> {
    match prompt(input, text).await? {
        Some(line) => Ok(line),
        None => bail!("input closed"),
    }
}

async fn prompt_parsed<T>(input: &mut Lines<BufReader<Stdin>>, text: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    loop {
        let line = prompt_required(input, text).await?;
        match line.parse() {
            Ok(value) => return Ok(value),
            Err(err) => println!("Not a valid number ({err}). Please try again."),
        }
    }
}

async fn cmd_demo(difficulty: i32) -> Result<()> {
    println!("=== Signet: Local Ledger Demo ===\n");

    let chain = tokio::task::spawn_blocking(|| BlockChain::with_config(&LedgerConfig::default()))
        .await
        .context("building the genesis ledger")?;
    let ledger = SharedLedger::new(chain);
    let cancel = signet_chain::CancelToken::new();

    println!("[Genesis]");
    println!("{}", ledger.read(|chain| chain.status()));

    for data in ["A", "B"] {
        let block = ledger.add_block(data, difficulty, &cancel).await?;
        println!("\n[Block {}] added {data:?} with nonce {}", block.index, block.nonce);
    }

    println!("\nChain verification: {}", ledger.read(BlockChain::is_valid));

    ledger.write(|chain| chain.corrupt(1, "TAMPERED"))?;
    println!("\n[Tamper] Block 1 now contains: TAMPERED");
    println!("Chain verification: {}", ledger.read(BlockChain::is_valid));

    let remined = ledger.repair(&cancel).await?;
    println!("\n[Repair] re-mined {remined} block(s)");
    println!("Chain verification: {}", ledger.read(BlockChain::is_valid));

    println!("\n=== Chain ===");
    let view = ledger.read(BlockChain::view);
    println!("{}", serde_json::to_string_pretty(&view)?);

    Ok(())
}
