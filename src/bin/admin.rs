//! Operator CLI for the MRO ledger
//!
//! Every subcommand opens the configured SQLite database, does one job and
//! exits; scheduling (daily batching, confirmation sweeps) is left to cron.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use mro_ledger::anchor::{AnchorPublisher, ConfirmOutcome};
use mro_ledger::config::Config;
use mro_ledger::crypto::ExportSigningKey;
use mro_ledger::domain::{AnchorPeriod, KeyRecord};
use mro_ledger::infra::{AnchorBatcher, BatchOutcome, DeadLetterQueue, Ledger, ReceiptStore};
use mro_ledger::server::{init_tracing, Stores};

#[derive(Parser)]
#[command(name = "ledger-admin")]
#[command(about = "MRO ledger administration")]
#[command(version)]
struct Cli {
    /// SQLite URL (defaults to env DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,

    /// Append one event to the ledger
    Append {
        #[arg(long)]
        event_type: String,
        /// Payload as a JSON object
        #[arg(long)]
        payload: String,
        #[arg(long)]
        actor_id: Option<i64>,
    },

    /// Verify the hash chain, whole or by id range
    VerifyChain {
        #[arg(long)]
        from_id: Option<i64>,
        #[arg(long)]
        to_id: Option<i64>,
    },

    /// Build the Merkle anchor for one UTC day (default: yesterday)
    AnchorPeriod {
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Submit a pending anchor's root on-chain
    Publish {
        #[arg(long)]
        anchor_id: i64,
    },

    /// Wait for a submitted anchor's transaction receipt
    Confirm {
        #[arg(long)]
        anchor_id: i64,
    },

    /// Write an anchor's proof bundle as JSON
    ProofBundle {
        #[arg(long)]
        anchor_id: i64,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Re-submit dead-lettered appends
    ReplayDeadLetters,

    /// Show the dead-letter queue depth
    DeadLetterStats,

    /// Manage export signing keys
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// List registered keys
    List,
    /// Generate a keypair, write the private key and register the public key
    Generate {
        /// Where to write the PKCS#8 PEM private key
        #[arg(long)]
        out: PathBuf,
        /// Make it the active signing key
        #[arg(long)]
        activate: bool,
    },
    /// Revoke a key; signatures made with it stop verifying
    Revoke {
        #[arg(long)]
        key_id: String,
        #[arg(long)]
        reason: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let pool = mro_ledger::infra::sqlite::connect(&config.database_url, config.max_connections)
        .await?;
    if let Commands::Migrate = cli.command {
        mro_ledger::migrations::run_sqlite(&pool).await?;
        println!("ok: migrations applied");
        return Ok(());
    }

    let stores = Stores::sqlite(pool);
    let dead_letters = Arc::new(DeadLetterQueue::new(&config.dead_letter_path));
    let ledger = Ledger::new(stores.events.clone())
        .with_retry_policy(config.retry_policy())
        .with_dead_letters(dead_letters.clone());

    match cli.command {
        Commands::Migrate => Ok(()),

        Commands::Append {
            event_type,
            payload,
            actor_id,
        } => {
            let payload: Value = serde_json::from_str(&payload)
                .map_err(|e| anyhow::anyhow!("--payload is not valid JSON: {e}"))?;
            let block_hash = ledger.append(&event_type, payload, actor_id).await?;
            println!("{block_hash}");
            Ok(())
        }

        Commands::VerifyChain { from_id, to_id } => {
            let outcome = ledger.verify(from_id, to_id).await?;
            print_json(&outcome)?;
            if !outcome.ok {
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::AnchorPeriod { date } => {
            let day = date.unwrap_or_else(|| AnchorPeriod::previous_day(Utc::now()).day());
            let batcher = AnchorBatcher::new(
                stores.events.clone(),
                stores.anchors.clone(),
                ReceiptStore::new(&config.receipts_dir),
            );
            let outcome = batcher.run_period(day).await?;
            let state = match &outcome {
                BatchOutcome::Created(_) => "created",
                BatchOutcome::AlreadyAnchored(_) => "already_anchored",
            };
            print_json(&serde_json::json!({
                "day": day,
                "result": state,
                "anchor": outcome.anchor(),
            }))
        }

        Commands::Publish { anchor_id } => {
            let outcome = publisher(&config, &stores).publish(anchor_id).await?;
            print_json(&outcome)
        }

        Commands::Confirm { anchor_id } => {
            let outcome = publisher(&config, &stores).confirm(anchor_id).await?;
            print_json(&outcome)?;
            if matches!(outcome, ConfirmOutcome::Failed(_)) {
                std::process::exit(1);
            }
            Ok(())
        }

        Commands::ProofBundle { anchor_id, output } => {
            let bundle = publisher(&config, &stores)
                .build_proof_bundle(anchor_id)
                .await?;
            let text = serde_json::to_string_pretty(&bundle)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, text).await?;
                    println!("ok: wrote {}", path.display());
                }
                None => println!("{text}"),
            }
            Ok(())
        }

        Commands::ReplayDeadLetters => {
            let report = dead_letters.replay(&ledger).await?;
            print_json(&report)
        }

        Commands::DeadLetterStats => print_json(&dead_letters.stats().await?),

        Commands::Keys { action } => match action {
            KeyCommands::List => print_json(&stores.keys.list().await?),
            KeyCommands::Generate { out, activate } => {
                if tokio::fs::try_exists(&out).await? {
                    anyhow::bail!("{} already exists", out.display());
                }
                let key = ExportSigningKey::generate();
                let key_id = key.key_id();
                tokio::fs::write(&out, key.to_pkcs8_pem()?).await?;

                stores
                    .keys
                    .register(KeyRecord::new(&key_id, key.public_key().to_pem(), Utc::now()))
                    .await?;
                if activate {
                    stores.keys.activate(&key_id).await?;
                }
                tracing::info!(
                    %key_id,
                    activate,
                    path = %out.display(),
                    "Export signing key generated"
                );
                println!("{key_id}");
                Ok(())
            }
            KeyCommands::Revoke { key_id, reason } => {
                let record = stores.keys.revoke(&key_id, &reason).await?;
                print_json(&record)
            }
        },
    }
}

fn publisher(config: &Config, stores: &Stores) -> AnchorPublisher {
    AnchorPublisher::new(
        config.anchor.clone(),
        stores.anchors.clone(),
        stores.events.clone(),
        ReceiptStore::new(&config.receipts_dir),
    )
}
