//! Dead-letter operator tool
//!
//! ```text
//! kestrel-dlq inspect --limit 20     # unacknowledged records, oldest first (JSON lines)
//! kestrel-dlq replay 42              # re-validate and, if valid, persist + acknowledge
//! kestrel-dlq ack 42                 # acknowledge without replaying
//! ```
//!
//! Run it against a store the pipeline is not writing to, or while the
//! pipeline is stopped; the store has a single writer.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kestrel_bins::common::{init_logging, load_config, CommonArgs};
use kestrel_core::data::{DeadLetterStore, EnvelopeValidator};
use kestrel_core::persistence::{replay_dead_letter, ReplayOutcome, SqliteStore};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect, replay and acknowledge dead-letter records")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Store path, overrides `persistence.db_path`
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List unacknowledged records
    Inspect {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Re-validate a record and persist it if it is now valid
    Replay { id: i64 },
    /// Mark a record acknowledged
    Ack { id: i64 },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.common)?;
    init_logging(&args.common, &config.logging)?;

    let path = args.db.unwrap_or(config.persistence.db_path);
    let mut store = SqliteStore::open(&path)
        .with_context(|| format!("opening store {}", path.display()))?;

    match args.command {
        Command::Inspect { limit } => {
            let records = store.dead_letters(limit).context("listing dead letters")?;
            info!(count = records.len(), "unacknowledged dead letters");
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Replay { id } => {
            match replay_dead_letter(&mut store, &EnvelopeValidator::new(), id)
                .with_context(|| format!("replaying dead letter {id}"))?
            {
                ReplayOutcome::NotFound => bail!("dead letter {id} not found"),
                ReplayOutcome::Replayed {
                    idempotency_key,
                    inserted,
                } => {
                    println!("replayed {id}: key={idempotency_key} inserted={inserted}");
                }
                ReplayOutcome::StillInvalid(e) => {
                    bail!("dead letter {id} is still invalid ({}): {e}", e.reason());
                }
            }
        }
        Command::Ack { id } => {
            if !store.acknowledge(id).with_context(|| format!("acknowledging {id}"))? {
                bail!("dead letter {id} not found");
            }
            println!("acknowledged {id}");
        }
    }
    Ok(())
}
