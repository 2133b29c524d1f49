//! FitCoach sync state tool
//!
//! Inspects and repairs the state directory the sync engine persists:
//! change tokens, the offline queue, sync metadata and subscriptions.
//!
//! Usage:
//!   fitcoach-cli --state-dir ~/.fitcoach/sync status
//!   fitcoach-cli queue
//!   fitcoach-cli reset --purge-queue

use anyhow::Result;
use clap::{Parser, Subcommand};
use fitcoach_cli::{StateSummary, drop_operation, list_queue, load_config, reset_state, summarize};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fitcoach-cli")]
#[command(about = "Inspect and reset FitCoach sync state")]
struct Args {
    /// Directory holding the sync state database and change tokens
    #[arg(short, long, default_value = "./fitcoach-state")]
    state_dir: PathBuf,

    /// Sync configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show sync metadata, change tokens and queue depth
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List pending operations in drain order
    Queue,
    /// Remove one pending operation
    DropOp {
        /// Operation ID as shown by `queue`
        id: String,
    },
    /// Forget change tokens so the next launch runs a full sync
    Reset {
        /// Also discard pending operations
        #[arg(long)]
        purge_queue: bool,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = load_config(&args.state_dir, args.config.as_deref())?;

    match args.command {
        Command::Status { json } => {
            let summary = summarize(&config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Command::Queue => {
            let entries = list_queue(&config)?;
            if entries.is_empty() {
                println!("Queue is empty");
            }
            for entry in entries {
                println!(
                    "{}  {:<6}  {}  retries={}  enqueued={}",
                    entry.id,
                    entry.kind.to_string(),
                    entry.key,
                    entry.retry_count,
                    entry.enqueued_at.to_rfc3339()
                );
            }
        }
        Command::DropOp { id } => {
            drop_operation(&config, &id)?;
            println!("Dropped {id}");
        }
        Command::Reset { purge_queue } => {
            let report = reset_state(&config, purge_queue)?;
            println!(
                "Cleared {} change tokens; purged {} pending operations",
                report.tokens_cleared, report.operations_purged
            );
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

fn print_summary(summary: &StateSummary) {
    println!("Initial sync:  {}", if summary.initial_sync_completed { "done" } else { "pending" });
    match summary.last_sync {
        Some(at) => println!("Last sync:     {}", at.to_rfc3339()),
        None => println!("Last sync:     never"),
    }
    println!("Pending ops:   {}", summary.pending_operations);
    println!("Subscriptions: {}", summary.subscriptions.join(", "));
    println!("Change tokens: {}", summary.tokens.len());
    for entry in &summary.tokens {
        println!("  {:<32} {}", entry.scope, entry.token);
    }
}
