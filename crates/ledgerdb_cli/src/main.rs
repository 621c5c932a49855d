//! LedgerDB CLI
//!
//! Command-line tools for LedgerDB database maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display log and snapshot statistics
//! - `verify` - Verify log and snapshot integrity
//! - `dump-wal` - Dump WAL entries for debugging
//! - `checkpoint` - Recover, write a snapshot and truncate the WAL

mod commands;
mod error;

use clap::{Parser, Subcommand, ValueEnum};
use error::{CliError, CliResult};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// LedgerDB command-line database tools.
#[derive(Parser)]
#[command(name = "ledgerdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Display log and snapshot statistics
    Inspect {
        /// List every snapshot image
        #[arg(short, long)]
        snapshots: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Verify log and snapshot integrity
    Verify {
        /// Check the WAL
        #[arg(short, long)]
        wal: bool,

        /// Check snapshot images
        #[arg(short, long)]
        snapshots: bool,
    },

    /// Dump WAL entries for debugging
    DumpWal {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only show entries of this transaction
        #[arg(short, long)]
        txid: Option<u64>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Recover the database, write a snapshot and truncate the WAL
    Checkpoint,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    run(cli)?;
    Ok(())
}

fn run(cli: Cli) -> CliResult<()> {
    match cli.command {
        Commands::Inspect { snapshots, format } => {
            let path = cli.path.ok_or(CliError::MissingPath("inspect"))?;
            commands::inspect::run(&path, snapshots, format)
        }
        Commands::Verify { wal, snapshots } => {
            let path = cli.path.ok_or(CliError::MissingPath("verify"))?;
            let check_all = !wal && !snapshots;
            commands::verify::run(&path, wal || check_all, snapshots || check_all)
        }
        Commands::DumpWal {
            limit,
            txid,
            format,
        } => {
            let path = cli.path.ok_or(CliError::MissingPath("dump-wal"))?;
            commands::dump_wal::run(&path, limit, txid, format)
        }
        Commands::Checkpoint => {
            let path = cli.path.ok_or(CliError::MissingPath("checkpoint"))?;
            commands::checkpoint::run(&path)
        }
        Commands::Version => {
            println!("LedgerDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("LedgerDB Core v{}", ledgerdb_core::VERSION);
            Ok(())
        }
    }
}
