//! yapdb CLI
//!
//! Command-line tools for inspecting and maintaining yapdb databases.
//!
//! # Commands
//!
//! - `inspect` - Display snapshots, file sizes and collections
//! - `verify` - Open the database and decode every row
//! - `checkpoint` - Fold the WAL into the main store
//! - `dump` - Print rows as text or JSON
//! - `wal` - Dump WAL records for debugging

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// yapdb command-line database tools.
#[derive(Parser)]
#[command(name = "yapdb")]
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

#[derive(Subcommand)]
enum Commands {
    /// Display snapshots, file sizes and collections
    Inspect {
        /// Show per-collection key counts
        #[arg(short, long)]
        collections: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Open the database and decode every row
    Verify,

    /// Fold the WAL into the main store
    Checkpoint,

    /// Print rows
    Dump {
        /// Only dump this collection
        #[arg(short, long)]
        collection: Option<String>,

        /// Maximum number of rows to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump WAL records for debugging
    Wal {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start from this offset
        #[arg(short, long, default_value = "0")]
        offset: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect {
            collections,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, collections, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Database path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Checkpoint => {
            let path = cli.path.ok_or("Database path required for checkpoint")?;
            commands::checkpoint::run(&path)?;
        }
        Commands::Dump {
            collection,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for dump")?;
            commands::dump::run(&path, collection.as_deref(), limit, &format)?;
        }
        Commands::Wal {
            limit,
            offset,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for wal")?;
            commands::wal::run(&path, limit, offset, &format)?;
        }
        Commands::Version => {
            println!("yapdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("yapdb core v{}", yapdb_core::VERSION);
        }
    }

    Ok(())
}
