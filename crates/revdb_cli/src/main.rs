//! revdb CLI
//!
//! Command-line tools for revdb database maintenance.
//!
//! # Commands
//!
//! - `inspect` - Display document counts, sequence and journal size
//! - `get` / `put` / `delete` / `purge` - Work with single documents
//! - `conflicts` - List conflicted documents
//! - `resolve` - Resolve conflicts with a built-in strategy
//! - `compact` - Rewrite the journal to reclaim space

mod commands;

use clap::{Parser, Subcommand};
use commands::{CliError, DatabaseArgs, Strategy};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// revdb command-line database tools.
#[derive(Parser)]
#[command(name = "revdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the `<name>.revdb` database
    #[arg(global = true, short, long, default_value = ".")]
    directory: PathBuf,

    /// Database name
    #[arg(global = true, short, long)]
    name: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display database statistics
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print a document as JSON
    Get {
        /// Document id
        id: String,

        /// Also print the revision history
        #[arg(long)]
        history: bool,
    },

    /// Save a JSON object as a document's body
    Put {
        /// Document id
        id: String,

        /// JSON object
        json: String,

        /// Refuse to overwrite a concurrent change
        #[arg(long)]
        fail_on_conflict: bool,
    },

    /// Delete a document
    Delete {
        /// Document id
        id: String,
    },

    /// Remove a document and its history
    Purge {
        /// Document id
        id: String,
    },

    /// List documents with unresolved conflicts
    Conflicts,

    /// Resolve conflicts
    Resolve {
        /// Document id (all conflicted documents if omitted)
        id: Option<String>,

        /// Which side wins
        #[arg(short, long, value_enum, default_value_t = Strategy::Default)]
        strategy: Strategy,
    },

    /// Compact the journal
    Compact,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("revdb CLI v{}", env!("CARGO_PKG_VERSION"));
        println!("revdb core v{}", revdb_core::VERSION);
        return Ok(());
    }

    let name = cli.name.ok_or(CliError::Usage("--name is required"))?;
    let args = DatabaseArgs {
        directory: cli.directory,
        name,
    };

    match cli.command {
        Commands::Inspect { format } => commands::inspect::run(&args, &format)?,
        Commands::Get { id, history } => commands::documents::get(&args, &id, history)?,
        Commands::Put {
            id,
            json,
            fail_on_conflict,
        } => commands::documents::put(&args, &id, &json, fail_on_conflict)?,
        Commands::Delete { id } => commands::documents::delete(&args, &id)?,
        Commands::Purge { id } => commands::documents::purge(&args, &id)?,
        Commands::Conflicts => commands::conflicts::list(&args)?,
        Commands::Resolve { id, strategy } => {
            commands::conflicts::resolve(&args, id.as_deref(), strategy)?;
        }
        Commands::Compact => commands::compact::run(&args)?,
        Commands::Version => {}
    }

    Ok(())
}
