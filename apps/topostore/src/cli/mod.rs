//! # topostore CLI Module
//!
//! ## Available Commands
//!
//! - `server` - Start the HTTP server
//! - `status` - Show entity counts and storage settings
//! - `dump` - Write a sync snapshot (live or as of an instant)
//! - `history` - Print every revision of a node or edge
//! - `replay` - Apply a file of replication envelopes
//! - `init` - Create an empty database

mod commands;

use crate::config::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use topostore_core::{CacheMode, TopologyError};

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// topostore - temporal topology graph store
///
/// Keeps the current network topology and every revision of it, so the graph
/// can be read as it was at any instant.
#[derive(Parser, Debug)]
#[command(name = "topostore")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the graph database (overrides config and TOPOSTORE_DB)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Cache mode: cache_only, persistent_only or default
    #[arg(short = 'M', long, global = true)]
    pub mode: Option<CacheMode>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Server {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show graph status
    Status,

    /// Write the graph as a Sync envelope
    Dump {
        /// Read as of this instant (ms since epoch) instead of live
        #[arg(short, long)]
        at: Option<i64>,

        /// Metadata filter, a JSON object such as '{"Type":"host"}'
        #[arg(short, long)]
        filter: Option<String>,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the revision history of a node or edge
    History {
        /// Entity identifier
        id: String,

        /// Look the identifier up among edges instead of nodes
        #[arg(short, long)]
        edge: bool,
    },

    /// Apply replication envelopes from a file
    Replay {
        /// One JSON envelope per line, or a JSON array of envelopes
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Initialize new database
    Init {
        /// Force overwrite if exists
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Configuration file, then environment, then these flags.
    pub fn resolve_config(&self) -> Result<Config, TopologyError> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(database) = &self.database {
            config.storage.path = database.clone();
        }
        if let Some(mode) = self.mode {
            config.storage.mode = mode;
        }
        Ok(config)
    }
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI command.
pub async fn execute(cli: Cli) -> Result<(), TopologyError> {
    let mut config = cli.resolve_config()?;

    if cli.verbose {
        tracing::info!(
            database = %config.storage.path.display(),
            mode = %config.storage.mode,
            "configuration resolved"
        );
    }

    match cli.command {
        Some(Commands::Server { host, port }) => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            cmd_server(&config).await
        }
        Some(Commands::Status) | None => cmd_status(&config, cli.json_mode),
        Some(Commands::Dump { at, filter, output }) => {
            cmd_dump(&config, at, filter.as_deref(), output.as_deref())
        }
        Some(Commands::History { id, edge }) => cmd_history(&config, &id, edge),
        Some(Commands::Replay { file }) => cmd_replay(&config, &file, cli.json_mode),
        Some(Commands::Init { force }) => cmd_init(&config, force),
    }
}
