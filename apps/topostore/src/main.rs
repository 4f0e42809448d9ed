//! # topostore
//!
//! The binary for the temporal topology graph store.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                apps/topostore (THE BINARY)            │
//! │                                                       │
//! │   ┌─────────────┐    ┌─────────────┐    ┌──────────┐  │
//! │   │    CLI      │    │  HTTP API   │    │  Config  │  │
//! │   │   (clap)    │    │   (axum)    │    │  (toml)  │  │
//! │   └──────┬──────┘    └──────┬──────┘    └────┬─────┘  │
//! │          └──────────────────┼────────────────┘        │
//! │                             ▼                         │
//! │                   ┌──────────────────┐                │
//! │                   │  topostore-core  │                │
//! │                   │  graph + history │                │
//! │                   └──────────────────┘                │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start the HTTP server
//! topostore --config topostore.toml server --port 8082
//!
//! # CLI operations
//! topostore status
//! topostore dump --at 1700000000000 -o snapshot.json
//! topostore history eth0
//! topostore replay -f messages.jsonl
//! ```

use clap::Parser;
use topostore::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // TOPOSTORE_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("TOPOSTORE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "topostore=info,topostore_core=info,tower_http=debug".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_banner() {
    println!(
        r#"
  topostore v{}
  temporal topology graph store
"#,
        env!("CARGO_PKG_VERSION")
    );
}
