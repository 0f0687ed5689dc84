//! # Commz Relay
//!
//! Pushes chat messages to connected clients over WebSockets.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! relay
//!
//! # Run with custom config
//! relay --config /path/to/relay.toml
//!
//! # Run with environment variables
//! RELAY_PORT=4242 RELAY__STORE__MONGO_URI=mongodb://mongo:27017 relay
//! ```

use anyhow::Result;
use clap::Parser;
use relay_server::{config::Config, metrics, run_server};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "Commz realtime relay")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the MongoDB connection string.
    #[arg(long)]
    mongo_uri: Option<String>,

    /// Log at debug level.
    #[arg(long)]
    debug: bool,

    /// Disable the Prometheus exporter.
    #[arg(long)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.debug {
        "relay=debug,tower_http=debug"
    } else {
        "relay=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(uri) = cli.mongo_uri {
        config.store.mongo_uri = uri;
    }
    if cli.no_metrics {
        config.metrics.enabled = false;
    }

    tracing::info!("Starting Commz relay on {}:{}", config.host, config.port);

    if config.metrics.enabled {
        metrics::init_metrics();
    }

    run_server(config).await?;

    Ok(())
}
