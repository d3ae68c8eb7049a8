//! Tactus orchestrator binary.
//!
//! # Usage
//!
//! ```bash
//! # Drive the units named in the configuration
//! tactus-server --config orchestrator.json
//!
//! # With a real TLS certificate the configuration names cert/key paths;
//! # without one a self-signed certificate is generated.
//! ```

use std::path::PathBuf;

use clap::Parser;
use tactus_server::{Server, ServerConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tactus lockstep orchestrator
#[derive(Parser, Debug)]
#[command(name = "tactus-server")]
#[command(about = "Drives lockstep simulation rounds across attached units")]
#[command(version)]
struct Args {
    /// Path to the orchestrator configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(config = %args.config.display(), "tactus orchestrator starting");

    let config = ServerConfig::load(&args.config)?;
    let mut server = Server::bind(config)?;

    if let Some(addr) = server.local_addr()? {
        tracing::info!(%addr, "waiting for remote units");
    }
    server.attach().await?;

    let summary = server.run().await?;
    tracing::info!(
        rounds = summary.rounds,
        final_time_us = summary.final_time_us,
        "simulation finished"
    );

    Ok(())
}
