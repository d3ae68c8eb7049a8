//! Tactus unit runner binary.
//!
//! # Usage
//!
//! ```bash
//! # Serve one simulation unit per the configuration
//! tactus-client --config unit.json
//! ```

use std::path::PathBuf;

use clap::Parser;
use tactus_client::{ClientConfig, UnitRunner, connect_channel, table_backend};
use tactus_core::UnitAdapter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tactus simulation unit runner
#[derive(Parser, Debug)]
#[command(name = "tactus-client")]
#[command(about = "Runs one simulation unit against a Tactus orchestrator")]
#[command(version)]
struct Args {
    /// Path to the unit configuration (JSON)
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

    let config = ClientConfig::load(&args.config)?;
    tracing::info!(unit_id = config.unit_id, transport = ?config.transport, "unit starting");

    let backend = table_backend(&config.variables);
    let adapter = UnitAdapter::new(config.unit_id, &config.variables, backend)?;
    let channel = connect_channel(&config).await?;

    let runner = UnitRunner::start(adapter, channel, config.idle_limit())?;
    let summary = runner.run().await?;

    tracing::info!(
        steps = summary.steps,
        elapsed_us = summary.elapsed_us,
        "unit finished"
    );

    Ok(())
}
