//! tether - AI command and dashboard sync CLI
//!
//! Runs the unified orchestrator against the configured services and
//! inspects the cached sync state.

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether_core::SyncConfig;

mod cli;
mod commands;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive("tether=info".parse()?);
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    // Load configuration
    let mut config = SyncConfig::load().context("Failed to load configuration")?;
    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }

    match cli.command {
        Commands::Run { once } => commands::run::execute(config, once).await,
        Commands::Status { json } => commands::status::execute(&config, json),
        Commands::Probe => commands::probe::execute(&config).await,
        Commands::Config(cmd) => commands::config::execute(cmd, &config),
        Commands::Version => {
            println!("tether {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
