// Placement server entrypoint
//!
//! Initialization and shutdown live in dedicated modules so this file
//! remains a thin orchestrator.

mod config;
mod lifecycle;
mod logging;

use anyhow::Result;
use clap::Parser;
use log::info;

use config::{Cli, ServerConfig};
use lifecycle::{bootstrap, run};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Logging before any other side effects
    logging::init_logging(&config.logging)?;

    info!("Placement service v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Node {} | cluster {} | replication factor {}",
        config.raft.id, config.raft.initial_cluster, config.placement.replication_factor
    );

    let components = bootstrap(&config).await?;
    run(&config, components).await
}
