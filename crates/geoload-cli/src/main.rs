//! geoload CLI - Main entry point

use clap::Parser;
use geoload_cli::commands;
use geoload_cli::{Cli, Commands};
use geoload_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("geoload")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // The guard flushes file output on drop; the CLI works without logging
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: failed to initialize logging: {e}");
            None
        }
    };

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn execute_command(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Download { regions } => commands::download::run(regions).await,
        Commands::Chunk { regions, overwrite } => commands::chunk::run(regions, *overwrite).await,
        Commands::Upload { regions, resume } => commands::upload::run(regions, *resume).await,
        Commands::Validate { integrity } => commands::validate::run(*integrity).await,
        Commands::Inventory => commands::inventory::run().await,
        Commands::Status { json } => commands::status::run(*json).await,
        Commands::Run {
            regions,
            resume,
            dry_run,
        } => commands::run::run(regions, *resume, *dry_run).await,
        Commands::Migrate => commands::migrate::run().await,
    }
}
