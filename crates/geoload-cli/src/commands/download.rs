//! `geoload download` command implementation

use anyhow::Result;
use colored::Colorize;
use geoload_core::fetch::{HttpZipFetcher, SourceFetcher};
use std::time::Duration;
use tracing::error;

use super::{format_bytes, load_config};
use crate::RegionArgs;

/// Fetch every target region, continuing past failures
pub async fn run(args: &RegionArgs) -> Result<()> {
    let config = load_config()?;
    let fetcher = HttpZipFetcher::new(
        &config.download_base_url,
        &config.source_data_dir,
        Duration::from_secs(config.download_timeout_secs),
    )?;

    let regions = args.resolve();
    let mut failed = Vec::new();
    for (index, region) in regions.iter().enumerate() {
        println!("[{}/{}] {}", index + 1, regions.len(), region.bold());
        match fetcher.fetch(region).await {
            Ok(handle) => println!(
                "  {} {} ({})",
                "ok".green(),
                handle.path.display(),
                format_bytes(handle.size_bytes)
            ),
            Err(e) => {
                error!(region = %region, error = %e, "Download failed");
                println!("  {} {e}", "failed".red());
                failed.push(region.clone());
            }
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("{} of {} downloads failed: {}", failed.len(), regions.len(), failed.join(", "));
    }
    Ok(())
}
