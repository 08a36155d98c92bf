//! `geoload chunk` command implementation

use anyhow::Result;
use colored::Colorize;
use geoload_core::chunker::ChunkBuilder;
use geoload_core::fetch::source_path;
use std::sync::Arc;
use tracing::{error, warn};

use super::load_config;
use crate::RegionArgs;

pub async fn run(args: &RegionArgs, overwrite: bool) -> Result<()> {
    let config = load_config()?;
    let builder = Arc::new(ChunkBuilder::new(&config.chunks_dir));

    let mut failed = Vec::new();
    for region in args.resolve() {
        let source = source_path(&config.source_data_dir, &region);
        if !source.is_file() {
            warn!(region = %region, path = %source.display(), "Source not found, skipping");
            println!("{} {} (no source file)", "skip".yellow(), region);
            continue;
        }

        let task_builder = builder.clone();
        let task_region = region.clone();
        let chunk_size = config.chunk_size;
        let result = tokio::task::spawn_blocking(move || {
            task_builder.build(&source, &task_region, chunk_size, overwrite)
        })
        .await?;

        match result {
            Ok(manifest) => println!(
                "{} {}: {} features in {} chunks",
                "ok".green(),
                region.bold(),
                manifest.total_features,
                manifest.total_chunks
            ),
            Err(e) => {
                error!(region = %region, error = %e, "Chunking failed");
                println!("{} {}: {e}", "failed".red(), region.bold());
                failed.push(region);
            }
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("Chunking failed for {}", failed.join(", "));
    }
    Ok(())
}
