//! `geoload upload` command implementation
//!
//! Loads chunks without touching region status; `geoload run` is the
//! orchestrated path.

use anyhow::Result;
use colored::Colorize;
use geoload_core::loader::ChunkLoader;
use geoload_core::manifest::Manifest;
use std::sync::Arc;
use tracing::{error, warn};

use super::{connect, load_config};
use crate::RegionArgs;

pub async fn run(args: &RegionArgs, resume: bool) -> Result<()> {
    let config = load_config()?;
    let store = Arc::new(connect(&config).await?);
    let loader = ChunkLoader::new(store.clone(), store, &config.chunks_dir)
        .with_srid(config.srid)
        .with_geometry_policy(config.geometry_policy);

    let mut incomplete = Vec::new();
    for region in args.resolve() {
        if !Manifest::exists(&config.chunks_dir, &region) {
            warn!(region = %region, "No manifest, run `geoload chunk` first");
            println!("{} {} (not chunked)", "skip".yellow(), region);
            continue;
        }
        let manifest = Manifest::load(&config.chunks_dir, &region)?;

        match loader
            .upload(&manifest, resume, config.chunk_failure_policy)
            .await
        {
            Ok(summary) if summary.is_complete() => println!(
                "{} {}: {} chunks loaded, {} skipped, {} features",
                "ok".green(),
                region.bold(),
                summary.loaded.len(),
                summary.skipped.len(),
                summary.features_loaded
            ),
            Ok(summary) => {
                for (chunk, message) in &summary.failed {
                    println!("  chunk {chunk}: {message}");
                }
                println!(
                    "{} {}: {} of {} chunks failed",
                    "partial".yellow(),
                    region.bold(),
                    summary.failed.len(),
                    manifest.total_chunks
                );
                incomplete.push(region);
            }
            Err(e) => {
                error!(region = %region, error = %e, "Upload failed");
                println!("{} {}: {e}", "failed".red(), region.bold());
                incomplete.push(region);
            }
        }
    }

    if !incomplete.is_empty() {
        anyhow::bail!(
            "Upload incomplete for {}; re-run with --resume",
            incomplete.join(", ")
        );
    }
    Ok(())
}
