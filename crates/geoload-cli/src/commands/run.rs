//! `geoload run` command implementation
//!
//! Wires the Postgres store, the HTTP fetcher, the status file and the
//! inventory CSV into a [`RegionOrchestrator`].

use anyhow::Result;
use colored::Colorize;
use geoload_core::config::LoaderConfig;
use geoload_core::fetch::HttpZipFetcher;
use geoload_core::inventory::CsvInventory;
use geoload_core::memory::{MemoryLedger, MemoryStore};
use geoload_core::orchestrator::RunPlan;
use geoload_core::status::JsonFileStatusStore;
use geoload_core::{Collaborators, PipelineSettings, RegionOrchestrator, RunMode, RunSummary};
use std::sync::Arc;
use std::time::Duration;

use super::{connect, load_config};
use crate::RegionArgs;

fn fetcher(config: &LoaderConfig) -> Result<Arc<HttpZipFetcher>> {
    Ok(Arc::new(HttpZipFetcher::new(
        &config.download_base_url,
        &config.source_data_dir,
        Duration::from_secs(config.download_timeout_secs),
    )?))
}

pub async fn run(args: &RegionArgs, resume: bool, dry_run: bool) -> Result<()> {
    let config = load_config()?;
    let regions = args.resolve();
    let status = Arc::new(JsonFileStatusStore::new(&config.status_file));
    let catalog = Arc::new(CsvInventory::new(config.inventory_path()));
    let settings = PipelineSettings::from_config(&config);

    if dry_run {
        // planning only reads the status file
        let store = Arc::new(MemoryStore::new());
        let collaborators = Collaborators {
            status,
            fetcher: fetcher(&config)?,
            store,
            ledger: Arc::new(MemoryLedger::new()),
            catalog,
        };
        let plan = RegionOrchestrator::new(collaborators, settings)
            .plan(&regions)
            .await?;
        print_plan(&plan);
        return Ok(());
    }

    let store = Arc::new(connect(&config).await?);
    let collaborators = Collaborators {
        status,
        fetcher: fetcher(&config)?,
        store: store.clone(),
        ledger: store,
        catalog,
    };
    let mode = if resume { RunMode::Resume } else { RunMode::Full };
    let summary = RegionOrchestrator::new(collaborators, settings)
        .run(&regions, mode)
        .await?;
    print_summary(&summary);

    if !summary.all_completed() {
        anyhow::bail!(
            "{} of {} regions not completed; re-run to continue",
            summary.target_regions - summary.completed_regions,
            summary.target_regions
        );
    }
    Ok(())
}

fn print_plan(plan: &RunPlan) {
    println!("{}", "Dry run:".cyan().bold());
    if !plan.completed.is_empty() {
        println!("  Skipping (completed): {}", plan.completed.join(", "));
    }
    if plan.pending.is_empty() {
        println!("  Nothing to process.");
    }
    for (region, status) in &plan.pending {
        println!("  Would process {region} (currently {status})");
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Run summary:".cyan().bold());
    for outcome in &summary.outcomes {
        let label = if outcome.error.is_none() {
            "ok".green()
        } else {
            "failed".red()
        };
        println!(
            "  {label} {:<20} {:>8.1}s {}",
            outcome.region,
            outcome.elapsed_secs,
            outcome.error.as_deref().unwrap_or_default()
        );
    }
    if !summary.skipped.is_empty() {
        println!("  Skipped (completed): {}", summary.skipped.len());
    }
    println!(
        "  Completed {}/{} regions in {:.1}s",
        summary.completed_regions, summary.target_regions, summary.elapsed_secs
    );
}
