//! `geoload inventory` command implementation

use anyhow::{Context, Result};
use colored::Colorize;
use geoload_core::inventory::{generate_inventory, CsvInventory};

use super::load_config;

pub async fn run() -> Result<()> {
    let config = load_config()?;
    let source_dir = config.source_data_dir.clone();

    let rows = tokio::task::spawn_blocking(move || generate_inventory(&source_dir))
        .await?
        .with_context(|| {
            format!("Failed to scan {}", config.source_data_dir.display())
        })?;

    if rows.is_empty() {
        println!("No source files found in {}.", config.source_data_dir.display());
        println!("Run 'geoload download' first.");
        return Ok(());
    }

    std::fs::create_dir_all(&config.reports_dir)?;
    let inventory = CsvInventory::new(config.inventory_path());
    inventory.write_rows(&rows)?;

    for row in &rows {
        println!(
            "{:<20} {:>12} features {:>10.2} MB",
            row.region, row.feature_count, row.file_size_mb
        );
    }

    let total: u64 = rows.iter().map(|r| r.feature_count).sum();
    println!();
    println!("{}", "Summary:".cyan().bold());
    println!("  Regions:  {}", rows.len());
    println!("  Features: {total}");
    println!("  Written:  {}", inventory.path().display());
    Ok(())
}
