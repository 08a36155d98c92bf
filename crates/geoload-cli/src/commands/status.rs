//! `geoload status` command implementation
//!
//! Reads the status file only; no database connection is needed.

use anyhow::Result;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Table};
use geoload_core::status::{JsonFileStatusStore, StatusStore};
use geoload_core::RegionStatus;

use super::load_config;

fn colorize(status: RegionStatus) -> String {
    match status {
        RegionStatus::Completed => status.to_string().green().to_string(),
        RegionStatus::Failed => status.to_string().red().to_string(),
        RegionStatus::New => status.to_string(),
        _ => status.to_string().yellow().to_string(),
    }
}

pub async fn run(json: bool) -> Result<()> {
    let config = load_config()?;
    let store = JsonFileStatusStore::new(&config.status_file);
    let records = store.read_all().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No pipeline status recorded yet.");
        println!("Run 'geoload run' to start.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "Region", "Status", "Features", "Chunks", "Updated", "Last error",
    ]);
    for record in records.values() {
        table.add_row(vec![
            record.region.clone(),
            colorize(record.status),
            record
                .total_features
                .map(|n| n.to_string())
                .unwrap_or_default(),
            record
                .total_chunks
                .map(|n| n.to_string())
                .unwrap_or_default(),
            record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            record.last_error.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");

    let completed = records
        .values()
        .filter(|r| r.status == RegionStatus::Completed)
        .count();
    let failed = records
        .values()
        .filter(|r| r.status == RegionStatus::Failed)
        .count();
    println!();
    println!("{}", "Summary:".cyan().bold());
    println!("  Completed: {completed}");
    println!("  Failed:    {failed}");
    println!("  Other:     {}", records.len() - completed - failed);
    Ok(())
}
