//! `geoload validate` command implementation

use anyhow::{Context, Result};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Table};
use geoload_core::inventory::CsvInventory;
use geoload_core::validator::{write_report_csv, Validator};
use std::sync::Arc;

use super::{connect, load_config};

pub async fn run(integrity: bool) -> Result<()> {
    let config = load_config()?;
    let store = Arc::new(connect(&config).await?);
    let inventory = Arc::new(CsvInventory::new(config.inventory_path()));
    let validator =
        Validator::new(store.clone(), store, inventory).with_expected_srid(config.srid);

    let report = validator
        .reconcile()
        .await
        .context("Reconciliation failed; has `geoload inventory` been run?")?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "Region", "Expected", "Observed", "Missing", "Complete %", "Chunks ok", "Chunks failed",
    ]);
    for row in &report.rows {
        table.add_row(vec![
            row.region.clone(),
            row.expected.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
            row.observed.to_string(),
            row.missing.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
            row.percent_complete
                .map(|p| format!("{p:.2}"))
                .unwrap_or_else(|| "-".into()),
            row.chunks_completed.to_string(),
            row.chunks_failed.to_string(),
        ]);
    }
    println!("{table}");

    let summary = &report.summary;
    println!();
    println!("{}", "Summary:".cyan().bold());
    println!("  Regions matched: {}/{}", summary.regions_matched, summary.regions);
    println!("  Expected:        {}", summary.total_expected);
    println!("  Observed:        {}", summary.total_observed);
    println!("  Complete:        {:.2}%", summary.percent_complete);

    std::fs::create_dir_all(&config.reports_dir)?;
    let report_path = config.validation_report_path();
    write_report_csv(&report_path, &report.rows)?;
    println!("  Report:          {}", report_path.display());

    if integrity {
        let checks = validator.integrity().await?;
        println!();
        println!("{}", "Integrity:".cyan().bold());
        println!("  Rows: {}", checks.snapshot.total_rows);
        if checks.is_clean() {
            println!("  {}", "no findings".green());
        }
        for finding in &checks.findings {
            println!("  {} {finding:?}", "!".yellow());
        }
    }

    if !summary.mismatched.is_empty() {
        anyhow::bail!("{} region(s) do not match", summary.mismatched.len());
    }
    Ok(())
}
