//! Expected per-region feature counts
//!
//! The inventory is a small CSV (`region,file_path,feature_count,file_size_mb`)
//! generated by scanning the source directory and refreshed for each region
//! as it completes. It is the reference the validator reconciles against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::Result;
use crate::stream::count_features;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Expected feature counts per region
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn expected_counts(&self) -> Result<BTreeMap<String, u64>>;
}

/// Receives final counts for a completed region
#[async_trait]
pub trait CatalogUpdater: Send + Sync {
    async fn upsert(&self, region: &str, total_features: u64, size_bytes: u64) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRow {
    pub region: String,
    pub file_path: String,
    pub feature_count: u64,
    pub file_size_mb: f64,
}

fn round_mb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
}

fn sort_rows(rows: &mut [InventoryRow]) {
    rows.sort_by(|a, b| {
        b.feature_count
            .cmp(&a.feature_count)
            .then_with(|| a.region.cmp(&b.region))
    });
}

/// Count every `*.geojson` file in `source_dir`
///
/// Rows come back sorted by feature count, largest first.
pub fn generate_inventory(source_dir: &Path) -> Result<Vec<InventoryRow>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(source_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "geojson"))
        .collect();
    files.sort();

    let mut rows = Vec::with_capacity(files.len());
    for path in files {
        let Some(region) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        let size_bytes = std::fs::metadata(&path)?.len();
        let feature_count = count_features(&path)?;
        info!(region = %region, features = feature_count, size_bytes, "Counted source");

        rows.push(InventoryRow {
            region,
            file_path: path.display().to_string(),
            feature_count,
            file_size_mb: round_mb(size_bytes),
        });
    }

    sort_rows(&mut rows);
    Ok(rows)
}

/// Inventory kept in a CSV file
pub struct CsvInventory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CsvInventory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all rows; a missing file is an empty inventory
    pub fn read_rows(&self) -> Result<Vec<InventoryRow>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Replace the file with `rows`, sorted largest first
    pub fn write_rows(&self, rows: &[InventoryRow]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut sorted = rows.to_vec();
        sort_rows(&mut sorted);

        let tmp = self.path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp)?;
            for row in &sorted {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl InventorySource for CsvInventory {
    async fn expected_counts(&self) -> Result<BTreeMap<String, u64>> {
        let _guard = self.lock.lock().await;
        if !self.path.exists() {
            warn!(path = %self.path.display(), "Inventory not found; expected counts are empty");
        }
        Ok(self
            .read_rows()?
            .into_iter()
            .map(|r| (r.region, r.feature_count))
            .collect())
    }
}

#[async_trait]
impl CatalogUpdater for CsvInventory {
    async fn upsert(&self, region: &str, total_features: u64, size_bytes: u64) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut rows = self.read_rows()?;

        match rows.iter_mut().find(|r| r.region == region) {
            Some(row) => {
                row.feature_count = total_features;
                row.file_size_mb = round_mb(size_bytes);
            }
            None => rows.push(InventoryRow {
                region: region.to_string(),
                file_path: format!("{region}.geojson"),
                feature_count: total_features,
                file_size_mb: round_mb(size_bytes),
            }),
        }

        self.write_rows(&rows)?;
        info!(region, features = total_features, "Inventory updated");
        Ok(())
    }
}
