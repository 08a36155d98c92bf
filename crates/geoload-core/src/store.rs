//! Destination store seam
//!
//! The store holds one row per loaded footprint, tagged with region, source
//! file and chunk number. Loading a chunk replaces whatever rows already
//! carry the same (region, chunk) tag in a single transaction, so a retried
//! chunk never duplicates rows.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// One footprint ready for insertion
#[derive(Debug, Clone, PartialEq)]
pub struct FootprintRow {
    pub wkt: String,
}

/// All rows of one chunk, with their shared tags
#[derive(Debug, Clone)]
pub struct ChunkBatch {
    pub region: String,
    pub source_file: String,
    pub chunk_number: u32,
    pub srid: i32,
    pub rows: Vec<FootprintRow>,
}

/// Store-wide quality counters for spot checks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegritySnapshot {
    pub total_rows: u64,
    pub null_geometries: u64,
    pub invalid_geometries: u64,
    pub empty_region_labels: u64,
    /// Distinct SRIDs present
    pub srids: Vec<i32>,
    /// Distinct geometry type names present, upper case
    pub geometry_types: Vec<String>,
}

#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Replace the rows of (region, chunk) with `batch`; returns rows inserted
    async fn replace_chunk(&self, batch: &ChunkBatch) -> Result<u64>;

    async fn count_region(&self, region: &str) -> Result<u64>;

    async fn count_by_region(&self) -> Result<BTreeMap<String, u64>>;

    /// Remove every row of `region`, returning how many were removed
    async fn delete_region(&self, region: &str) -> Result<u64>;

    async fn integrity_snapshot(&self) -> Result<IntegritySnapshot>;
}
