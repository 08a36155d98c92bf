//! In-memory collaborators
//!
//! Used by tests and dry runs. They follow the same contracts as the
//! Postgres backend, and the store can be told to fail chosen chunks.

use async_trait::async_trait;
use chrono::Utc;
use geo::Validation;
use geo_types::Geometry;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{LoadError, Result};
use crate::inventory::{CatalogUpdater, InventorySource};
use crate::ledger::{ChunkStatus, ChunkTally, LedgerEntry, ProgressLedger, SUPERSEDED_MESSAGE};
use crate::status::{RegionRecord, RegionStatus, StatusStore};
use crate::store::{ChunkBatch, DestinationStore, IntegritySnapshot};

#[derive(Debug, Clone)]
struct StoredRow {
    wkt: String,
    srid: i32,
}

#[derive(Default)]
struct StoreState {
    rows: BTreeMap<(String, u32), Vec<StoredRow>>,
    failing: HashSet<(String, u32)>,
    count_skew: HashMap<String, i64>,
    inserts: Vec<(String, u32)>,
}

/// Destination store held in memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every insert of (region, chunk) fail until cleared
    pub async fn fail_chunk(&self, region: &str, chunk: u32) {
        self.state
            .lock()
            .await
            .failing
            .insert((region.to_string(), chunk));
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failing.clear();
    }

    /// Offset the counts reported for `region`, as if rows appeared or vanished
    pub async fn skew_count(&self, region: &str, delta: i64) {
        self.state
            .lock()
            .await
            .count_skew
            .insert(region.to_string(), delta);
    }

    /// Every successful chunk insert, in order
    pub async fn insert_log(&self) -> Vec<(String, u32)> {
        self.state.lock().await.inserts.clone()
    }

    /// Chunk numbers currently holding rows for `region`
    pub async fn chunks_present(&self, region: &str) -> BTreeSet<u32> {
        self.state
            .lock()
            .await
            .rows
            .keys()
            .filter(|(r, _)| r == region)
            .map(|(_, chunk)| *chunk)
            .collect()
    }
}

fn skewed(count: u64, skew: Option<&i64>) -> u64 {
    match skew {
        Some(delta) => (count as i64 + delta).max(0) as u64,
        None => count,
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn replace_chunk(&self, batch: &ChunkBatch) -> Result<u64> {
        let mut state = self.state.lock().await;
        let key = (batch.region.clone(), batch.chunk_number);

        if state.failing.contains(&key) {
            return Err(LoadError::Database(sqlx::Error::Protocol(format!(
                "injected failure for {} chunk {}",
                batch.region, batch.chunk_number
            ))));
        }

        let rows: Vec<StoredRow> = batch
            .rows
            .iter()
            .map(|r| StoredRow {
                wkt: r.wkt.clone(),
                srid: batch.srid,
            })
            .collect();
        let inserted = rows.len() as u64;
        state.rows.insert(key.clone(), rows);
        state.inserts.push(key);
        Ok(inserted)
    }

    async fn count_region(&self, region: &str) -> Result<u64> {
        let state = self.state.lock().await;
        let count = state
            .rows
            .iter()
            .filter(|((r, _), _)| r == region)
            .map(|(_, rows)| rows.len() as u64)
            .sum();
        Ok(skewed(count, state.count_skew.get(region)))
    }

    async fn count_by_region(&self) -> Result<BTreeMap<String, u64>> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for ((region, _), rows) in &state.rows {
            *counts.entry(region.clone()).or_default() += rows.len() as u64;
        }
        for (region, count) in counts.iter_mut() {
            *count = skewed(*count, state.count_skew.get(region));
        }
        Ok(counts)
    }

    async fn delete_region(&self, region: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let keys: Vec<(String, u32)> = state
            .rows
            .keys()
            .filter(|(r, _)| r == region)
            .cloned()
            .collect();
        let mut removed = 0u64;
        for key in keys {
            if let Some(rows) = state.rows.remove(&key) {
                removed += rows.len() as u64;
            }
        }
        Ok(removed)
    }

    async fn integrity_snapshot(&self) -> Result<IntegritySnapshot> {
        let state = self.state.lock().await;
        let mut snapshot = IntegritySnapshot::default();
        let mut srids = BTreeSet::new();
        let mut types = BTreeSet::new();

        for ((region, _), rows) in &state.rows {
            for row in rows {
                snapshot.total_rows += 1;
                if region.is_empty() {
                    snapshot.empty_region_labels += 1;
                }
                srids.insert(row.srid);

                let parsed = wkt::Wkt::<f64>::from_str(&row.wkt)
                    .ok()
                    .and_then(|w| Geometry::<f64>::try_from(w).ok());
                match parsed {
                    Some(geometry) => {
                        if !geometry.is_valid() {
                            snapshot.invalid_geometries += 1;
                        }
                    }
                    None => snapshot.null_geometries += 1,
                }
                if let Some(kind) = row.wkt.split('(').next() {
                    types.insert(kind.trim().to_uppercase());
                }
            }
        }

        snapshot.srids = srids.into_iter().collect();
        snapshot.geometry_types = types.into_iter().collect();
        Ok(snapshot)
    }
}

/// Progress ledger held in memory
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn close(&self, region: &str, chunk: u32, status: ChunkStatus, error: Option<&str>) {
        let mut entries = self.entries.lock().await;
        let open = entries.iter_mut().rev().find(|e| {
            e.region == region && e.chunk_number == chunk && e.status == ChunkStatus::Loading
        });
        match open {
            Some(entry) => {
                entry.status = status;
                entry.error_message = error.map(str::to_string);
                entry.completed_at = Some(Utc::now());
            }
            None => warn!(region, chunk, %status, "No open ledger attempt to close"),
        }
    }
}

#[async_trait]
impl ProgressLedger for MemoryLedger {
    async fn begin(&self, region: &str, chunk: u32, features: u64) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        for stale in entries.iter_mut().filter(|e| {
            e.region == region && e.chunk_number == chunk && e.status == ChunkStatus::Loading
        }) {
            warn!(region, chunk, started_at = %stale.started_at, "Superseding stale loading attempt");
            stale.status = ChunkStatus::Failed;
            stale.error_message = Some(SUPERSEDED_MESSAGE.to_string());
            stale.completed_at = Some(now);
        }

        entries.push(LedgerEntry {
            region: region.to_string(),
            chunk_number: chunk,
            features_in_chunk: features,
            status: ChunkStatus::Loading,
            error_message: None,
            started_at: now,
            completed_at: None,
        });
        Ok(())
    }

    async fn complete(&self, region: &str, chunk: u32) -> Result<()> {
        self.close(region, chunk, ChunkStatus::Completed, None).await;
        Ok(())
    }

    async fn fail(&self, region: &str, chunk: u32, error: &str) -> Result<()> {
        self.close(region, chunk, ChunkStatus::Failed, Some(error)).await;
        Ok(())
    }

    async fn completed_chunks(&self, region: &str) -> Result<BTreeSet<u32>> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| e.region == region && e.status == ChunkStatus::Completed)
            .map(|e| e.chunk_number)
            .collect())
    }

    async fn entries(&self, region: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| e.region == region)
            .cloned()
            .collect())
    }

    async fn tallies(&self) -> Result<BTreeMap<String, ChunkTally>> {
        let mut tallies: BTreeMap<String, ChunkTally> = BTreeMap::new();
        for entry in self.entries.lock().await.iter() {
            let tally = tallies.entry(entry.region.clone()).or_default();
            match entry.status {
                ChunkStatus::Completed => tally.completed += 1,
                ChunkStatus::Failed => tally.failed += 1,
                ChunkStatus::Loading => {}
            }
        }
        Ok(tallies)
    }

    async fn clear_region(&self, region: &str) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.region != region);
        Ok((before - entries.len()) as u64)
    }
}

/// Status store held in memory, remembering every status written
#[derive(Default)]
pub struct MemoryStatusStore {
    records: Mutex<BTreeMap<String, RegionRecord>>,
    history: Mutex<Vec<(String, RegionStatus)>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses persisted for `region`, oldest first
    pub async fn history(&self, region: &str) -> Vec<RegionStatus> {
        self.history
            .lock()
            .await
            .iter()
            .filter(|(r, _)| r == region)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn read_all(&self) -> Result<BTreeMap<String, RegionRecord>> {
        Ok(self.records.lock().await.clone())
    }

    async fn put(&self, record: &RegionRecord) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(record.region.clone(), record.clone());
        self.history
            .lock()
            .await
            .push((record.region.clone(), record.status));
        Ok(())
    }
}

/// Inventory and catalog held in memory
#[derive(Default)]
pub struct MemoryInventory {
    expected: Mutex<BTreeMap<String, u64>>,
    upserts: Mutex<Vec<(String, u64, u64)>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_expected(&self, region: &str, count: u64) {
        self.expected
            .lock()
            .await
            .insert(region.to_string(), count);
    }

    /// (region, total_features, size_bytes) of every catalog upsert
    pub async fn upserts(&self) -> Vec<(String, u64, u64)> {
        self.upserts.lock().await.clone()
    }
}

#[async_trait]
impl InventorySource for MemoryInventory {
    async fn expected_counts(&self) -> Result<BTreeMap<String, u64>> {
        Ok(self.expected.lock().await.clone())
    }
}

#[async_trait]
impl CatalogUpdater for MemoryInventory {
    async fn upsert(&self, region: &str, total_features: u64, size_bytes: u64) -> Result<()> {
        self.expected
            .lock()
            .await
            .insert(region.to_string(), total_features);
        self.upserts
            .lock()
            .await
            .push((region.to_string(), total_features, size_bytes));
        info!(region, features = total_features, "Catalog updated");
        Ok(())
    }
}
