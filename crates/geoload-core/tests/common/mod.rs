//! Shared fixtures for the pipeline integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use geoload_core::config::{ChunkFailurePolicy, GeometryPolicy};
use geoload_core::fetch::LocalDirFetcher;
use geoload_core::memory::{MemoryInventory, MemoryLedger, MemoryStatusStore, MemoryStore};
use geoload_core::{Collaborators, PipelineSettings, RegionOrchestrator};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A closed unit square offset along the x axis
pub fn square(index: usize) -> Value {
    let x = index as f64 * 2.0;
    json!({
        "type": "Polygon",
        "coordinates": [[[x, 0.0], [x + 1.0, 0.0], [x + 1.0, 1.0], [x, 1.0], [x, 0.0]]]
    })
}

/// Self-intersecting ring: invalid and zero area
pub fn bow_tie() -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[[0.0, 0.0], [1.0, 1.0], [1.0, 0.0], [0.0, 1.0], [0.0, 0.0]]]
    })
}

pub fn feature(geometry: Value, index: usize) -> Value {
    json!({
        "type": "Feature",
        "geometry": geometry,
        "properties": { "release": 2, "capture_dates_range": "", "idx": index }
    })
}

/// Write `{region}.geojson` holding `features` into `dir`
pub fn write_source(dir: &Path, region: &str, features: Vec<Value>) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(format!("{region}.geojson"));
    let body = json!({ "type": "FeatureCollection", "features": features });
    std::fs::write(&path, serde_json::to_vec(&body).unwrap()).unwrap();
    path
}

pub fn write_squares(dir: &Path, region: &str, count: usize) -> PathBuf {
    let features = (0..count).map(|i| feature(square(i), i)).collect();
    write_source(dir, region, features)
}

pub fn regions(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// A workspace with in-memory collaborators and sources on disk
pub struct Harness {
    pub dir: TempDir,
    pub status: Arc<MemoryStatusStore>,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<MemoryLedger>,
    pub inventory: Arc<MemoryInventory>,
    pub chunk_size: usize,
    pub geometry_policy: GeometryPolicy,
    pub chunk_failure_policy: ChunkFailurePolicy,
    pub region_concurrency: usize,
}

impl Harness {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            status: Arc::new(MemoryStatusStore::new()),
            store: Arc::new(MemoryStore::new()),
            ledger: Arc::new(MemoryLedger::new()),
            inventory: Arc::new(MemoryInventory::new()),
            chunk_size,
            geometry_policy: GeometryPolicy::Permissive,
            chunk_failure_policy: ChunkFailurePolicy::Abort,
            region_concurrency: 1,
        }
    }

    pub fn source_dir(&self) -> PathBuf {
        self.dir.path().join("source")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.dir.path().join("chunks")
    }

    pub fn orchestrator(&self) -> RegionOrchestrator {
        let collaborators = Collaborators {
            status: self.status.clone(),
            fetcher: Arc::new(LocalDirFetcher::new(self.source_dir())),
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            catalog: self.inventory.clone(),
        };
        let mut settings = PipelineSettings::new(self.chunks_dir(), self.chunk_size);
        settings.geometry_policy = self.geometry_policy;
        settings.chunk_failure_policy = self.chunk_failure_policy;
        settings.region_concurrency = self.region_concurrency;
        RegionOrchestrator::new(collaborators, settings)
    }
}
