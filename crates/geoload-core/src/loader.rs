//! Loads chunk files into the destination store under ledger protocol
//!
//! Every attempt opens a `loading` ledger row, and closes it as `completed`
//! after the store confirmed the insert or as `failed` with the error text.
//! A chunk is always loaded whole: the store replaces any rows already
//! tagged with the same (region, chunk) in the same transaction.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use geoload_common::checksum::verify_sha256;

use crate::config::{ChunkFailurePolicy, GeometryPolicy, DEFAULT_SRID};
use crate::error::{LoadError, Result};
use crate::feature::ChunkCollection;
use crate::geometry::{decode_geometry, to_wkt, IntegrityCounts};
use crate::ledger::ProgressLedger;
use crate::manifest::{region_dir, ChunkDescriptor, Manifest};
use crate::store::{ChunkBatch, DestinationStore, FootprintRow};

/// A chunk decoded and checked, ready for insertion
#[derive(Debug)]
pub struct PreparedChunk {
    pub source_file: String,
    pub rows: Vec<FootprintRow>,
    pub integrity: IntegrityCounts,
}

/// Read, verify and decode one chunk file
///
/// Fails when the file is missing, its digest or feature count disagrees
/// with the descriptor, a feature carries foreign chunk metadata, or a
/// geometry cannot be decoded.
pub fn prepare_chunk(path: &Path, chunk: &ChunkDescriptor, region: &str) -> Result<PreparedChunk> {
    if !path.is_file() {
        return Err(LoadError::ChunkFileMissing {
            path: path.to_path_buf(),
        });
    }
    if !chunk.sha256.is_empty() {
        verify_sha256(path, &chunk.sha256)?;
    }

    let collection: ChunkCollection = serde_json::from_slice(&std::fs::read(path)?)?;
    let actual = collection.features.len() as u64;
    if actual != chunk.features {
        return Err(LoadError::ChunkCountMismatch {
            chunk: chunk.chunk_number,
            declared: chunk.features,
            actual,
        });
    }

    let mut source_file = None;
    let mut integrity = IntegrityCounts::default();
    let mut rows = Vec::with_capacity(collection.features.len());

    for (index, feature) in collection.features.iter().enumerate() {
        let props = &feature.properties;
        if props.region != region || props.chunk_number != chunk.chunk_number {
            return Err(LoadError::ManifestInconsistent {
                region: region.to_string(),
                message: format!(
                    "feature {index} of {} is tagged {}/{}",
                    chunk.filename, props.region, props.chunk_number
                ),
            });
        }
        if source_file.is_none() {
            source_file = Some(props.source_file.clone());
        }

        let geometry = decode_geometry(index, feature.geometry.as_ref())?;
        integrity.observe(&geometry);
        rows.push(FootprintRow {
            wkt: to_wkt(&geometry),
        });
    }

    Ok(PreparedChunk {
        source_file: source_file.unwrap_or_else(|| format!("{region}.geojson")),
        rows,
        integrity,
    })
}

/// Outcome of loading a manifest's chunks
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadSummary {
    pub loaded: Vec<u32>,
    pub skipped: Vec<u32>,
    /// Chunk number and error text, only under [`ChunkFailurePolicy::Continue`]
    pub failed: Vec<(u32, String)>,
    pub features_loaded: u64,
}

impl UploadSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ChunkLoader {
    store: Arc<dyn DestinationStore>,
    ledger: Arc<dyn ProgressLedger>,
    chunks_dir: PathBuf,
    srid: i32,
    geometry_policy: GeometryPolicy,
}

impl ChunkLoader {
    pub fn new(
        store: Arc<dyn DestinationStore>,
        ledger: Arc<dyn ProgressLedger>,
        chunks_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            ledger,
            chunks_dir: chunks_dir.into(),
            srid: DEFAULT_SRID,
            geometry_policy: GeometryPolicy::default(),
        }
    }

    pub fn with_srid(mut self, srid: i32) -> Self {
        self.srid = srid;
        self
    }

    pub fn with_geometry_policy(mut self, policy: GeometryPolicy) -> Self {
        self.geometry_policy = policy;
        self
    }

    pub fn chunks_dir(&self) -> &Path {
        &self.chunks_dir
    }

    /// Load one chunk of `region`; returns the number of rows inserted
    pub async fn load(&self, chunk: &ChunkDescriptor, region: &str) -> Result<u64> {
        let number = chunk.chunk_number;
        let wrap = |source: LoadError| LoadError::ChunkLoad {
            region: region.to_string(),
            chunk: number,
            source: Box::new(source),
        };

        self.ledger
            .begin(region, number, chunk.features)
            .await
            .map_err(wrap)?;

        match self.load_attempt(chunk, region).await {
            Ok(inserted) => {
                self.ledger.complete(region, number).await.map_err(wrap)?;
                Ok(inserted)
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(ledger_err) = self.ledger.fail(region, number, &message).await {
                    warn!(region, chunk = number, error = %ledger_err, "Failed to record chunk failure");
                }
                error!(region, chunk = number, error = %message, "Chunk load failed");
                Err(wrap(e))
            }
        }
    }

    async fn load_attempt(&self, chunk: &ChunkDescriptor, region: &str) -> Result<u64> {
        let started = Instant::now();
        let path = region_dir(&self.chunks_dir, region).join(&chunk.filename);

        let prepared = {
            let chunk = chunk.clone();
            let region = region.to_string();
            tokio::task::spawn_blocking(move || prepare_chunk(&path, &chunk, &region)).await??
        };

        let counts = prepared.integrity;
        if counts.invalid > 0 {
            warn!(region, chunk = chunk.chunk_number, count = counts.invalid, "Invalid geometries found");
        }
        if counts.non_polygon > 0 {
            warn!(region, chunk = chunk.chunk_number, count = counts.non_polygon, "Non-polygon geometries found");
        }
        if counts.bad_area > 0 {
            warn!(region, chunk = chunk.chunk_number, count = counts.bad_area, "Zero/null-area geometries found");
        }
        if self.geometry_policy == GeometryPolicy::Strict && !counts.is_clean() {
            return Err(LoadError::GeometryRejected {
                chunk: chunk.chunk_number,
                invalid: counts.invalid,
                non_polygon: counts.non_polygon,
                bad_area: counts.bad_area,
            });
        }

        let batch = ChunkBatch {
            region: region.to_string(),
            source_file: prepared.source_file,
            chunk_number: chunk.chunk_number,
            srid: self.srid,
            rows: prepared.rows,
        };
        let inserted = self.store.replace_chunk(&batch).await?;
        if inserted != chunk.features {
            return Err(LoadError::ChunkCountMismatch {
                chunk: chunk.chunk_number,
                declared: chunk.features,
                actual: inserted,
            });
        }

        let elapsed = started.elapsed();
        info!(
            region,
            chunk = chunk.chunk_number,
            features = inserted,
            elapsed_ms = elapsed.as_millis() as u64,
            features_per_sec = (inserted as f64 / elapsed.as_secs_f64().max(0.1)).round() as u64,
            "Chunk loaded"
        );
        Ok(inserted)
    }

    /// Load the chunks of `manifest` in ascending order, skipping `skip`
    pub async fn load_manifest(
        &self,
        manifest: &Manifest,
        skip: &BTreeSet<u32>,
        policy: ChunkFailurePolicy,
    ) -> Result<UploadSummary> {
        let region = manifest.region.as_str();
        let mut summary = UploadSummary::default();

        let mut chunks: Vec<&ChunkDescriptor> = manifest.chunks.iter().collect();
        chunks.sort_by_key(|c| c.chunk_number);

        for chunk in chunks {
            if skip.contains(&chunk.chunk_number) {
                info!(
                    region,
                    chunk = chunk.chunk_number,
                    total = manifest.total_chunks,
                    "Chunk skipped (already completed)"
                );
                summary.skipped.push(chunk.chunk_number);
                continue;
            }

            info!(
                region,
                chunk = chunk.chunk_number,
                total = manifest.total_chunks,
                features = chunk.features,
                "Loading chunk"
            );
            match self.load(chunk, region).await {
                Ok(inserted) => {
                    summary.loaded.push(chunk.chunk_number);
                    summary.features_loaded += inserted;
                }
                Err(e) => match policy {
                    ChunkFailurePolicy::Abort => return Err(e),
                    ChunkFailurePolicy::Continue => {
                        warn!(region, chunk = chunk.chunk_number, "Continuing past failed chunk");
                        summary.failed.push((chunk.chunk_number, e.to_string()));
                    }
                },
            }
        }
        Ok(summary)
    }

    /// Load a region's chunks, skipping ledger-completed ones when resuming
    pub async fn upload(
        &self,
        manifest: &Manifest,
        resume: bool,
        policy: ChunkFailurePolicy,
    ) -> Result<UploadSummary> {
        let skip = if resume {
            let completed = self.ledger.completed_chunks(&manifest.region).await?;
            if !completed.is_empty() {
                info!(
                    region = %manifest.region,
                    completed = completed.len(),
                    "Resuming; chunks already completed"
                );
            }
            completed
        } else {
            BTreeSet::new()
        };
        self.load_manifest(manifest, &skip, policy).await
    }
}
