//! Splits a source collection into fixed-size chunk files plus a manifest
//!
//! A build writes everything into a staging directory next to the region
//! directory and swaps it in with renames once the manifest is on disk, so a
//! reader never sees a manifest that disagrees with the chunk files.

use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use geoload_common::checksum::sha256_bytes;

use crate::error::{LoadError, Result};
use crate::feature::{ChunkCollection, ChunkFeature, ChunkProperties};
use crate::manifest::{chunk_filename, region_dir, ChunkDescriptor, Manifest};
use crate::stream::{count_features, FeatureStreamReader};

/// Number of chunks needed for `total` features
pub fn chunk_count(total: u64, chunk_size: usize) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    total.div_ceil(chunk_size as u64) as u32
}

pub struct ChunkBuilder {
    chunks_dir: PathBuf,
}

impl ChunkBuilder {
    pub fn new(chunks_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunks_dir: chunks_dir.into(),
        }
    }

    pub fn chunks_dir(&self) -> &Path {
        &self.chunks_dir
    }

    /// Stream the source once and count its features
    pub fn count(&self, source: &Path) -> Result<u64> {
        count_features(source)
    }

    /// Chunk `source` for `region`
    ///
    /// With `overwrite == false` an existing manifest is returned untouched.
    pub fn build(
        &self,
        source: &Path,
        region: &str,
        chunk_size: usize,
        overwrite: bool,
    ) -> Result<Manifest> {
        if chunk_size == 0 {
            return Err(LoadError::Config("chunk size must be at least 1".into()));
        }

        if !overwrite && Manifest::exists(&self.chunks_dir, region) {
            let existing = Manifest::load(&self.chunks_dir, region)?;
            info!(
                region,
                chunks = existing.total_chunks,
                features = existing.total_features,
                "Chunks already exist, skipping (use overwrite to recreate)"
            );
            return Ok(existing);
        }

        std::fs::create_dir_all(&self.chunks_dir)?;
        self.sweep_leftovers(region)?;
        let staging = self
            .chunks_dir
            .join(format!(".{region}.staging-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&staging)?;

        let manifest = match self.write_staging(source, region, chunk_size, &staging) {
            Ok(manifest) => manifest,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                    warn!(region, error = %cleanup, "Failed to remove staging directory");
                }
                return Err(e);
            }
        };

        self.swap_in(region, &staging)?;

        info!(
            region,
            features = manifest.total_features,
            chunks = manifest.total_chunks,
            elapsed_secs = manifest.created_in_seconds,
            "Chunking complete"
        );
        Ok(manifest)
    }

    fn write_staging(
        &self,
        source: &Path,
        region: &str,
        chunk_size: usize,
        staging: &Path,
    ) -> Result<Manifest> {
        let started = Instant::now();
        let source_file = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{region}.geojson"));

        let counted = self.count(source)?;
        let expected_chunks = chunk_count(counted, chunk_size);
        info!(
            region,
            features = counted,
            chunks = expected_chunks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Counted source features"
        );
        if counted == 0 {
            warn!(region, "No features found in source");
        }

        let mut chunks = Vec::with_capacity(expected_chunks as usize);
        let mut batch: Vec<ChunkFeature> = Vec::with_capacity(chunk_size.min(counted as usize));
        let mut written = 0u64;

        for feature in FeatureStreamReader::open(source)? {
            let chunk_number = chunks.len() as u32 + 1;
            batch.push(ChunkFeature::enrich(
                feature?,
                ChunkProperties {
                    region: region.to_string(),
                    source_file: source_file.clone(),
                    chunk_number,
                },
            ));

            if batch.len() == chunk_size {
                written += batch.len() as u64;
                let full = std::mem::replace(&mut batch, Vec::with_capacity(chunk_size));
                chunks.push(write_chunk(staging, chunk_number, full)?);
                debug!(region, chunk = chunk_number, total = expected_chunks, "Chunk written");
            }
        }
        if !batch.is_empty() {
            let chunk_number = chunks.len() as u32 + 1;
            written += batch.len() as u64;
            chunks.push(write_chunk(staging, chunk_number, batch)?);
        }

        // the source changed between the two passes
        if written != counted {
            return Err(LoadError::ManifestInconsistent {
                region: region.to_string(),
                message: format!("counted {counted} features but chunked {written}"),
            });
        }

        let manifest = Manifest {
            region: region.to_string(),
            source_file,
            total_features: written,
            total_chunks: chunks.len() as u32,
            chunk_size,
            created_in_seconds: (started.elapsed().as_secs_f64() * 10.0).round() / 10.0,
            chunks,
        };
        manifest.validate()?;
        manifest.write_to(staging)?;
        Ok(manifest)
    }

    /// Remove staging and retired directories an interrupted build left behind
    ///
    /// Regions are built by one task at a time, so anything matching the
    /// region's prefixes here belongs to a dead run.
    fn sweep_leftovers(&self, region: &str) -> Result<usize> {
        let staging_prefix = format!(".{region}.staging-");
        let retired_prefix = format!(".{region}.old-");
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.chunks_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&staging_prefix) || name.starts_with(&retired_prefix) {
                std::fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(region, removed, "Removed leftovers of an interrupted chunking run");
        }
        Ok(removed)
    }

    /// Replace the region directory with the staged one
    fn swap_in(&self, region: &str, staging: &Path) -> Result<()> {
        let target = region_dir(&self.chunks_dir, region);
        let retired = if target.exists() {
            let retired = self
                .chunks_dir
                .join(format!(".{region}.old-{}", Uuid::new_v4()));
            std::fs::rename(&target, &retired)?;
            Some(retired)
        } else {
            None
        };

        if let Err(e) = std::fs::rename(staging, &target) {
            // put the previous chunk set back
            if let Some(retired) = &retired {
                if let Err(restore) = std::fs::rename(retired, &target) {
                    warn!(region, error = %restore, "Failed to restore previous chunks");
                }
            }
            return Err(e.into());
        }

        if let Some(retired) = retired {
            if let Err(e) = std::fs::remove_dir_all(&retired) {
                warn!(region, path = %retired.display(), error = %e, "Failed to remove old chunks");
            }
        }
        Ok(())
    }
}

fn write_chunk(dir: &Path, chunk_number: u32, features: Vec<ChunkFeature>) -> Result<ChunkDescriptor> {
    let count = features.len() as u64;
    let body = serde_json::to_vec(&ChunkCollection::new(features))?;
    let filename = chunk_filename(chunk_number);
    std::fs::write(dir.join(&filename), &body)?;

    Ok(ChunkDescriptor {
        chunk_number,
        filename,
        features: count,
        size_bytes: body.len() as u64,
        sha256: sha256_bytes(&body),
    })
}
