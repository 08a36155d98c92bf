//! Drives regions through their lifecycle
//!
//! A full pass is `cleaning → fetching → chunking → uploading → validating →
//! completed`, persisting the region record after every transition. Regions
//! already `completed` are skipped; every other region is redone from
//! `cleaning`. The resume path skips cleanup, reuses the manifest on disk
//! and loads only chunks the ledger does not show as completed.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::chunker::ChunkBuilder;
use crate::config::{ChunkFailurePolicy, GeometryPolicy, LoaderConfig, DEFAULT_SRID};
use crate::error::{LoadError, Result};
use crate::fetch::{SourceFetcher, SourceHandle};
use crate::inventory::CatalogUpdater;
use crate::ledger::ProgressLedger;
use crate::loader::{ChunkLoader, UploadSummary};
use crate::manifest::Manifest;
use crate::status::{RegionRecord, RegionStatus, StatusStore};
use crate::store::DestinationStore;

/// External capabilities the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub status: Arc<dyn StatusStore>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub store: Arc<dyn DestinationStore>,
    pub ledger: Arc<dyn ProgressLedger>,
    pub catalog: Arc<dyn CatalogUpdater>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chunks_dir: PathBuf,
    pub chunk_size: usize,
    pub srid: i32,
    pub geometry_policy: GeometryPolicy,
    pub chunk_failure_policy: ChunkFailurePolicy,
    pub region_concurrency: usize,
}

impl PipelineSettings {
    pub fn new(chunks_dir: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            chunks_dir: chunks_dir.into(),
            chunk_size,
            srid: DEFAULT_SRID,
            geometry_policy: GeometryPolicy::default(),
            chunk_failure_policy: ChunkFailurePolicy::default(),
            region_concurrency: 1,
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            chunks_dir: config.chunks_dir.clone(),
            chunk_size: config.chunk_size,
            srid: config.srid,
            geometry_policy: config.geometry_policy,
            chunk_failure_policy: config.chunk_failure_policy,
            region_concurrency: config.region_concurrency.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Clean and redo every region that has not completed
    Full,
    /// Continue from the manifest and ledger without cleanup
    Resume,
}

/// What a run would do
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunPlan {
    /// Regions already completed; skipped
    pub completed: Vec<String>,
    /// Regions to process with their current status
    pub pending: Vec<(String, RegionStatus)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionOutcome {
    pub region: String,
    pub status: RegionStatus,
    pub elapsed_secs: f64,
    pub total_features: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub outcomes: Vec<RegionOutcome>,
    pub skipped: Vec<String>,
    pub elapsed_secs: f64,
    /// Target regions completed after the run
    pub completed_regions: usize,
    pub target_regions: usize,
}

impl RunSummary {
    pub fn failed(&self) -> impl Iterator<Item = &RegionOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status != RegionStatus::Completed)
    }

    pub fn all_completed(&self) -> bool {
        self.completed_regions == self.target_regions
    }
}

pub struct RegionOrchestrator {
    collaborators: Collaborators,
    settings: PipelineSettings,
    builder: Arc<ChunkBuilder>,
    loader: ChunkLoader,
}

impl RegionOrchestrator {
    pub fn new(collaborators: Collaborators, settings: PipelineSettings) -> Self {
        let builder = Arc::new(ChunkBuilder::new(settings.chunks_dir.clone()));
        let loader = ChunkLoader::new(
            collaborators.store.clone(),
            collaborators.ledger.clone(),
            settings.chunks_dir.clone(),
        )
        .with_srid(settings.srid)
        .with_geometry_policy(settings.geometry_policy);

        Self {
            collaborators,
            settings,
            builder,
            loader,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Split `regions` into completed and pending without changing anything
    pub async fn plan(&self, regions: &[String]) -> Result<RunPlan> {
        let records = self.collaborators.status.read_all().await?;
        let mut plan = RunPlan {
            completed: Vec::new(),
            pending: Vec::new(),
        };

        for region in dedup(regions) {
            match records.get(&region).map(|r| r.status) {
                Some(RegionStatus::Completed) => plan.completed.push(region),
                Some(status) => plan.pending.push((region, status)),
                None => plan.pending.push((region, RegionStatus::New)),
            }
        }
        Ok(plan)
    }

    /// Process every pending region of `regions`
    ///
    /// Per-region failures are recorded in the status store and in the
    /// summary; only failures of the status store itself abort the run.
    pub async fn run(&self, regions: &[String], mode: RunMode) -> Result<RunSummary> {
        let started = Instant::now();
        let plan = self.plan(regions).await?;
        let target_regions = plan.completed.len() + plan.pending.len();

        info!(
            targets = target_regions,
            completed = plan.completed.len(),
            pending = plan.pending.len(),
            concurrency = self.settings.region_concurrency,
            ?mode,
            "Pipeline run starting"
        );
        if !plan.completed.is_empty() {
            info!(regions = %plan.completed.join(", "), "Skipping completed regions");
        }

        let total = plan.pending.len();
        let outcomes: Vec<RegionOutcome> = stream::iter(plan.pending.into_iter().enumerate())
            .map(|(index, (region, _))| async move {
                info!(region = %region, position = index + 1, total, "Processing region");
                self.run_one(region, mode).await
            })
            .buffered(self.settings.region_concurrency.max(1))
            .collect()
            .await;

        let records = self.collaborators.status.read_all().await?;
        let completed_regions = dedup(regions)
            .iter()
            .filter(|r| {
                records
                    .get(r.as_str())
                    .is_some_and(|rec| rec.status == RegionStatus::Completed)
            })
            .count();

        let summary = RunSummary {
            outcomes,
            skipped: plan.completed,
            elapsed_secs: started.elapsed().as_secs_f64(),
            completed_regions,
            target_regions,
        };

        info!(
            elapsed_secs = summary.elapsed_secs,
            completed = summary.completed_regions,
            targets = summary.target_regions,
            "Pipeline run finished"
        );
        if !summary.all_completed() {
            info!(
                remaining = summary.target_regions - summary.completed_regions,
                "Regions remaining; re-run to continue"
            );
        }
        Ok(summary)
    }

    async fn run_one(&self, region: String, mode: RunMode) -> RegionOutcome {
        let started = Instant::now();
        let result = match mode {
            RunMode::Full => self.process_region(&region).await,
            RunMode::Resume => self.resume_region(&region).await,
        };
        let elapsed_secs = started.elapsed().as_secs_f64();

        match result {
            Ok(record) => {
                info!(region = %region, elapsed_secs, "Region completed");
                RegionOutcome {
                    region,
                    status: record.status,
                    elapsed_secs,
                    total_features: record.total_features,
                    error: None,
                }
            }
            Err(e) => {
                error!(region = %region, elapsed_secs, error = %e, "Region failed");
                RegionOutcome {
                    region,
                    status: RegionStatus::Failed,
                    elapsed_secs,
                    total_features: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn current_record(&self, region: &str) -> Result<RegionRecord> {
        Ok(self
            .collaborators
            .status
            .get(region)
            .await?
            .unwrap_or_else(|| RegionRecord::new(region)))
    }

    /// Full redo of one region unless it already completed
    pub async fn process_region(&self, region: &str) -> Result<RegionRecord> {
        let mut record = self.current_record(region).await?;
        if record.status == RegionStatus::Completed {
            info!(region, "Region already completed, skipping");
            return Ok(record);
        }

        match self.drive_full(&mut record).await {
            Ok(()) => Ok(record),
            Err(e) => {
                self.mark_failed(&mut record, &e).await;
                Err(e)
            }
        }
    }

    /// Continue a region from its manifest and ledger without cleanup
    pub async fn resume_region(&self, region: &str) -> Result<RegionRecord> {
        let mut record = self.current_record(region).await?;
        if record.status == RegionStatus::Completed {
            info!(region, "Region already completed, skipping");
            return Ok(record);
        }

        match self.drive_resume(&mut record).await {
            Ok(()) => Ok(record),
            Err(e) => {
                self.mark_failed(&mut record, &e).await;
                Err(e)
            }
        }
    }

    async fn enter(&self, record: &mut RegionRecord, next: RegionStatus) -> Result<()> {
        record.transition(next)?;
        self.collaborators.status.put(record).await
    }

    async fn mark_failed(&self, record: &mut RegionRecord, cause: &LoadError) {
        if let Err(e) = record.record_failure(cause.to_string()) {
            warn!(region = %record.region, error = %e, "Cannot record failure");
            return;
        }
        if let Err(e) = self.collaborators.status.put(record).await {
            error!(region = %record.region, error = %e, "Failed to persist region failure");
        }
    }

    async fn drive_full(&self, record: &mut RegionRecord) -> Result<()> {
        let region = record.region.clone();

        info!(region = %region, step = "1/6", "Cleaning previous load");
        self.enter(record, RegionStatus::Cleaning).await?;
        let rows = self.collaborators.store.delete_region(&region).await?;
        let attempts = self.collaborators.ledger.clear_region(&region).await?;
        if rows > 0 || attempts > 0 {
            info!(region = %region, rows, ledger_rows = attempts, "Cleaned store and ledger");
        }

        info!(region = %region, step = "2/6", "Fetching source");
        self.enter(record, RegionStatus::Fetching).await?;
        let handle = self.collaborators.fetcher.fetch(&region).await?;
        record.source_size_bytes = Some(handle.size_bytes);

        info!(region = %region, step = "3/6", "Creating chunks");
        self.enter(record, RegionStatus::Chunking).await?;
        let manifest = self.build_chunks(&handle).await?;
        record.total_features = Some(manifest.total_features);
        record.total_chunks = Some(manifest.total_chunks);

        if manifest.total_features == 0 {
            warn!(region = %region, "No features found, marking completed");
            return self.finish(record, &manifest, Some(handle)).await;
        }

        info!(region = %region, step = "4/6", chunks = manifest.total_chunks, "Uploading chunks");
        self.enter(record, RegionStatus::Uploading).await?;
        self.upload(&manifest).await?;

        info!(region = %region, step = "5/6", "Validating");
        self.enter(record, RegionStatus::Validating).await?;
        self.validate(record, &manifest).await?;

        info!(region = %region, step = "6/6", "Updating catalog and releasing source");
        self.finish(record, &manifest, Some(handle)).await
    }

    async fn drive_resume(&self, record: &mut RegionRecord) -> Result<()> {
        let region = record.region.clone();
        let manifest = Manifest::load(&self.settings.chunks_dir, &region)?;
        record.total_features = Some(manifest.total_features);
        record.total_chunks = Some(manifest.total_chunks);

        info!(region = %region, chunks = manifest.total_chunks, "Resuming upload");
        self.enter(record, RegionStatus::Uploading).await?;
        self.upload(&manifest).await?;

        self.enter(record, RegionStatus::Validating).await?;
        self.validate(record, &manifest).await?;

        let handle = self.collaborators.fetcher.locate(&region).await?;
        if let Some(handle) = &handle {
            record.source_size_bytes = Some(handle.size_bytes);
        }
        self.finish(record, &manifest, handle).await
    }

    async fn build_chunks(&self, handle: &SourceHandle) -> Result<Manifest> {
        let builder = self.builder.clone();
        let source = handle.path.clone();
        let region = handle.region.clone();
        let chunk_size = self.settings.chunk_size;

        // a previous chunking pass may have been interrupted: always rebuild
        tokio::task::spawn_blocking(move || builder.build(&source, &region, chunk_size, true))
            .await?
    }

    /// Load every chunk the ledger does not already show as completed
    async fn upload(&self, manifest: &Manifest) -> Result<UploadSummary> {
        let completed = self
            .collaborators
            .ledger
            .completed_chunks(&manifest.region)
            .await?;

        let summary = self
            .loader
            .load_manifest(manifest, &completed, self.settings.chunk_failure_policy)
            .await?;

        if !summary.is_complete() {
            warn!(
                region = %manifest.region,
                failed = summary.failed.len(),
                "Some chunks failed; validation will report the shortfall"
            );
        }
        info!(
            region = %manifest.region,
            loaded = summary.loaded.len(),
            skipped = summary.skipped.len(),
            features = summary.features_loaded,
            "Upload stage finished"
        );
        Ok(summary)
    }

    async fn validate(&self, record: &mut RegionRecord, manifest: &Manifest) -> Result<()> {
        let observed = self
            .collaborators
            .store
            .count_region(&manifest.region)
            .await?;
        let expected = manifest.total_features;

        if observed != expected {
            let missing = expected as i64 - observed as i64;
            record.discrepancy = Some(missing);
            return Err(LoadError::CountMismatch {
                region: manifest.region.clone(),
                expected,
                observed,
                missing,
            });
        }

        info!(region = %manifest.region, features = observed, "Store count matches manifest");
        Ok(())
    }

    async fn finish(
        &self,
        record: &mut RegionRecord,
        manifest: &Manifest,
        handle: Option<SourceHandle>,
    ) -> Result<()> {
        let size_bytes = record
            .source_size_bytes
            .unwrap_or_else(|| manifest.total_size_bytes());
        self.collaborators
            .catalog
            .upsert(&record.region, manifest.total_features, size_bytes)
            .await?;

        if let Some(handle) = handle {
            match self.collaborators.fetcher.release(&handle).await {
                Ok(freed) if freed > 0 => info!(region = %record.region, freed_bytes = freed, "Source released"),
                Ok(_) => {}
                Err(e) => warn!(region = %record.region, error = %e, "Failed to release source"),
            }
        }

        self.enter(record, RegionStatus::Completed).await
    }
}

/// Region names in first-seen order without repeats
fn dedup(regions: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    regions
        .iter()
        .filter(|r| seen.insert(r.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let regions: Vec<String> = ["Ohio", "Texas", "Ohio", "Utah"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(dedup(&regions), vec!["Ohio", "Texas", "Utah"]);
    }

    #[test]
    fn test_settings_from_config() {
        let config = LoaderConfig {
            chunk_size: 10,
            region_concurrency: 0,
            ..LoaderConfig::default()
        };
        let settings = PipelineSettings::from_config(&config);
        assert_eq!(settings.chunk_size, 10);
        assert_eq!(settings.region_concurrency, 1);
        assert_eq!(settings.srid, 4326);
    }
}
