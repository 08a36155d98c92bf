//! Region lifecycle states and the durable status store
//!
//! A region moves `new → cleaning → fetching → chunking → uploading →
//! validating → completed`; `failed` is reachable from every non-terminal
//! state. Persisted status strings outside this closed set are rejected.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;

use crate::error::{LoadError, Result};

/// Lifecycle stage of one region
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RegionStatus {
    New,
    Cleaning,
    Fetching,
    Chunking,
    Uploading,
    Validating,
    Completed,
    Failed,
}

impl RegionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionStatus::New => "new",
            RegionStatus::Cleaning => "cleaning",
            RegionStatus::Fetching => "fetching",
            RegionStatus::Chunking => "chunking",
            RegionStatus::Uploading => "uploading",
            RegionStatus::Validating => "validating",
            RegionStatus::Completed => "completed",
            RegionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RegionStatus::Completed | RegionStatus::Failed)
    }

    /// Whether `self → next` is a legal edge
    ///
    /// `cleaning` is the re-entry point for every region that has not
    /// completed, including one interrupted mid-stage. `uploading` is also
    /// reachable from any unfinished state for the resume path, which skips
    /// cleanup and reuses the manifest already on disk.
    pub fn can_transition_to(&self, next: RegionStatus) -> bool {
        use RegionStatus::*;
        match (*self, next) {
            (Completed, _) => false,
            (_, Cleaning) => true,
            (_, Uploading) => true,
            (Cleaning, Fetching) => true,
            (Fetching, Chunking) => true,
            (Chunking, Completed) => true,
            (Uploading, Validating) => true,
            (Validating, Completed) => true,
            (Failed, Failed) => false,
            (_, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RegionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegionStatus {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(RegionStatus::New),
            "cleaning" => Ok(RegionStatus::Cleaning),
            "fetching" | "downloading" => Ok(RegionStatus::Fetching),
            "chunking" => Ok(RegionStatus::Chunking),
            "uploading" => Ok(RegionStatus::Uploading),
            "validating" => Ok(RegionStatus::Validating),
            "completed" => Ok(RegionStatus::Completed),
            "failed" => Ok(RegionStatus::Failed),
            other => Err(LoadError::UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for RegionStatus {
    type Error = LoadError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RegionStatus> for String {
    fn from(status: RegionStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Structured status of one region, keyed by region name in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub region: String,
    pub status: RegionStatus,
    /// When each stage was entered
    #[serde(default)]
    pub stage_entered_at: BTreeMap<RegionStatus, DateTime<Utc>>,
    #[serde(default)]
    pub total_features: Option<u64>,
    #[serde(default)]
    pub total_chunks: Option<u32>,
    #[serde(default)]
    pub source_size_bytes: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// expected − observed from the last failed reconciliation
    #[serde(default)]
    pub discrepancy: Option<i64>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl RegionRecord {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            status: RegionStatus::New,
            stage_entered_at: BTreeMap::new(),
            total_features: None,
            total_chunks: None,
            source_size_bytes: None,
            last_error: None,
            discrepancy: None,
            updated_at: Utc::now(),
            completed_at: None,
            failed_at: None,
        }
    }

    /// Move to `next`, stamping the stage time
    pub fn transition(&mut self, next: RegionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(LoadError::IllegalTransition {
                region: self.region.clone(),
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        self.stage_entered_at.insert(next, now);

        match next {
            RegionStatus::Cleaning | RegionStatus::Uploading => {
                self.last_error = None;
                self.discrepancy = None;
                self.failed_at = None;
            }
            RegionStatus::Completed => self.completed_at = Some(now),
            RegionStatus::Failed => self.failed_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    /// Enter `failed` with `cause`, or restamp a region that already failed
    ///
    /// A retry can fail again before its first transition, in which case the
    /// record keeps its state but must carry the newest cause.
    pub fn record_failure(&mut self, cause: impl Into<String>) -> Result<()> {
        if self.status == RegionStatus::Failed {
            let now = Utc::now();
            self.updated_at = now;
            self.failed_at = Some(now);
        } else {
            self.transition(RegionStatus::Failed)?;
        }
        self.last_error = Some(cause.into());
        Ok(())
    }
}

/// Durable region name → status map
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn read_all(&self) -> Result<BTreeMap<String, RegionRecord>>;

    /// Atomically overwrite the record for `record.region`
    async fn put(&self, record: &RegionRecord) -> Result<()>;

    async fn get(&self, region: &str) -> Result<Option<RegionRecord>> {
        Ok(self.read_all().await?.remove(region))
    }
}

/// Status store backed by one JSON document on disk
///
/// Every write replaces the whole file through a temp file and a rename so
/// a crash never leaves a half-written document behind.
pub struct JsonFileStatusStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, RegionRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let document: BTreeMap<String, serde_json::Value> = serde_json::from_str(&raw)?;
        let mut records = BTreeMap::new();
        for (region, value) in document {
            // surface an unknown status as such rather than as a generic JSON error
            let status = value
                .get("status")
                .and_then(|s| s.as_str())
                .ok_or_else(|| {
                    LoadError::StatusStore(format!("record for {region} has no status"))
                })?;
            status.parse::<RegionStatus>()?;

            let record: RegionRecord = serde_json::from_value(value)?;
            records.insert(region, record);
        }
        Ok(records)
    }
}

#[async_trait]
impl StatusStore for JsonFileStatusStore {
    async fn read_all(&self) -> Result<BTreeMap<String, RegionRecord>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn put(&self, record: &RegionRecord) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut records = self.load().await?;
        records.insert(record.region.clone(), record.clone());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let body = serde_json::to_vec_pretty(&records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!(region = %record.region, status = %record.status, "Status persisted");
        Ok(())
    }
}
