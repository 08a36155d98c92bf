//! Per-chunk load ledger
//!
//! One row per load attempt of a (region, chunk). At most one row per pair
//! may be `loading`; a new attempt supersedes a stale one left behind by an
//! interrupted run. Only `completed` rows drive resume decisions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{LoadError, Result};

/// Error text recorded on a `loading` row replaced by a newer attempt
pub const SUPERSEDED_MESSAGE: &str = "superseded by a new attempt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Loading,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Loading => "loading",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStatus {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "loading" => Ok(ChunkStatus::Loading),
            "completed" => Ok(ChunkStatus::Completed),
            "failed" => Ok(ChunkStatus::Failed),
            other => Err(LoadError::UnknownStatus(other.to_string())),
        }
    }
}

/// One load attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub region: String,
    pub chunk_number: u32,
    pub features_in_chunk: u64,
    pub status: ChunkStatus,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Attempt counts of one region, by outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTally {
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait ProgressLedger: Send + Sync {
    /// Open a `loading` attempt, marking any older `loading` row for the same
    /// chunk as failed with [`SUPERSEDED_MESSAGE`]
    async fn begin(&self, region: &str, chunk: u32, features: u64) -> Result<()>;

    /// Close the open attempt as completed
    async fn complete(&self, region: &str, chunk: u32) -> Result<()>;

    /// Close the open attempt as failed with `error`
    async fn fail(&self, region: &str, chunk: u32, error: &str) -> Result<()>;

    /// Chunk numbers with at least one completed attempt
    async fn completed_chunks(&self, region: &str) -> Result<BTreeSet<u32>>;

    /// Every attempt for `region`, oldest first
    async fn entries(&self, region: &str) -> Result<Vec<LedgerEntry>>;

    /// Completed/failed attempt counts per region
    async fn tallies(&self) -> Result<BTreeMap<String, ChunkTally>>;

    /// Drop all rows of `region`, returning how many were removed
    async fn clear_region(&self, region: &str) -> Result<u64>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        for status in [ChunkStatus::Loading, ChunkStatus::Completed, ChunkStatus::Failed] {
            assert_eq!(status.as_str().parse::<ChunkStatus>().unwrap(), status);
        }
        assert!(matches!(
            "pending".parse::<ChunkStatus>(),
            Err(LoadError::UnknownStatus(_))
        ));
    }
}
