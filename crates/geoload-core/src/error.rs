//! Error taxonomy for the loading pipeline
//!
//! Each variant carries enough context (region, chunk number, counts) for an
//! unattended re-run to be diagnosed from the status store or ledger alone.

use std::path::PathBuf;
use thiserror::Error;

use crate::status::RegionStatus;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, LoadError>;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Common(#[from] geoload_common::CommonError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Source data could not be materialized locally
    #[error("Failed to fetch source for {region}: {message}")]
    Fetch { region: String, message: String },

    /// Structural framing of the source feature collection is broken
    #[error("Malformed feature collection at byte {offset}: {message}")]
    Parse { offset: u64, message: String },

    #[error("No manifest for {region} at {}", path.display())]
    ManifestMissing { region: String, path: PathBuf },

    #[error("Manifest for {region} is inconsistent: {message}")]
    ManifestInconsistent { region: String, message: String },

    #[error("Chunk file missing: {}", path.display())]
    ChunkFileMissing { path: PathBuf },

    #[error("Chunk {chunk} declares {declared} features but holds {actual}")]
    ChunkCountMismatch {
        chunk: u32,
        declared: u64,
        actual: u64,
    },

    #[error("Feature {index} has an unusable geometry: {message}")]
    MalformedGeometry { index: usize, message: String },

    /// Strict geometry policy refused a chunk with quality issues
    #[error(
        "Chunk {chunk} rejected: {invalid} invalid, {non_polygon} non-polygon, {bad_area} zero/null-area geometries"
    )]
    GeometryRejected {
        chunk: u32,
        invalid: u64,
        non_polygon: u64,
        bad_area: u64,
    },

    /// Another attempt for the same chunk is still marked loading
    #[error("Chunk {chunk} of {region} is already being loaded")]
    LoadInProgress { region: String, chunk: u32 },

    #[error("Chunk {chunk} of {region} failed: {source}")]
    ChunkLoad {
        region: String,
        chunk: u32,
        #[source]
        source: Box<LoadError>,
    },

    /// Post-load reconciliation failed
    #[error("Validation failed for {region}: expected {expected} but store has {observed} (missing {missing})")]
    CountMismatch {
        region: String,
        expected: u64,
        observed: u64,
        missing: i64,
    },

    #[error("Illegal transition for {region}: {from} -> {to}")]
    IllegalTransition {
        region: String,
        from: RegionStatus,
        to: RegionStatus,
    },

    /// A persisted status string is not part of the closed state set
    #[error("Unknown status value '{0}'")]
    UnknownStatus(String),

    #[error("Status store error: {0}")]
    StatusStore(String),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl LoadError {
    pub fn fetch(region: impl Into<String>, message: impl std::fmt::Display) -> Self {
        LoadError::Fetch {
            region: region.into(),
            message: message.to_string(),
        }
    }

    /// Chunk number of a per-chunk failure, if this is one
    pub fn failed_chunk(&self) -> Option<u32> {
        match self {
            LoadError::ChunkLoad { chunk, .. } => Some(*chunk),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_load_message_includes_cause() {
        let err = LoadError::ChunkLoad {
            region: "Vermont".into(),
            chunk: 2,
            source: Box::new(LoadError::ChunkCountMismatch {
                chunk: 2,
                declared: 50,
                actual: 49,
            }),
        };
        let text = err.to_string();
        assert!(text.contains("Chunk 2 of Vermont failed"));
        assert!(text.contains("declares 50 features but holds 49"));
        assert_eq!(err.failed_chunk(), Some(2));
    }

    #[test]
    fn test_count_mismatch_message() {
        let err = LoadError::CountMismatch {
            region: "Delaware".into(),
            expected: 130,
            observed: 100,
            missing: 30,
        };
        assert_eq!(
            err.to_string(),
            "Validation failed for Delaware: expected 130 but store has 100 (missing 30)"
        );
        assert_eq!(err.failed_chunk(), None);
    }
}
