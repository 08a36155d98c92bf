//! Loader configuration
//!
//! Values come from a `.env` file (if present) and then the process
//! environment, falling back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{LoadError, Result};

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/geoload";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Per-statement timeout applied to every store connection (30 minutes)
pub const DEFAULT_DATABASE_STATEMENT_TIMEOUT_SECS: u64 = 1800;

pub const DEFAULT_SOURCE_DATA_DIR: &str = "data/source";
pub const DEFAULT_CHUNKS_DIR: &str = "data/chunks";
pub const DEFAULT_REPORTS_DIR: &str = "reports";
pub const DEFAULT_STATUS_FILE: &str = "data/pipeline_status.json";

/// Features per chunk file
pub const DEFAULT_CHUNK_SIZE: usize = 50_000;

/// Rows per bulk-insert page
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// EPSG code of the source coordinates (WGS 84)
pub const DEFAULT_SRID: i32 = 4326;

pub const DEFAULT_DOWNLOAD_BASE_URL: &str =
    "https://minedbuildings.z5.web.core.windows.net/legacy/usbuildings-v2";
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 3600;

/// Small regions for dry runs and smoke tests
pub const TEST_REGIONS: &[&str] = &["Delaware", "RhodeIsland", "Vermont"];

/// Every region of the source dataset; names match the download file names
pub const ALL_REGIONS: &[&str] = &[
    "Alabama", "Alaska", "Arizona", "Arkansas", "California",
    "Colorado", "Connecticut", "Delaware", "DistrictofColumbia",
    "Florida", "Georgia", "Hawaii", "Idaho", "Illinois", "Indiana",
    "Iowa", "Kansas", "Kentucky", "Louisiana", "Maine", "Maryland",
    "Massachusetts", "Michigan", "Minnesota", "Mississippi", "Missouri",
    "Montana", "Nebraska", "Nevada", "NewHampshire", "NewJersey",
    "NewMexico", "NewYork", "NorthCarolina", "NorthDakota", "Ohio",
    "Oklahoma", "Oregon", "Pennsylvania", "RhodeIsland", "SouthCarolina",
    "SouthDakota", "Tennessee", "Texas", "Utah", "Vermont", "Virginia",
    "Washington", "WestVirginia", "Wisconsin", "Wyoming",
];

/// What to do with chunks whose geometries fail the integrity pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeometryPolicy {
    /// Log the counts and insert everything
    #[default]
    Permissive,
    /// Fail the chunk if any geometry is invalid, non-polygonal or zero-area
    Strict,
}

impl FromStr for GeometryPolicy {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "permissive" | "warn" => Ok(GeometryPolicy::Permissive),
            "strict" | "reject" => Ok(GeometryPolicy::Strict),
            other => Err(LoadError::Config(format!("Invalid GEOMETRY_POLICY: {other}"))),
        }
    }
}

/// What the uploading stage does after a chunk fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkFailurePolicy {
    /// Stop the region at the first failed chunk
    #[default]
    Abort,
    /// Record the failure and keep loading the remaining chunks
    Continue,
}

impl FromStr for ChunkFailurePolicy {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "abort" | "stop" => Ok(ChunkFailurePolicy::Abort),
            "continue" | "skip" => Ok(ChunkFailurePolicy::Continue),
            other => Err(LoadError::Config(format!(
                "Invalid CHUNK_FAILURE_POLICY: {other}"
            ))),
        }
    }
}

/// Destination store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub statement_timeout_secs: u64,
}

/// Everything the pipeline needs to run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub database: DatabaseConfig,
    pub source_data_dir: PathBuf,
    pub chunks_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub status_file: PathBuf,
    pub chunk_size: usize,
    pub batch_size: usize,
    pub srid: i32,
    pub download_base_url: String,
    pub download_timeout_secs: u64,
    pub geometry_policy: GeometryPolicy,
    pub chunk_failure_policy: ChunkFailurePolicy,
    /// Regions processed at once; 1 keeps the strictly sequential baseline
    pub region_concurrency: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                statement_timeout_secs: DEFAULT_DATABASE_STATEMENT_TIMEOUT_SECS,
            },
            source_data_dir: PathBuf::from(DEFAULT_SOURCE_DATA_DIR),
            chunks_dir: PathBuf::from(DEFAULT_CHUNKS_DIR),
            reports_dir: PathBuf::from(DEFAULT_REPORTS_DIR),
            status_file: PathBuf::from(DEFAULT_STATUS_FILE),
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            srid: DEFAULT_SRID,
            download_base_url: DEFAULT_DOWNLOAD_BASE_URL.to_string(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            geometry_policy: GeometryPolicy::Permissive,
            chunk_failure_policy: ChunkFailurePolicy::Abort,
            region_concurrency: 1,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(std::env::var(key).unwrap_or_else(|_| default.to_string()))
}

impl LoaderConfig {
    /// Load configuration from `.env` and the environment
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let geometry_policy = match std::env::var("GEOMETRY_POLICY") {
            Ok(value) => value.parse()?,
            Err(_) => GeometryPolicy::default(),
        };
        let chunk_failure_policy = match std::env::var("CHUNK_FAILURE_POLICY") {
            Ok(value) => value.parse()?,
            Err(_) => ChunkFailurePolicy::default(),
        };

        let config = Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                statement_timeout_secs: env_or(
                    "DATABASE_STATEMENT_TIMEOUT",
                    DEFAULT_DATABASE_STATEMENT_TIMEOUT_SECS,
                ),
            },
            source_data_dir: env_path("SOURCE_DATA_DIR", DEFAULT_SOURCE_DATA_DIR),
            chunks_dir: env_path("CHUNKS_DIR", DEFAULT_CHUNKS_DIR),
            reports_dir: env_path("REPORTS_DIR", DEFAULT_REPORTS_DIR),
            status_file: env_path("PIPELINE_STATUS_FILE", DEFAULT_STATUS_FILE),
            chunk_size: env_or("CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
            batch_size: env_or("BATCH_SIZE", DEFAULT_BATCH_SIZE),
            srid: env_or("SRID", DEFAULT_SRID),
            download_base_url: std::env::var("DOWNLOAD_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_DOWNLOAD_BASE_URL.to_string()),
            download_timeout_secs: env_or("DOWNLOAD_TIMEOUT_SECS", DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            geometry_policy,
            chunk_failure_policy,
            region_concurrency: env_or("REGION_CONCURRENCY", 1),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(LoadError::Config("CHUNK_SIZE must be greater than 0".into()));
        }
        if self.batch_size == 0 {
            return Err(LoadError::Config("BATCH_SIZE must be greater than 0".into()));
        }
        if self.region_concurrency == 0 {
            return Err(LoadError::Config(
                "REGION_CONCURRENCY must be greater than 0".into(),
            ));
        }
        if self.database.url.is_empty() {
            return Err(LoadError::Config("DATABASE_URL cannot be empty".into()));
        }
        if self.database.max_connections == 0 {
            return Err(LoadError::Config(
                "DATABASE_MAX_CONNECTIONS must be greater than 0".into(),
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(LoadError::Config(format!(
                "DATABASE_MIN_CONNECTIONS ({}) cannot be greater than DATABASE_MAX_CONNECTIONS ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }
        if self.region_concurrency as u32 > self.database.max_connections {
            tracing::warn!(
                region_concurrency = self.region_concurrency,
                max_connections = self.database.max_connections,
                "More concurrent regions than pooled connections; regions will queue on the pool"
            );
        }
        Ok(())
    }

    /// Path of the generated source inventory
    pub fn inventory_path(&self) -> PathBuf {
        self.reports_dir.join("source_inventory.csv")
    }

    /// Path of the reconciliation report
    pub fn validation_report_path(&self) -> PathBuf {
        self.reports_dir.join("validation_report.csv")
    }
}

/// Resolve the regions a command should touch
///
/// Explicit names win, then the test set, then every known region.
pub fn target_regions(explicit: &[String], test_only: bool) -> Vec<String> {
    let mut regions: Vec<String> = if !explicit.is_empty() {
        explicit.to_vec()
    } else if test_only {
        TEST_REGIONS.iter().map(|s| s.to_string()).collect()
    } else {
        ALL_REGIONS.iter().map(|s| s.to_string()).collect()
    };

    // a region listed twice would be driven by two tasks at once
    let mut seen = std::collections::HashSet::new();
    regions.retain(|r| seen.insert(r.clone()));
    regions
}
