//! geoload CLI library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Command-line front end for the footprint loading pipeline:
//!
//! - **Acquisition**: fetch region sources (`geoload download`)
//! - **Chunking**: split sources into sealed chunks (`geoload chunk`)
//! - **Loading**: load chunks into PostGIS (`geoload upload`)
//! - **Orchestration**: drive regions end to end (`geoload run`)
//! - **Reporting**: inventory, validation and status (`geoload inventory`,
//!   `geoload validate`, `geoload status`)
//! - **Schema**: apply migrations (`geoload migrate`)

pub mod commands;

use clap::{Args, Parser, Subcommand};

/// geoload - resumable building footprint loader
#[derive(Parser, Debug)]
#[command(name = "geoload")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Which regions a command applies to
#[derive(Args, Debug, Clone, Default)]
pub struct RegionArgs {
    /// Region names (defaults to every known region)
    pub regions: Vec<String>,

    /// Only the small test regions
    #[arg(short, long)]
    pub test: bool,
}

impl RegionArgs {
    pub fn resolve(&self) -> Vec<String> {
        geoload_core::config::target_regions(&self.regions, self.test)
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download and extract region sources
    Download {
        #[command(flatten)]
        regions: RegionArgs,
    },

    /// Split region sources into chunk files
    Chunk {
        #[command(flatten)]
        regions: RegionArgs,

        /// Rebuild chunks even if a manifest exists
        #[arg(long)]
        overwrite: bool,
    },

    /// Load chunk files into the database
    Upload {
        #[command(flatten)]
        regions: RegionArgs,

        /// Skip chunks the ledger already shows as completed
        #[arg(long)]
        resume: bool,
    },

    /// Reconcile loaded counts with the source inventory
    Validate {
        /// Also run store-wide geometry spot checks
        #[arg(long)]
        integrity: bool,
    },

    /// Count features in every downloaded source
    Inventory,

    /// Show per-region pipeline status
    Status {
        /// Print the raw status records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Drive regions through the whole pipeline
    Run {
        #[command(flatten)]
        regions: RegionArgs,

        /// Continue from existing manifests and the ledger without cleanup
        #[arg(long)]
        resume: bool,

        /// Show what would run without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Apply database migrations
    Migrate,
}
