//! geoload core library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Resumable loading of large GeoJSON building-footprint collections into a
//! spatial database, one region at a time.
//!
//! - **Streaming**: [`stream::FeatureStreamReader`] yields features from an
//!   arbitrarily large collection with bounded memory
//! - **Chunking**: [`chunker::ChunkBuilder`] splits a source into sealed chunk
//!   files described by a [`manifest::Manifest`]
//! - **Loading**: [`loader::ChunkLoader`] loads chunks idempotently and
//!   records every attempt in a [`ledger::ProgressLedger`]
//! - **Orchestration**: [`orchestrator::RegionOrchestrator`] drives each
//!   region through its lifecycle and persists the stage in a
//!   [`status::StatusStore`]
//! - **Validation**: [`validator::Validator`] reconciles loaded counts with
//!   the source inventory
//!
//! # Example
//!
//! ```no_run
//! use geoload_core::chunker::ChunkBuilder;
//!
//! fn split() -> geoload_core::Result<()> {
//!     let builder = ChunkBuilder::new("data/chunks");
//!     let manifest = builder.build("data/source/Vermont.geojson".as_ref(), "Vermont", 50_000, false)?;
//!     tracing::info!(chunks = manifest.total_chunks, "Vermont chunked");
//!     Ok(())
//! }
//! ```

pub mod chunker;
pub mod config;
pub mod error;
pub mod feature;
pub mod fetch;
pub mod geometry;
pub mod inventory;
pub mod ledger;
pub mod loader;
pub mod manifest;
pub mod memory;
pub mod orchestrator;
pub mod postgres;
pub mod status;
pub mod store;
pub mod stream;
pub mod validator;

// Re-export commonly used types
pub use config::LoaderConfig;
pub use error::{LoadError, Result};
pub use orchestrator::{Collaborators, PipelineSettings, RegionOrchestrator, RunMode, RunSummary};
pub use status::{RegionRecord, RegionStatus};
