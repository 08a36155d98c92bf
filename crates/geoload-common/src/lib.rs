//! geoload common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the geoload workspace members:
//!
//! - **Error Handling**: the common error type and result alias
//! - **Checksums**: SHA-256 digests used to seal chunk files
//! - **Logging**: `tracing` subscriber bootstrap
//!
//! # Example
//!
//! ```no_run
//! use geoload_common::checksum::sha256_file;
//!
//! fn seal(path: &str) -> geoload_common::Result<()> {
//!     let digest = sha256_file(path)?;
//!     tracing::info!(%digest, "chunk sealed");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
