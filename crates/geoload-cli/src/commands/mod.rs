//! Command implementations

pub mod chunk;
pub mod download;
pub mod inventory;
pub mod migrate;
pub mod run;
pub mod status;
pub mod upload;
pub mod validate;

use anyhow::{Context, Result};
use geoload_core::config::LoaderConfig;
use geoload_core::postgres::PgStore;

/// Configuration from `.env` and the environment
pub fn load_config() -> Result<LoaderConfig> {
    LoaderConfig::from_env().context("Invalid configuration")
}

/// Connect to the destination database
pub async fn connect(config: &LoaderConfig) -> Result<PgStore> {
    let store = PgStore::connect(&config.database)
        .await
        .with_context(|| format!("Failed to connect to {}", redact(&config.database.url)))?;
    Ok(store.with_batch_size(config.batch_size))
}

/// Hide the password of a connection URL
pub fn redact(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => url.to_string(),
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
