//! `geoload migrate` command implementation

use anyhow::{Context, Result};
use geoload_core::postgres;

use super::{connect, load_config};

pub async fn run() -> Result<()> {
    let config = load_config()?;
    let store = connect(&config).await?;
    postgres::health_check(store.pool()).await?;
    postgres::migrate(store.pool())
        .await
        .context("Failed to apply migrations")?;
    println!("Migrations applied.");
    Ok(())
}
