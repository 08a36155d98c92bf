//! PostGIS-backed destination store and progress ledger
//!
//! Both tables live in the same database so a single pool serves them. The
//! schema is created by the migrations under `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, QueryBuilder, Postgres, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{LoadError, Result};
use crate::ledger::{ChunkStatus, ChunkTally, LedgerEntry, ProgressLedger, SUPERSEDED_MESSAGE};
use crate::store::{ChunkBatch, DestinationStore, IntegritySnapshot};

/// Postgres unique_violation
const UNIQUE_VIOLATION: &str = "23505";

/// Open a pool with the configured statement timeout applied to every
/// connection
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let statement_timeout_ms = config.statement_timeout_secs.saturating_mul(1000);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                conn.execute(format!("SET statement_timeout = {statement_timeout_ms}").as_str())
                    .await?;
                Ok(())
            })
        })
        .connect(&config.url)
        .await?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        statement_timeout_secs = config.statement_timeout_secs,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Apply pending schema migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}

pub async fn health_check(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Footprint table plus load ledger on one Postgres pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    batch_size: usize,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: crate::config::DEFAULT_BATCH_SIZE,
        }
    }

    /// Rows per multi-row INSERT statement
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        Ok(Self::new(create_pool(config).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl DestinationStore for PgStore {
    async fn replace_chunk(&self, batch: &ChunkBatch) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM footprints WHERE region = $1 AND chunk_number = $2")
            .bind(&batch.region)
            .bind(batch.chunk_number as i32)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed > 0 {
            debug!(
                region = %batch.region,
                chunk = batch.chunk_number,
                removed,
                "Removed rows from an earlier attempt"
            );
        }

        let mut inserted = 0u64;
        for page in batch.rows.chunks(self.batch_size) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO footprints (region, geom, source_file, chunk_number) ");

            builder.push_values(page, |mut b, row| {
                b.push_bind(&batch.region)
                    .push("ST_GeomFromText(")
                    .push_bind_unseparated(&row.wkt)
                    .push_unseparated(", ")
                    .push_bind_unseparated(batch.srid)
                    .push_unseparated(")")
                    .push_bind(&batch.source_file)
                    .push_bind(batch.chunk_number as i32);
            });

            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn count_region(&self, region: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM footprints WHERE region = $1")
            .bind(region)
            .fetch_one(&self.pool)
            .await?;
        Ok(to_u64(count))
    }

    async fn count_by_region(&self) -> Result<BTreeMap<String, u64>> {
        let rows = sqlx::query(
            "SELECT region, COUNT(*) AS n FROM footprints WHERE region IS NOT NULL GROUP BY region",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let region: String = row.try_get("region")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(region, to_u64(n));
        }
        Ok(counts)
    }

    async fn delete_region(&self, region: &str) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM footprints WHERE region = $1")
            .bind(region)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    async fn integrity_snapshot(&self) -> Result<IntegritySnapshot> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_rows,
                COUNT(*) FILTER (WHERE geom IS NULL) AS null_geometries,
                COUNT(*) FILTER (WHERE geom IS NOT NULL AND NOT ST_IsValid(geom)) AS invalid_geometries,
                COUNT(*) FILTER (WHERE region IS NULL OR region = '') AS empty_region_labels
            FROM footprints
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let srids: Vec<i32> = sqlx::query_scalar(
            "SELECT DISTINCT ST_SRID(geom) FROM footprints WHERE geom IS NOT NULL ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let geometry_types: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT UPPER(GeometryType(geom)) FROM footprints WHERE geom IS NOT NULL ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(IntegritySnapshot {
            total_rows: to_u64(row.try_get("total_rows")?),
            null_geometries: to_u64(row.try_get("null_geometries")?),
            invalid_geometries: to_u64(row.try_get("invalid_geometries")?),
            empty_region_labels: to_u64(row.try_get("empty_region_labels")?),
            srids,
            geometry_types,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

#[async_trait]
impl ProgressLedger for PgStore {
    async fn begin(&self, region: &str, chunk: u32, features: u64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let superseded = sqlx::query(
            r#"
            UPDATE load_progress
            SET status = 'failed', error_message = $3, completed_at = NOW()
            WHERE region = $1 AND chunk_number = $2 AND status = 'loading'
            "#,
        )
        .bind(region)
        .bind(chunk as i32)
        .bind(SUPERSEDED_MESSAGE)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if superseded > 0 {
            debug!(region, chunk, "Superseded stale loading attempt");
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO load_progress (region, chunk_number, features_in_chunk, status, started_at)
            VALUES ($1, $2, $3, 'loading', NOW())
            "#,
        )
        .bind(region)
        .bind(chunk as i32)
        .bind(i64::try_from(features).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(LoadError::LoadInProgress {
                    region: region.to_string(),
                    chunk,
                })
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(())
    }

    async fn complete(&self, region: &str, chunk: u32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE load_progress
            SET status = 'completed', completed_at = NOW()
            WHERE region = $1 AND chunk_number = $2 AND status = 'loading'
            "#,
        )
        .bind(region)
        .bind(chunk as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, region: &str, chunk: u32, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE load_progress
            SET status = 'failed', error_message = $3, completed_at = NOW()
            WHERE region = $1 AND chunk_number = $2 AND status = 'loading'
            "#,
        )
        .bind(region)
        .bind(chunk as i32)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn completed_chunks(&self, region: &str) -> Result<BTreeSet<u32>> {
        let chunks: Vec<i32> = sqlx::query_scalar(
            "SELECT DISTINCT chunk_number FROM load_progress WHERE region = $1 AND status = 'completed'",
        )
        .bind(region)
        .fetch_all(&self.pool)
        .await?;

        Ok(chunks
            .into_iter()
            .filter_map(|n| u32::try_from(n).ok())
            .collect())
    }

    async fn entries(&self, region: &str) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT region, chunk_number, features_in_chunk, status, error_message,
                   started_at, completed_at
            FROM load_progress
            WHERE region = $1
            ORDER BY id
            "#,
        )
        .bind(region)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let chunk_number: i32 = row.try_get("chunk_number")?;
                let features: i64 = row.try_get("features_in_chunk")?;
                Ok(LedgerEntry {
                    region: row.try_get("region")?,
                    chunk_number: u32::try_from(chunk_number).unwrap_or(0),
                    features_in_chunk: to_u64(features),
                    status: status.parse::<ChunkStatus>()?,
                    error_message: row.try_get("error_message")?,
                    started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
                    completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
                })
            })
            .collect()
    }

    async fn tallies(&self) -> Result<BTreeMap<String, ChunkTally>> {
        let rows = sqlx::query(
            r#"
            SELECT region,
                   COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM load_progress
            GROUP BY region
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tallies = BTreeMap::new();
        for row in rows {
            let region: String = row.try_get("region")?;
            tallies.insert(
                region,
                ChunkTally {
                    completed: to_u64(row.try_get("completed")?),
                    failed: to_u64(row.try_get("failed")?),
                },
            );
        }
        Ok(tallies)
    }

    async fn clear_region(&self, region: &str) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM load_progress WHERE region = $1")
            .bind(region)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }
}
