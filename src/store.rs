//! Metric storage boundary
//!
//! [`MetricStore`] is what the ingestion core needs from storage: a liveness
//! check, partition maintenance and row inserts. [`PgMetricStore`] implements
//! it on PostgreSQL, where `admin.ensure_partition_metric_time` keeps a
//! partition for the current week and the next one available.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use tracing::{debug, info};
use url::Url;

use crate::config::StorageConfig;
use crate::document::MetricTable;
use crate::error::StorageError;

/// Keep one partition ahead of the one covering the metric time.
const ENSURE_PARTITIONS_SQL: &str = "select * from admin.ensure_partition_metric_time($1, $2, 1)";

const INSERT_CPU_LOAD_SQL: &str = "INSERT INTO cpu_load(time, dbname, data) VALUES ($1, $2, $3::jsonb)";
const INSERT_PG_STATS_SQL: &str = "INSERT INTO heroku_pg_stats(time, dbname, data) VALUES ($1, $2, $3::jsonb)";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Liveness check, run once at startup.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Make sure partitions of `metric` covering `at` (and the following window) exist.
    async fn ensure_partitions(&self, metric: &str, at: DateTime<Utc>) -> Result<(), StorageError>;

    /// Insert one `(time, dbname, data)` row.
    async fn write_metric(
        &self,
        table: MetricTable,
        at: DateTime<Utc>,
        tenant: &str,
        payload: &[u8],
    ) -> Result<(), StorageError>;
}

/// PostgreSQL-backed metric store
#[derive(Debug, Clone)]
pub struct PgMetricStore {
    pool: PgPool,
}

impl PgMetricStore {
    /// Build a lazily connecting pool; no connection is opened until first use.
    pub fn connect_lazy(config: &StorageConfig) -> Result<Self, StorageError> {
        let options = PgConnectOptions::from_str(&config.database_url)?
            .ssl_mode(PgSslMode::from_str(&config.ssl_mode)?);

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_lazy_with(options);

        info!(
            url = %redact_url(&config.database_url),
            ssl_mode = %config.ssl_mode,
            pool_size = config.pool_size,
            "Metrics database pool created"
        );

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn insert_sql(table: MetricTable) -> &'static str {
    match table {
        MetricTable::Narrow => INSERT_CPU_LOAD_SQL,
        MetricTable::Wide => INSERT_PG_STATS_SQL,
    }
}

#[async_trait]
impl MetricStore for PgMetricStore {
    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_partitions(&self, metric: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        debug!(metric, %at, "Ensuring metric partitions");
        sqlx::query(ENSURE_PARTITIONS_SQL)
            .bind(metric)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn write_metric(
        &self,
        table: MetricTable,
        at: DateTime<Utc>,
        tenant: &str,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        let data = std::str::from_utf8(payload).map_err(|e| StorageError::Payload(e.to_string()))?;

        sqlx::query(insert_sql(table))
            .bind(at)
            .bind(tenant)
            .bind(data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Database URL with the password masked, for logging.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("xxxxx"));
            }
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
