use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulsarboard_core::model::{
    Aggregation, AggregationType, ResourceKey, ResourceKind, StatSnapshot,
};
use pulsarboard_core::stats::{RepositoryError, Result, StatsRepository};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

// four bound parameters per row, Postgres caps a statement at 65535
const INSERT_CHUNK: usize = 5000;

#[derive(Debug, Clone)]
pub struct PostgresOptions {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PostgresOptions {
    pub fn new(url: impl Into<String>) -> Self {
        PostgresOptions {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Stats repository backed by PostgreSQL.
///
/// Snapshots are append-only rows in `stat_snapshots`; aggregations are keyed by
/// `(agg_type, agg_key)` and overwritten on every run.
#[derive(Debug, Clone)]
pub struct PostgresStatsRepository {
    pool: PgPool,
}

impl PostgresStatsRepository {
    /// Connects and applies pending migrations.
    pub async fn connect(options: &PostgresOptions) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect(&options.url)
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(storage_err)?;

        info!(max_connections = options.max_connections, "stats repository connected");
        Ok(PostgresStatsRepository { pool })
    }
}

#[async_trait]
impl StatsRepository for PostgresStatsRepository {
    async fn insert_batch(&self, snapshots: &[StatSnapshot]) -> Result<u64> {
        if snapshots.is_empty() {
            return Ok(0);
        }

        // one transaction per batch: a cycle is visible entirely or not at all
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut inserted = 0u64;
        for chunk in snapshots.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO stat_snapshots (kind, resource_key, metrics, collected_at) ",
            );
            builder.push_values(chunk, |mut row, snapshot| {
                row.push_bind(snapshot.kind.as_str())
                    .push_bind(snapshot.key.as_str())
                    .push_bind(Json(&snapshot.metrics))
                    .push_bind(snapshot.collected_at);
            });
            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            inserted += result.rows_affected();
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(rows = inserted, "stat snapshots inserted");
        Ok(inserted)
    }

    async fn latest(&self, kind: ResourceKind, key: &ResourceKey) -> Result<Option<StatSnapshot>> {
        let row = sqlx::query(
            "SELECT kind, resource_key, metrics, collected_at FROM stat_snapshots \
             WHERE kind = $1 AND resource_key = $2 \
             ORDER BY collected_at DESC LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn range(
        &self,
        kind: ResourceKind,
        key: &ResourceKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatSnapshot>> {
        if from > to {
            return Err(RepositoryError::InvalidArguments(format!(
                "range start {} is after its end {}",
                from, to
            )));
        }
        let rows = sqlx::query(
            "SELECT kind, resource_key, metrics, collected_at FROM stat_snapshots \
             WHERE kind = $1 AND resource_key = $2 AND collected_at BETWEEN $3 AND $4 \
             ORDER BY collected_at ASC",
        )
        .bind(kind.as_str())
        .bind(key.as_str())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(snapshot_from_row).collect()
    }

    async fn latest_as_of(&self, kind: ResourceKind, as_of: DateTime<Utc>) -> Result<Vec<StatSnapshot>> {
        // single statement, single MVCC snapshot
        let rows = sqlx::query(
            "SELECT DISTINCT ON (resource_key) kind, resource_key, metrics, collected_at \
             FROM stat_snapshots \
             WHERE kind = $1 AND collected_at <= $2 \
             ORDER BY resource_key, collected_at DESC",
        )
        .bind(kind.as_str())
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(snapshot_from_row).collect()
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM stat_snapshots WHERE collected_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn upsert_aggregation(&self, aggregation: &Aggregation) -> Result<()> {
        sqlx::query(
            "INSERT INTO aggregations \
               (agg_type, agg_key, topic_count, total_backlog, total_msg_rate_in, \
                total_msg_rate_out, total_storage_size, computed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (agg_type, agg_key) DO UPDATE SET \
               topic_count = EXCLUDED.topic_count, \
               total_backlog = EXCLUDED.total_backlog, \
               total_msg_rate_in = EXCLUDED.total_msg_rate_in, \
               total_msg_rate_out = EXCLUDED.total_msg_rate_out, \
               total_storage_size = EXCLUDED.total_storage_size, \
               computed_at = EXCLUDED.computed_at",
        )
        .bind(aggregation.agg_type.as_str())
        .bind(&aggregation.key)
        .bind(to_i64(aggregation.topic_count))
        .bind(to_i64(aggregation.total_backlog))
        .bind(aggregation.total_msg_rate_in)
        .bind(aggregation.total_msg_rate_out)
        .bind(to_i64(aggregation.total_storage_size))
        .bind(aggregation.computed_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get_aggregation(
        &self,
        agg_type: AggregationType,
        key: &str,
    ) -> Result<Option<Aggregation>> {
        let row = sqlx::query(
            "SELECT agg_type, agg_key, topic_count, total_backlog, total_msg_rate_in, \
                    total_msg_rate_out, total_storage_size, computed_at \
             FROM aggregations WHERE agg_type = $1 AND agg_key = $2",
        )
        .bind(agg_type.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(aggregation_from_row).transpose()
    }

    async fn delete_aggregation(&self, agg_type: AggregationType, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM aggregations WHERE agg_type = $1 AND agg_key = $2")
            .bind(agg_type.as_str())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn list_aggregations(&self, agg_type: AggregationType) -> Result<Vec<Aggregation>> {
        let rows = sqlx::query(
            "SELECT agg_type, agg_key, topic_count, total_backlog, total_msg_rate_in, \
                    total_msg_rate_out, total_storage_size, computed_at \
             FROM aggregations WHERE agg_type = $1 ORDER BY agg_key",
        )
        .bind(agg_type.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(aggregation_from_row).collect()
    }
}

fn snapshot_from_row(row: &PgRow) -> Result<StatSnapshot> {
    let kind: String = row.try_get("kind").map_err(storage_err)?;
    let kind: ResourceKind = kind
        .parse()
        .map_err(|_| RepositoryError::CorruptRow(format!("unknown resource kind {kind}")))?;
    let key: String = row.try_get("resource_key").map_err(storage_err)?;
    let Json(metrics): Json<BTreeMap<String, f64>> = row.try_get("metrics").map_err(storage_err)?;
    let collected_at: DateTime<Utc> = row.try_get("collected_at").map_err(storage_err)?;

    Ok(StatSnapshot::new(
        kind,
        ResourceKey::from_raw(key),
        metrics,
        collected_at,
    ))
}

fn aggregation_from_row(row: &PgRow) -> Result<Aggregation> {
    let agg_type: String = row.try_get("agg_type").map_err(storage_err)?;
    let agg_type: AggregationType = agg_type
        .parse()
        .map_err(|_| RepositoryError::CorruptRow(format!("unknown aggregation type {agg_type}")))?;

    Ok(Aggregation {
        agg_type,
        key: row.try_get("agg_key").map_err(storage_err)?,
        topic_count: from_i64(row.try_get("topic_count").map_err(storage_err)?),
        total_backlog: from_i64(row.try_get("total_backlog").map_err(storage_err)?),
        total_msg_rate_in: row.try_get("total_msg_rate_in").map_err(storage_err)?,
        total_msg_rate_out: row.try_get("total_msg_rate_out").map_err(storage_err)?,
        total_storage_size: from_i64(row.try_get("total_storage_size").map_err(storage_err)?),
        computed_at: row.try_get("computed_at").map_err(storage_err)?,
    })
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_i64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn storage_err<E>(err: E) -> RepositoryError
where
    E: std::error::Error + Send + Sync + 'static,
{
    RepositoryError::StorageError(Box::new(err))
}
