mod providers;
pub use providers::postgres::{PostgresOptions, PostgresStatsRepository};

pub use pulsarboard_core::stats::{MemoryStatsRepository, RepositoryError, StatsRepository};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulsarboard_core::model::{
    Aggregation, AggregationType, ResourceKey, ResourceKind, StatSnapshot,
};
use pulsarboard_core::stats::Result;

#[derive(Debug, Clone)]
pub enum StatsStorage {
    Postgres(PostgresStatsRepository),
    InMemory(MemoryStatsRepository), // single-node deployments and tests
}

#[async_trait]
impl StatsRepository for StatsStorage {
    async fn insert_batch(&self, snapshots: &[StatSnapshot]) -> Result<u64> {
        match self {
            StatsStorage::Postgres(store) => store.insert_batch(snapshots).await,
            StatsStorage::InMemory(store) => store.insert_batch(snapshots).await,
        }
    }

    async fn latest(&self, kind: ResourceKind, key: &ResourceKey) -> Result<Option<StatSnapshot>> {
        match self {
            StatsStorage::Postgres(store) => store.latest(kind, key).await,
            StatsStorage::InMemory(store) => store.latest(kind, key).await,
        }
    }

    async fn range(
        &self,
        kind: ResourceKind,
        key: &ResourceKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatSnapshot>> {
        match self {
            StatsStorage::Postgres(store) => store.range(kind, key, from, to).await,
            StatsStorage::InMemory(store) => store.range(kind, key, from, to).await,
        }
    }

    async fn latest_as_of(&self, kind: ResourceKind, as_of: DateTime<Utc>) -> Result<Vec<StatSnapshot>> {
        match self {
            StatsStorage::Postgres(store) => store.latest_as_of(kind, as_of).await,
            StatsStorage::InMemory(store) => store.latest_as_of(kind, as_of).await,
        }
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        match self {
            StatsStorage::Postgres(store) => store.purge_older_than(cutoff).await,
            StatsStorage::InMemory(store) => store.purge_older_than(cutoff).await,
        }
    }

    async fn upsert_aggregation(&self, aggregation: &Aggregation) -> Result<()> {
        match self {
            StatsStorage::Postgres(store) => store.upsert_aggregation(aggregation).await,
            StatsStorage::InMemory(store) => store.upsert_aggregation(aggregation).await,
        }
    }

    async fn get_aggregation(
        &self,
        agg_type: AggregationType,
        key: &str,
    ) -> Result<Option<Aggregation>> {
        match self {
            StatsStorage::Postgres(store) => store.get_aggregation(agg_type, key).await,
            StatsStorage::InMemory(store) => store.get_aggregation(agg_type, key).await,
        }
    }

    async fn list_aggregations(&self, agg_type: AggregationType) -> Result<Vec<Aggregation>> {
        match self {
            StatsStorage::Postgres(store) => store.list_aggregations(agg_type).await,
            StatsStorage::InMemory(store) => store.list_aggregations(agg_type).await,
        }
    }

    async fn delete_aggregation(&self, agg_type: AggregationType, key: &str) -> Result<bool> {
        match self {
            StatsStorage::Postgres(store) => store.delete_aggregation(agg_type, key).await,
            StatsStorage::InMemory(store) => store.delete_aggregation(agg_type, key).await,
        }
    }

    async fn ping(&self) -> Result<()> {
        match self {
            StatsStorage::Postgres(store) => store.ping().await,
            StatsStorage::InMemory(store) => store.ping().await,
        }
    }
}
