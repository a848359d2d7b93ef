use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::errors::Result;
use crate::model::{Aggregation, AggregationType, ResourceKey, ResourceKind, StatSnapshot};

/// Durable store for stat snapshots and precomputed aggregations.
///
/// Implementations must make `insert_batch` atomic: either every snapshot of the
/// batch becomes visible to readers or none does.
#[async_trait]
pub trait StatsRepository: Send + Sync + 'static {
    /// Insert one collector cycle worth of snapshots in a single transaction.
    async fn insert_batch(&self, snapshots: &[StatSnapshot]) -> Result<u64>;

    /// Most recent snapshot of one resource.
    async fn latest(&self, kind: ResourceKind, key: &ResourceKey) -> Result<Option<StatSnapshot>>;

    /// Snapshots of one resource collected in `[from, to]`, oldest first.
    /// An inverted range is rejected with `InvalidArguments`.
    async fn range(
        &self,
        kind: ResourceKind,
        key: &ResourceKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StatSnapshot>>;

    /// Latest snapshot of every resource of `kind`, ignoring snapshots
    /// collected after `as_of`. Served from one consistent read, so a batch
    /// committing concurrently is either fully included or fully absent.
    async fn latest_as_of(&self, kind: ResourceKind, as_of: DateTime<Utc>) -> Result<Vec<StatSnapshot>>;

    /// Drop snapshots collected before `cutoff`. Aggregations are untouched.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Insert or overwrite the aggregation keyed by `(agg_type, key)`.
    async fn upsert_aggregation(&self, aggregation: &Aggregation) -> Result<()>;

    async fn get_aggregation(
        &self,
        agg_type: AggregationType,
        key: &str,
    ) -> Result<Option<Aggregation>>;

    async fn list_aggregations(&self, agg_type: AggregationType) -> Result<Vec<Aggregation>>;

    /// Remove the rollup of a scope that no longer exists. Returns whether a
    /// row was removed.
    async fn delete_aggregation(&self, agg_type: AggregationType, key: &str) -> Result<bool>;

    /// Liveness check for health reporting.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
