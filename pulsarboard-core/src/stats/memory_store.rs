use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{
    errors::{RepositoryError, Result},
    store::StatsRepository,
};
use crate::model::{Aggregation, AggregationType, ResourceKey, ResourceKind, StatSnapshot};

type SeriesKey = (ResourceKind, ResourceKey);

#[derive(Debug, Default)]
struct Inner {
    // per resource, snapshots ordered by collected_at
    series: HashMap<SeriesKey, BTreeMap<DateTime<Utc>, StatSnapshot>>,
    aggregations: HashMap<(AggregationType, String), Aggregation>,
}

/// MemoryStatsRepository keeps snapshots and aggregations in process memory.
/// Used by tests and by single-node deployments that accept losing history on restart.
///
/// A whole batch is applied under one write lock, so readers never observe a
/// partially inserted cycle.
#[derive(Debug, Clone, Default)]
pub struct MemoryStatsRepository {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStatsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots across every resource.
    pub async fn snapshot_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.series.values().map(|s| s.len()).sum()
    }
}

#[async_trait]
impl StatsRepository for MemoryStatsRepository {
    async fn insert_batch(&self, snapshots: &[StatSnapshot]) -> Result<u64> {
        if snapshots.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.write().await;
        for snapshot in snapshots {
            inner
                .series
                .entry((snapshot.kind, snapshot.key.clone()))
                .or_default()
                .insert(snapshot.collected_at, snapshot.clone());
        }
        Ok(snapshots.len() as u64)
    }

    async fn latest(&self, kind: ResourceKind, key: &ResourceKey) -> Result<Option<StatSnapshot>> {
        let inner = self.inner.read().await;
        Ok(inner
            .series
            .get(&(kind, key.clone()))
            .and_then(|series| series.values().next_back().cloned()))
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
        let inner = self.inner.read().await;
        Ok(inner
            .series
            .get(&(kind, key.clone()))
            .map(|series| series.range(from..=to).map(|(_, s)| s.clone()).collect())
            .unwrap_or_default())
    }

    async fn latest_as_of(&self, kind: ResourceKind, as_of: DateTime<Utc>) -> Result<Vec<StatSnapshot>> {
        let inner = self.inner.read().await;
        let mut out: Vec<StatSnapshot> = inner
            .series
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .filter_map(|(_, series)| series.range(..=as_of).next_back().map(|(_, s)| s.clone()))
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let mut purged = 0u64;
        for series in inner.series.values_mut() {
            let keep = series.split_off(&cutoff);
            purged += series.len() as u64;
            *series = keep;
        }
        inner.series.retain(|_, series| !series.is_empty());
        Ok(purged)
    }

    async fn upsert_aggregation(&self, aggregation: &Aggregation) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.aggregations.insert(
            (aggregation.agg_type, aggregation.key.clone()),
            aggregation.clone(),
        );
        Ok(())
    }

    async fn get_aggregation(
        &self,
        agg_type: AggregationType,
        key: &str,
    ) -> Result<Option<Aggregation>> {
        let inner = self.inner.read().await;
        Ok(inner.aggregations.get(&(agg_type, key.to_string())).cloned())
    }

    async fn list_aggregations(&self, agg_type: AggregationType) -> Result<Vec<Aggregation>> {
        let inner = self.inner.read().await;
        let mut out: Vec<Aggregation> = inner
            .aggregations
            .values()
            .filter(|a| a.agg_type == agg_type)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn delete_aggregation(&self, agg_type: AggregationType, key: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner.aggregations.remove(&(agg_type, key.to_string())).is_some())
    }
}
