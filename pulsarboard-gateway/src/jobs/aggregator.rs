use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::counter;
use pulsarboard_core::{Aggregation, AggregationType, Clock, ResourceKind, Scope, StatSnapshot, StatsRepository};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

use super::{CycleReport, Job};
use crate::gateway_metrics::AGGREGATIONS_UPSERTED_TOTAL;
use crate::read_through::TopologySource;
use crate::upstream::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    /// Attempts per rollup upsert, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub concurrency: usize,
    /// Oldest snapshot still counted for a namespace whose topic list is
    /// unavailable this cycle.
    pub snapshot_horizon: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            concurrency: 8,
            snapshot_horizon: Duration::from_secs(60),
        }
    }
}

/// Topics of one namespace that count towards its rollup.
#[derive(Debug, Clone)]
enum Members {
    /// Topic list answered by the topology.
    Listed(BTreeSet<String>),
    /// Topic list unknown; every topic with a recent enough snapshot counts.
    Recent,
}

#[derive(Debug, Default)]
struct TenantPlan {
    namespaces: BTreeMap<String, Members>,
    /// The namespace list came from the topology rather than from snapshots.
    listed: bool,
}

#[derive(Debug, Default)]
struct ScopePlan {
    tenants: BTreeMap<String, TenantPlan>,
    /// The tenant list came from the topology; rollups of scopes missing from
    /// it can be removed.
    listed: bool,
}

/// Recomputes tenant and namespace rollups from the latest topic snapshots.
///
/// The upstream is never called for stats: a cycle reads the repository once,
/// as of the cycle start, and derives every rollup from that single read.
/// Only topics the topology still lists are counted, so a deleted topic
/// drops out of its rollups on the next cycle.
pub struct Aggregator {
    topology: Arc<dyn TopologySource>,
    repository: Arc<dyn StatsRepository>,
    clock: Arc<dyn Clock>,
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(
        topology: Arc<dyn TopologySource>,
        repository: Arc<dyn StatsRepository>,
        clock: Arc<dyn Clock>,
        config: AggregatorConfig,
    ) -> Self {
        Aggregator {
            topology,
            repository,
            clock,
            config,
        }
    }

    /// Tenants, namespaces and topics, from the topology when it answers and
    /// from the snapshot keys otherwise. Known tenants without topics are kept
    /// so they get an all-zero rollup.
    async fn plan(&self, by_tenant: &BTreeMap<String, Vec<StatSnapshot>>) -> ScopePlan {
        let tenants = match self.topology.tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                warn!(error = %err, "tenant listing unavailable, deriving scopes from snapshots");
                let tenants = by_tenant
                    .keys()
                    .map(|tenant| (tenant.clone(), derived_tenant(by_tenant, tenant)))
                    .collect();
                return ScopePlan { tenants, listed: false };
            }
        };

        let mut plan = ScopePlan {
            tenants: BTreeMap::new(),
            listed: true,
        };
        for tenant in tenants {
            let tenant_plan = match self.topology.namespaces(&tenant).await {
                Ok(namespaces) => {
                    let mut listed = BTreeMap::new();
                    for namespace in namespaces {
                        let members = match self.topology.topics(&tenant, &namespace).await {
                            Ok(topics) => Members::Listed(topics.into_iter().collect()),
                            Err(err) => {
                                warn!(
                                    tenant = %tenant,
                                    namespace = %namespace,
                                    error = %err,
                                    "topic listing unavailable, counting recent snapshots only"
                                );
                                Members::Recent
                            }
                        };
                        listed.insert(namespace, members);
                    }
                    TenantPlan {
                        namespaces: listed,
                        listed: true,
                    }
                }
                Err(err) => {
                    warn!(tenant = %tenant, error = %err, "namespace listing unavailable, deriving from snapshots");
                    derived_tenant(by_tenant, &tenant)
                }
            };
            plan.tenants.insert(tenant, tenant_plan);
        }
        plan
    }

    async fn upsert_with_retry(&self, aggregation: &Aggregation) -> bool {
        let backoff = RetryPolicy {
            max_attempts: self.config.max_attempts,
            base_delay: self.config.base_delay,
            factor: 2.0,
            jitter: 0.0,
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.repository.upsert_aggregation(aggregation).await {
                Ok(()) => return true,
                Err(err) if attempt < backoff.max_attempts => {
                    let delay = backoff.delay_for(attempt);
                    warn!(
                        agg_type = %aggregation.agg_type,
                        key = %aggregation.key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "aggregation upsert failed, retrying"
                    );
                    time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        agg_type = %aggregation.agg_type,
                        key = %aggregation.key,
                        attempt,
                        error = %err,
                        "aggregation upsert failed, skipping until next cycle"
                    );
                    return false;
                }
            }
        }
    }

    /// Drop rollups of tenants and namespaces the topology no longer lists.
    async fn remove_vanished(&self, plan: &ScopePlan) {
        if !plan.listed {
            return;
        }
        let mut vanished: Vec<(AggregationType, String)> = Vec::new();

        match self.repository.list_aggregations(AggregationType::Tenant).await {
            Ok(existing) => vanished.extend(
                existing
                    .into_iter()
                    .filter(|agg| !plan.tenants.contains_key(&agg.key))
                    .map(|agg| (AggregationType::Tenant, agg.key)),
            ),
            Err(err) => warn!(error = %err, "unable to list tenant rollups"),
        }

        match self.repository.list_aggregations(AggregationType::Namespace).await {
            Ok(existing) => vanished.extend(
                existing
                    .into_iter()
                    .filter(|agg| {
                        let Some((tenant, namespace)) = agg.key.split_once('/') else {
                            return true;
                        };
                        match plan.tenants.get(tenant) {
                            None => true,
                            Some(t) => t.listed && !t.namespaces.contains_key(namespace),
                        }
                    })
                    .map(|agg| (AggregationType::Namespace, agg.key)),
            ),
            Err(err) => warn!(error = %err, "unable to list namespace rollups"),
        }

        for (agg_type, key) in vanished {
            match self.repository.delete_aggregation(agg_type, &key).await {
                Ok(true) => info!(agg_type = %agg_type, key = %key, "removed rollup of vanished scope"),
                Ok(false) => {}
                Err(err) => warn!(agg_type = %agg_type, key = %key, error = %err, "unable to remove rollup"),
            }
        }
    }
}

#[async_trait]
impl Job for Aggregator {
    fn name(&self) -> &'static str {
        "aggregator"
    }

    async fn run_once(&self) -> CycleReport {
        let as_of = self.clock.now();
        let snapshots = match self.repository.latest_as_of(ResourceKind::Topic, as_of).await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warn!(error = %err, "unable to read latest topic snapshots");
                return CycleReport::failed(0, 1);
            }
        };

        let mut by_tenant: BTreeMap<String, Vec<StatSnapshot>> = BTreeMap::new();
        for snapshot in snapshots {
            if let Some((tenant, _)) = snapshot.key.scope(snapshot.kind) {
                by_tenant.entry(tenant.to_string()).or_default().push(snapshot);
            }
        }

        let horizon = chrono::Duration::from_std(self.config.snapshot_horizon).unwrap_or(chrono::Duration::MAX);
        let oldest_recent = as_of.checked_sub_signed(horizon).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let plan = self.plan(&by_tenant).await;
        let mut aggregations = Vec::new();
        for (tenant, tenant_plan) in &plan.tenants {
            let owned = by_tenant.get(tenant).map(Vec::as_slice).unwrap_or(&[]);
            let mut tenant_members: Vec<StatSnapshot> = Vec::new();
            for (namespace, members) in &tenant_plan.namespaces {
                let counted: Vec<StatSnapshot> = owned
                    .iter()
                    .filter(|s| s.key.scope(s.kind).map(|(_, ns)| ns) == Some(namespace.as_str()))
                    .filter(|s| match members {
                        Members::Listed(topics) => topic_name(s).is_some_and(|topic| topics.contains(topic)),
                        Members::Recent => s.collected_at >= oldest_recent,
                    })
                    .cloned()
                    .collect();
                let scope = Scope::namespace(tenant.clone(), namespace.clone());
                aggregations.push(Aggregation::from_snapshots(&scope, &counted, as_of));
                tenant_members.extend(counted);
            }
            aggregations.push(Aggregation::from_snapshots(
                &Scope::tenant(tenant.clone()),
                &tenant_members,
                as_of,
            ));
        }

        let computed = aggregations.len() as u64;
        let results: Vec<bool> = stream::iter(aggregations)
            .map(|aggregation| async move { self.upsert_with_retry(&aggregation).await })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        let upserted = results.iter().filter(|ok| **ok).count() as u64;
        counter!(AGGREGATIONS_UPSERTED_TOTAL.name).increment(upserted);

        self.remove_vanished(&plan).await;
        debug!(computed, upserted, "aggregation cycle done");

        CycleReport::completed(computed, computed - upserted, upserted)
    }
}

/// Namespaces of a tenant as seen in its snapshot keys.
fn derived_tenant(by_tenant: &BTreeMap<String, Vec<StatSnapshot>>, tenant: &str) -> TenantPlan {
    let namespaces = by_tenant
        .get(tenant)
        .into_iter()
        .flatten()
        .filter_map(|s| s.key.scope(s.kind).map(|(_, namespace)| (namespace.to_string(), Members::Recent)))
        .collect();
    TenantPlan {
        namespaces,
        listed: false,
    }
}

fn topic_name(snapshot: &StatSnapshot) -> Option<&str> {
    snapshot.key.as_str().splitn(3, '/').nth(2)
}
