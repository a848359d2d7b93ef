use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::counter;
use pulsarboard_core::{Clock, ResourceKey, ResourceKind, StatSnapshot, StatsRepository};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{CycleReport, Job};
use crate::cache::{keys, CacheStore, CacheTier};
use crate::gateway_metrics::SNAPSHOTS_PERSISTED_TOTAL;
use crate::read_through::{to_json, ReadError, TopologySource};
use crate::upstream::{PulsarAdmin, UpstreamError};

/// Everything a collector touches, shared by the three collectors.
#[derive(Clone)]
pub struct CollectorContext {
    pub admin: PulsarAdmin,
    pub topology: Arc<dyn TopologySource>,
    pub repository: Arc<dyn StatsRepository>,
    pub cache: Arc<CacheStore>,
    pub clock: Arc<dyn Clock>,
    /// Upper bound on stat fetches in flight at once.
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TopicRef {
    tenant: String,
    namespace: String,
    topic: String,
}

/// What one successful fetch contributes to the cycle.
struct Fetched {
    snapshots: Vec<StatSnapshot>,
    cache_key: String,
    cache_value: Value,
}

impl CollectorContext {
    /// Walk tenants, namespaces and topics. A failed namespace or topic listing
    /// skips that branch and is counted; only a failed tenant listing aborts.
    async fn enumerate_topics(&self) -> Result<(Vec<TopicRef>, u64), ReadError> {
        let mut topics = Vec::new();
        let mut failures = 0;

        for tenant in self.topology.tenants().await? {
            let namespaces = match self.topology.namespaces(&tenant).await {
                Ok(namespaces) => namespaces,
                Err(err) => {
                    warn!(tenant = %tenant, error = %err, "unable to list namespaces, skipping tenant");
                    failures += 1;
                    continue;
                }
            };
            for namespace in namespaces {
                match self.topology.topics(&tenant, &namespace).await {
                    Ok(names) => topics.extend(names.into_iter().map(|topic| TopicRef {
                        tenant: tenant.clone(),
                        namespace: namespace.clone(),
                        topic,
                    })),
                    Err(err) => {
                        warn!(tenant = %tenant, namespace = %namespace, error = %err, "unable to list topics, skipping namespace");
                        failures += 1;
                    }
                }
            }
        }
        Ok((topics, failures))
    }

    /// Fetch every target with bounded concurrency, flush all snapshots in
    /// one batch, then write the fresh values through to the cache.
    async fn collect<T, F, Fut>(&self, job: &'static str, targets: Vec<T>, prior_failures: u64, fetch: F) -> CycleReport
    where
        T: Send,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<Fetched, (String, UpstreamError)>>,
    {
        let results: Vec<_> = stream::iter(targets)
            .map(fetch)
            .buffer_unordered(self.concurrency.max(1))
            .collect()
            .await;

        let mut fetched = 0u64;
        let mut failed = prior_failures;
        let mut snapshots = Vec::new();
        let mut cache_writes = Vec::new();
        for result in results {
            match result {
                Ok(item) => {
                    fetched += 1;
                    snapshots.extend(item.snapshots);
                    cache_writes.push((item.cache_key, item.cache_value));
                }
                Err((resource, err)) => {
                    warn!(job, resource = %resource, error = %err, "stats fetch failed, skipping resource");
                    failed += 1;
                }
            }
        }

        let persisted = match self.repository.insert_batch(&snapshots).await {
            Ok(count) => count,
            Err(err) => {
                warn!(job, snapshots = snapshots.len(), error = %err, "unable to persist snapshots");
                return CycleReport::failed(fetched, failed);
            }
        };
        counter!(SNAPSHOTS_PERSISTED_TOTAL.name, "job" => job).increment(persisted);

        for (key, value) in cache_writes {
            self.cache.set(&key, value, CacheTier::Stats).await;
        }
        debug!(job, fetched, persisted, "collector cycle flushed");

        CycleReport::completed(fetched, failed, persisted)
    }
}

/// Per-topic statistics, every `jobs.topic_stats_secs`.
pub struct TopicStatsCollector {
    ctx: CollectorContext,
}

impl TopicStatsCollector {
    pub fn new(ctx: CollectorContext) -> Self {
        TopicStatsCollector { ctx }
    }
}

#[async_trait]
impl Job for TopicStatsCollector {
    fn name(&self) -> &'static str {
        "topic_stats_collector"
    }

    async fn run_once(&self) -> CycleReport {
        let collected_at = self.ctx.clock.now();
        let (topics, listing_failures) = match self.ctx.enumerate_topics().await {
            Ok(found) => found,
            Err(err) => {
                warn!(job = self.name(), error = %err, "unable to enumerate topics");
                return CycleReport::failed(0, 1);
            }
        };

        let admin = &self.ctx.admin;
        self.ctx
            .collect(self.name(), topics, listing_failures, |t| async move {
                let stats = admin
                    .topic_stats(&t.tenant, &t.namespace, &t.topic)
                    .await
                    .map_err(|err| (format!("{}/{}/{}", t.tenant, t.namespace, t.topic), err))?;
                let snapshot = StatSnapshot::new(
                    ResourceKind::Topic,
                    ResourceKey::topic(&t.tenant, &t.namespace, &t.topic),
                    stats.to_metrics(),
                    collected_at,
                );
                let cache_key = keys::topic_stats(&t.tenant, &t.namespace, &t.topic);
                let cache_value = to_json(&stats).map_err(|err| (cache_key.clone(), err))?;
                Ok(Fetched {
                    snapshots: vec![snapshot],
                    cache_key,
                    cache_value,
                })
            })
            .await
    }
}

/// Per-subscription statistics, read from each topic's stats document.
pub struct SubscriptionStatsCollector {
    ctx: CollectorContext,
}

impl SubscriptionStatsCollector {
    pub fn new(ctx: CollectorContext) -> Self {
        SubscriptionStatsCollector { ctx }
    }
}

#[async_trait]
impl Job for SubscriptionStatsCollector {
    fn name(&self) -> &'static str {
        "subscription_stats_collector"
    }

    async fn run_once(&self) -> CycleReport {
        let collected_at = self.ctx.clock.now();
        let (topics, listing_failures) = match self.ctx.enumerate_topics().await {
            Ok(found) => found,
            Err(err) => {
                warn!(job = self.name(), error = %err, "unable to enumerate topics");
                return CycleReport::failed(0, 1);
            }
        };

        let admin = &self.ctx.admin;
        self.ctx
            .collect(self.name(), topics, listing_failures, |t| async move {
                let stats = admin
                    .topic_stats(&t.tenant, &t.namespace, &t.topic)
                    .await
                    .map_err(|err| (format!("{}/{}/{}", t.tenant, t.namespace, t.topic), err))?;
                let snapshots = stats
                    .subscriptions
                    .iter()
                    .map(|sub| {
                        StatSnapshot::new(
                            ResourceKind::Subscription,
                            ResourceKey::subscription(&t.tenant, &t.namespace, &t.topic, &sub.name),
                            sub.to_metrics(),
                            collected_at,
                        )
                    })
                    .collect();
                let cache_key = keys::topic_subscriptions(&t.tenant, &t.namespace, &t.topic);
                let cache_value = to_json(&stats.subscriptions).map_err(|err| (cache_key.clone(), err))?;
                Ok(Fetched {
                    snapshots,
                    cache_key,
                    cache_value,
                })
            })
            .await
    }
}

/// Broker load reports, every `jobs.broker_stats_secs`.
pub struct BrokerStatsCollector {
    ctx: CollectorContext,
}

impl BrokerStatsCollector {
    pub fn new(ctx: CollectorContext) -> Self {
        BrokerStatsCollector { ctx }
    }
}

#[async_trait]
impl Job for BrokerStatsCollector {
    fn name(&self) -> &'static str {
        "broker_stats_collector"
    }

    async fn run_once(&self) -> CycleReport {
        let collected_at: DateTime<Utc> = self.ctx.clock.now();
        let brokers = match self.ctx.topology.brokers().await {
            Ok(brokers) => brokers,
            Err(err) => {
                warn!(job = self.name(), error = %err, "unable to enumerate brokers");
                return CycleReport::failed(0, 1);
            }
        };

        let admin = &self.ctx.admin;
        self.ctx
            .collect(self.name(), brokers, 0, |broker| async move {
                let stats = admin
                    .broker_stats(&broker)
                    .await
                    .map_err(|err| (broker.clone(), err))?;
                let snapshot = StatSnapshot::new(
                    ResourceKind::Broker,
                    ResourceKey::broker(&broker),
                    stats.to_metrics(),
                    collected_at,
                );
                let cache_key = keys::broker_stats(&broker);
                let cache_value = to_json(&stats).map_err(|err| (cache_key.clone(), err))?;
                Ok(Fetched {
                    snapshots: vec![snapshot],
                    cache_key,
                    cache_value,
                })
            })
            .await
    }
}
