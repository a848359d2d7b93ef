use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use pulsarboard_core::{
    Clock, DataSource, ResourceKey, ResourceKind, Served, StatSnapshot, Staleness, StatsRepository,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{keys, CacheStore, CacheTier};
use crate::gateway_metrics::READ_FALLBACKS_TOTAL;
use crate::upstream::{BrokerStats, PulsarAdmin, SubscriptionStats, TopicStats, UpstreamError};

#[derive(Debug, Clone, Error)]
pub enum ReadError {
    /// The upstream failed transiently and nothing older was retained.
    #[error("no fallback value available: {0}")]
    NoFallbackAvailable(UpstreamError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl ReadError {
    pub fn upstream(&self) -> &UpstreamError {
        match self {
            ReadError::NoFallbackAvailable(err) | ReadError::Upstream(err) => err,
        }
    }
}

/// Collections served through [`ReadThroughService::get_list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListResource {
    Tenants,
    Namespaces { tenant: String },
    Topics { tenant: String, namespace: String },
    Brokers,
    Clusters,
}

impl ListResource {
    pub fn cache_key(&self) -> String {
        match self {
            ListResource::Tenants => keys::TENANTS_LIST.to_string(),
            ListResource::Namespaces { tenant } => keys::tenant_namespaces(tenant),
            ListResource::Topics { tenant, namespace } => keys::namespace_topics(tenant, namespace),
            ListResource::Brokers => keys::BROKER_LIST.to_string(),
            ListResource::Clusters => keys::CLUSTERS_LIST.to_string(),
        }
    }

    fn tier(&self) -> CacheTier {
        match self {
            ListResource::Clusters => CacheTier::Config,
            _ => CacheTier::List,
        }
    }
}

/// Single resources served through [`ReadThroughService::get_detail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailResource {
    TopicStats { tenant: String, namespace: String, topic: String },
    TopicSubscriptions { tenant: String, namespace: String, topic: String },
    BrokerStats { broker: String },
}

impl DetailResource {
    pub fn cache_key(&self) -> String {
        match self {
            DetailResource::TopicStats { tenant, namespace, topic } => keys::topic_stats(tenant, namespace, topic),
            DetailResource::TopicSubscriptions { tenant, namespace, topic } => {
                keys::topic_subscriptions(tenant, namespace, topic)
            }
            DetailResource::BrokerStats { broker } => keys::broker_stats(broker),
        }
    }

    // resources the collectors persist, and so can be rebuilt from a snapshot
    fn snapshot_key(&self) -> Option<(ResourceKind, ResourceKey)> {
        match self {
            DetailResource::TopicStats { tenant, namespace, topic } => {
                Some((ResourceKind::Topic, ResourceKey::topic(tenant, namespace, topic)))
            }
            DetailResource::BrokerStats { broker } => Some((ResourceKind::Broker, ResourceKey::broker(broker))),
            DetailResource::TopicSubscriptions { .. } => None,
        }
    }
}

/// Cluster layout the background jobs enumerate. Answers may be served from
/// cache, possibly stale.
#[async_trait]
pub trait TopologySource: Send + Sync + 'static {
    async fn tenants(&self) -> Result<Vec<String>, ReadError>;

    async fn namespaces(&self, tenant: &str) -> Result<Vec<String>, ReadError>;

    async fn topics(&self, tenant: &str, namespace: &str) -> Result<Vec<String>, ReadError>;

    async fn brokers(&self) -> Result<Vec<String>, ReadError>;
}

/// Cache-first reads with a staleness-tagged fallback when the upstream is down.
///
/// Mutations are not handled here: whoever mutates through the admin API must
/// invalidate the affected keys on the [`CacheStore`] afterwards.
pub struct ReadThroughService {
    admin: PulsarAdmin,
    cache: Arc<CacheStore>,
    repository: Arc<dyn StatsRepository>,
    clock: Arc<dyn Clock>,
}

impl ReadThroughService {
    pub fn new(
        admin: PulsarAdmin,
        cache: Arc<CacheStore>,
        repository: Arc<dyn StatsRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ReadThroughService {
            admin,
            cache,
            repository,
            clock,
        }
    }

    pub fn admin(&self) -> &PulsarAdmin {
        &self.admin
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub async fn get_list(&self, resource: &ListResource) -> Result<Served<Vec<String>>, ReadError> {
        let key = resource.cache_key();
        let admin = self.admin.clone();
        let served = match resource.clone() {
            ListResource::Tenants => {
                self.read(&key, resource.tier(), None, move || async move {
                    to_json(admin.list_tenants().await?)
                })
                .await?
            }
            ListResource::Namespaces { tenant } => {
                self.read(&key, resource.tier(), None, move || async move {
                    to_json(admin.list_namespaces(&tenant).await?)
                })
                .await?
            }
            ListResource::Topics { tenant, namespace } => {
                self.read(&key, resource.tier(), None, move || async move {
                    to_json(admin.list_topics(&tenant, &namespace).await?)
                })
                .await?
            }
            ListResource::Brokers => {
                self.read(&key, resource.tier(), None, move || async move {
                    to_json(admin.list_brokers().await?)
                })
                .await?
            }
            ListResource::Clusters => {
                self.read(&key, resource.tier(), None, move || async move {
                    to_json(admin.list_clusters().await?)
                })
                .await?
            }
        };
        decode(served)
    }

    /// Untyped detail read; the typed accessors below wrap it.
    pub async fn get_detail(&self, resource: &DetailResource) -> Result<Served<Value>, ReadError> {
        let key = resource.cache_key();
        let fallback = resource.snapshot_key();
        let admin = self.admin.clone();
        match resource.clone() {
            DetailResource::TopicStats { tenant, namespace, topic } => {
                self.read(&key, CacheTier::Stats, fallback, move || async move {
                    to_json(admin.topic_stats(&tenant, &namespace, &topic).await?)
                })
                .await
            }
            DetailResource::TopicSubscriptions { tenant, namespace, topic } => {
                self.read(&key, CacheTier::Stats, fallback, move || async move {
                    to_json(admin.topic_stats(&tenant, &namespace, &topic).await?.subscriptions)
                })
                .await
            }
            DetailResource::BrokerStats { broker } => {
                self.read(&key, CacheTier::Stats, fallback, move || async move {
                    to_json(admin.broker_stats(&broker).await?)
                })
                .await
            }
        }
    }

    pub async fn topic_stats(&self, tenant: &str, namespace: &str, topic: &str) -> Result<Served<TopicStats>, ReadError> {
        let resource = DetailResource::TopicStats {
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
            topic: topic.to_string(),
        };
        decode(self.get_detail(&resource).await?)
    }

    pub async fn topic_subscriptions(
        &self,
        tenant: &str,
        namespace: &str,
        topic: &str,
    ) -> Result<Served<Vec<SubscriptionStats>>, ReadError> {
        let resource = DetailResource::TopicSubscriptions {
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
            topic: topic.to_string(),
        };
        decode(self.get_detail(&resource).await?)
    }

    pub async fn broker_stats(&self, broker: &str) -> Result<Served<BrokerStats>, ReadError> {
        let resource = DetailResource::BrokerStats {
            broker: broker.to_string(),
        };
        decode(self.get_detail(&resource).await?)
    }

    async fn read<F, Fut>(
        &self,
        key: &str,
        tier: CacheTier,
        fallback: Option<(ResourceKind, ResourceKey)>,
        loader: F,
    ) -> Result<Served<Value>, ReadError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Value, UpstreamError>> + Send + 'static,
    {
        match self.cache.get_or_load(key, self.cache.ttl(tier), loader).await {
            Ok(loaded) => {
                let staleness = Staleness::fresh(loaded.source, loaded.entry.stored_at, self.clock.now());
                Ok(Served::new(loaded.entry.value, staleness))
            }
            Err(err) if err.allows_fallback() => self.fallback(key, fallback, err).await,
            Err(err) => Err(ReadError::Upstream(err)),
        }
    }

    /// Newest retained value among the expired cache entry and the latest
    /// persisted snapshot, tagged stale with its true age.
    async fn fallback(
        &self,
        key: &str,
        snapshot_key: Option<(ResourceKind, ResourceKey)>,
        cause: UpstreamError,
    ) -> Result<Served<Value>, ReadError> {
        let cached = self
            .cache
            .get_stale(key)
            .await
            .map(|entry| (entry.value, entry.stored_at, DataSource::StaleCache));

        let persisted = match snapshot_key {
            Some((kind, resource)) => self.latest_snapshot_value(kind, &resource).await,
            None => None,
        };

        let chosen = match (cached, persisted) {
            (Some(c), Some(p)) => Some(if p.1 > c.1 { p } else { c }),
            (c, p) => c.or(p),
        };

        match chosen {
            Some((value, stored_at, source)) => {
                let staleness = Staleness::stale(source, stored_at, self.clock.now());
                counter!(READ_FALLBACKS_TOTAL.name, "source" => source_label(source)).increment(1);
                warn!(
                    key = %key,
                    error = %cause,
                    age_seconds = staleness.age_seconds,
                    "upstream unavailable, serving stale value"
                );
                Ok(Served::new(value, staleness))
            }
            None => {
                counter!(READ_FALLBACKS_TOTAL.name, "source" => "none").increment(1);
                warn!(key = %key, error = %cause, "upstream unavailable and no fallback value retained");
                Err(ReadError::NoFallbackAvailable(cause))
            }
        }
    }

    async fn latest_snapshot_value(
        &self,
        kind: ResourceKind,
        resource: &ResourceKey,
    ) -> Option<(Value, DateTime<Utc>, DataSource)> {
        let snapshot = match self.repository.latest(kind, resource).await {
            Ok(snapshot) => snapshot?,
            Err(err) => {
                warn!(key = %resource, error = %err, "repository fallback read failed");
                return None;
            }
        };
        let value = snapshot_value(&snapshot)?;
        debug!(key = %resource, collected_at = %snapshot.collected_at, "repository snapshot available as fallback");
        Some((value, snapshot.collected_at, DataSource::Repository))
    }
}

#[async_trait]
impl TopologySource for ReadThroughService {
    async fn tenants(&self) -> Result<Vec<String>, ReadError> {
        Ok(self.get_list(&ListResource::Tenants).await?.value)
    }

    async fn namespaces(&self, tenant: &str) -> Result<Vec<String>, ReadError> {
        let resource = ListResource::Namespaces {
            tenant: tenant.to_string(),
        };
        Ok(self.get_list(&resource).await?.value)
    }

    async fn topics(&self, tenant: &str, namespace: &str) -> Result<Vec<String>, ReadError> {
        let resource = ListResource::Topics {
            tenant: tenant.to_string(),
            namespace: namespace.to_string(),
        };
        Ok(self.get_list(&resource).await?.value)
    }

    async fn brokers(&self) -> Result<Vec<String>, ReadError> {
        Ok(self.get_list(&ListResource::Brokers).await?.value)
    }
}

// same JSON shape the live loaders cache
fn snapshot_value(snapshot: &StatSnapshot) -> Option<Value> {
    let value = match snapshot.kind {
        ResourceKind::Topic => serde_json::to_value(TopicStats::from_metrics(&snapshot.metrics)),
        ResourceKind::Broker => serde_json::to_value(BrokerStats::from_metrics(
            snapshot.key.as_str(),
            &snapshot.metrics,
        )),
        ResourceKind::Subscription => return None,
    };
    value.ok()
}

fn source_label(source: DataSource) -> &'static str {
    match source {
        DataSource::Live => "live",
        DataSource::Cache => "cache",
        DataSource::StaleCache => "stale_cache",
        DataSource::Repository => "repository",
    }
}

pub(crate) fn to_json<T: Serialize>(value: T) -> Result<Value, UpstreamError> {
    serde_json::to_value(value).map_err(|err| UpstreamError::Decode(err.to_string()))
}

fn decode<T: DeserializeOwned>(served: Served<Value>) -> Result<Served<T>, ReadError> {
    let staleness = served.staleness;
    let value = serde_json::from_value(served.value)
        .map_err(|err| ReadError::Upstream(UpstreamError::Decode(err.to_string())))?;
    Ok(Served::new(value, staleness))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_resources_use_their_tiers() {
        assert_eq!(ListResource::Clusters.tier(), CacheTier::Config);
        assert_eq!(ListResource::Brokers.tier(), CacheTier::List);
        assert_eq!(
            ListResource::Topics {
                tenant: "acme".into(),
                namespace: "orders".into()
            }
            .cache_key(),
            "namespace:acme/orders:topics"
        );
    }

    #[test]
    fn only_persisted_details_fall_back_to_snapshots() {
        let subs = DetailResource::TopicSubscriptions {
            tenant: "acme".into(),
            namespace: "orders".into(),
            topic: "created".into(),
        };
        assert!(subs.snapshot_key().is_none());

        let broker = DetailResource::BrokerStats {
            broker: "broker-1:8080".into(),
        };
        assert_eq!(
            broker.snapshot_key(),
            Some((ResourceKind::Broker, ResourceKey::broker("broker-1:8080")))
        );
    }
}
