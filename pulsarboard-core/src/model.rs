use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Metric names recorded in a [`StatSnapshot`].
pub mod metric {
    // topic
    pub const BACKLOG: &str = "backlog";
    pub const MSG_RATE_IN: &str = "msg_rate_in";
    pub const MSG_RATE_OUT: &str = "msg_rate_out";
    pub const MSG_THROUGHPUT_IN: &str = "msg_throughput_in";
    pub const MSG_THROUGHPUT_OUT: &str = "msg_throughput_out";
    pub const STORAGE_SIZE: &str = "storage_size";
    pub const PRODUCER_COUNT: &str = "producer_count";
    pub const SUBSCRIPTION_COUNT: &str = "subscription_count";

    // subscription
    pub const CONSUMER_COUNT: &str = "consumer_count";

    // broker
    pub const CPU_USAGE: &str = "cpu_usage";
    pub const MEMORY_USAGE: &str = "memory_usage";
    pub const DIRECT_MEMORY_USAGE: &str = "direct_memory_usage";
    pub const CONNECTION_COUNT: &str = "connection_count";
    pub const TOPIC_COUNT: &str = "topic_count";
}

/// The kind of cluster resource a snapshot measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Topic,
    Subscription,
    Broker,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Topic => "topic",
            ResourceKind::Subscription => "subscription",
            ResourceKind::Broker => "broker",
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "topic" => Ok(ResourceKind::Topic),
            "subscription" => Ok(ResourceKind::Subscription),
            "broker" => Ok(ResourceKind::Broker),
            other => Err(format!("unknown resource kind: {}", other)),
        }
    }
}

/// Composite identity of a resource, stable across snapshots.
///
/// - topic: `tenant/namespace/topic`
/// - subscription: `tenant/namespace/topic/subscription`
/// - broker: the broker URL as reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn topic(tenant: &str, namespace: &str, topic: &str) -> Self {
        ResourceKey(format!("{}/{}/{}", tenant, namespace, topic))
    }

    pub fn subscription(tenant: &str, namespace: &str, topic: &str, subscription: &str) -> Self {
        ResourceKey(format!("{}/{}/{}/{}", tenant, namespace, topic, subscription))
    }

    pub fn broker(url: &str) -> Self {
        ResourceKey(url.to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        ResourceKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tenant and namespace the resource lives in. Brokers have no scope.
    pub fn scope(&self, kind: ResourceKind) -> Option<(&str, &str)> {
        if kind == ResourceKind::Broker {
            return None;
        }
        let mut parts = self.0.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(tenant), Some(namespace), Some(_)) if !tenant.is_empty() && !namespace.is_empty() => {
                Some((tenant, namespace))
            }
            _ => None,
        }
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable, timestamped measurement of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub kind: ResourceKind,
    pub key: ResourceKey,
    pub metrics: BTreeMap<String, f64>,
    pub collected_at: DateTime<Utc>,
}

impl StatSnapshot {
    pub fn new(
        kind: ResourceKind,
        key: ResourceKey,
        metrics: BTreeMap<String, f64>,
        collected_at: DateTime<Utc>,
    ) -> Self {
        StatSnapshot {
            kind,
            key,
            metrics,
            collected_at,
        }
    }

    /// Value of a metric, zero when the upstream did not report it.
    pub fn metric(&self, name: &str) -> f64 {
        self.metrics.get(name).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    Tenant,
    Namespace,
}

impl AggregationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationType::Tenant => "tenant",
            AggregationType::Namespace => "namespace",
        }
    }
}

impl Display for AggregationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tenant" => Ok(AggregationType::Tenant),
            "namespace" => Ok(AggregationType::Namespace),
            other => Err(format!("unknown aggregation type: {}", other)),
        }
    }
}

/// A tenant or a namespace: the grouping a rollup is computed over.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Tenant(String),
    Namespace { tenant: String, namespace: String },
}

impl Scope {
    pub fn tenant(tenant: impl Into<String>) -> Self {
        Scope::Tenant(tenant.into())
    }

    pub fn namespace(tenant: impl Into<String>, namespace: impl Into<String>) -> Self {
        Scope::Namespace {
            tenant: tenant.into(),
            namespace: namespace.into(),
        }
    }

    pub fn aggregation_type(&self) -> AggregationType {
        match self {
            Scope::Tenant(_) => AggregationType::Tenant,
            Scope::Namespace { .. } => AggregationType::Namespace,
        }
    }

    /// `tenant` or `tenant/namespace`.
    pub fn aggregation_key(&self) -> String {
        match self {
            Scope::Tenant(tenant) => tenant.clone(),
            Scope::Namespace { tenant, namespace } => format!("{}/{}", tenant, namespace),
        }
    }

    pub fn contains(&self, kind: ResourceKind, key: &ResourceKey) -> bool {
        match (self, key.scope(kind)) {
            (Scope::Tenant(t), Some((tenant, _))) => t == tenant,
            (Scope::Namespace { tenant, namespace }, Some((t, ns))) => tenant == t && namespace == ns,
            _ => false,
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.aggregation_type(), self.aggregation_key())
    }
}

/// Precomputed rollup over the latest topic snapshots of a tenant or namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub agg_type: AggregationType,
    pub key: String,
    pub topic_count: u64,
    pub total_backlog: u64,
    pub total_msg_rate_in: f64,
    pub total_msg_rate_out: f64,
    pub total_storage_size: u64,
    pub computed_at: DateTime<Utc>,
}

impl Aggregation {
    /// Rolls up the given topic snapshots. Callers pass the latest snapshot of
    /// each topic in `scope`; an empty slice yields an all-zero rollup.
    pub fn from_snapshots(
        scope: &Scope,
        snapshots: &[StatSnapshot],
        computed_at: DateTime<Utc>,
    ) -> Self {
        let mut agg = Aggregation {
            agg_type: scope.aggregation_type(),
            key: scope.aggregation_key(),
            topic_count: 0,
            total_backlog: 0,
            total_msg_rate_in: 0.0,
            total_msg_rate_out: 0.0,
            total_storage_size: 0,
            computed_at,
        };

        for snapshot in snapshots
            .iter()
            .filter(|s| s.kind == ResourceKind::Topic && scope.contains(s.kind, &s.key))
        {
            agg.topic_count += 1;
            agg.total_backlog += as_count(snapshot.metric(metric::BACKLOG));
            agg.total_msg_rate_in += snapshot.metric(metric::MSG_RATE_IN);
            agg.total_msg_rate_out += snapshot.metric(metric::MSG_RATE_OUT);
            agg.total_storage_size += as_count(snapshot.metric(metric::STORAGE_SIZE));
        }

        agg
    }
}

// counters arrive as JSON numbers; negative or NaN values are treated as zero
fn as_count(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value.round() as u64
    } else {
        0
    }
}
