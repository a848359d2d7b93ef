//! Cache key scheme.
//!
//! Keys are partitioned by resource type and identity. Invalidation helpers
//! return the exact keys and `*`-suffixed prefixes a mutation has to drop.

pub const TENANTS_LIST: &str = "tenants:list";
pub const BROKER_LIST: &str = "broker:list";
pub const CLUSTERS_LIST: &str = "clusters:list";

/// Volatility class of a cached value; each maps to a configured TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// tenants, namespaces, topics, brokers
    List,
    /// topic, subscription and broker statistics
    Stats,
    /// cluster-level configuration
    Config,
}

pub fn tenant_namespaces(tenant: &str) -> String {
    format!("tenant:{}:namespaces", tenant)
}

pub fn namespace_topics(tenant: &str, namespace: &str) -> String {
    format!("namespace:{}/{}:topics", tenant, namespace)
}

pub fn topic_stats(tenant: &str, namespace: &str, topic: &str) -> String {
    format!("topic:{}/{}/{}:stats", tenant, namespace, topic)
}

pub fn topic_subscriptions(tenant: &str, namespace: &str, topic: &str) -> String {
    format!("topic:{}/{}/{}:subscriptions", tenant, namespace, topic)
}

pub fn broker_stats(broker: &str) -> String {
    format!("broker:{}:stats", broker)
}

/// Everything a tenant mutation can make stale: the tenant list and every
/// key of the tenant's namespaces and topics.
pub fn tenant_invalidations(tenant: &str) -> Vec<String> {
    vec![
        TENANTS_LIST.to_string(),
        format!("tenant:{}:*", tenant),
        format!("namespace:{}/*", tenant),
        format!("topic:{}/*", tenant),
    ]
}

pub fn namespace_invalidations(tenant: &str, namespace: &str) -> Vec<String> {
    vec![
        tenant_namespaces(tenant),
        format!("namespace:{}/{}:*", tenant, namespace),
        format!("topic:{}/{}/*", tenant, namespace),
    ]
}

pub fn topic_invalidations(tenant: &str, namespace: &str, topic: &str) -> Vec<String> {
    vec![
        namespace_topics(tenant, namespace),
        format!("topic:{}/{}/{}:*", tenant, namespace, topic),
    ]
}

/// `Some(prefix)` for a `prefix*` pattern, `None` for an exact key.
pub fn as_prefix(pattern: &str) -> Option<&str> {
    pattern.strip_suffix('*')
}

/// Whether `key` is covered by an exact-key or `prefix*` pattern.
pub fn matches(pattern: &str, key: &str) -> bool {
    match as_prefix(pattern) {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}
