use pulsarboard_core::metric;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::client::UpstreamClient;
use super::errors::UpstreamError;
use super::transport::UpstreamRequest;

/// Normalised statistics of one topic, as cached and served.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicStats {
    pub msg_rate_in: f64,
    pub msg_rate_out: f64,
    pub msg_throughput_in: f64,
    pub msg_throughput_out: f64,
    pub storage_size: f64,
    pub backlog_size: f64,
    pub producer_count: u64,
    pub subscriptions: Vec<SubscriptionStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub name: String,
    pub msg_rate_out: f64,
    pub msg_throughput_out: f64,
    pub msg_backlog: f64,
    pub consumer_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub url: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub direct_memory_usage: f64,
    pub msg_rate_in: f64,
    pub msg_rate_out: f64,
    pub connection_count: u64,
}

impl TopicStats {
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            (metric::MSG_RATE_IN.to_string(), self.msg_rate_in),
            (metric::MSG_RATE_OUT.to_string(), self.msg_rate_out),
            (metric::MSG_THROUGHPUT_IN.to_string(), self.msg_throughput_in),
            (metric::MSG_THROUGHPUT_OUT.to_string(), self.msg_throughput_out),
            (metric::STORAGE_SIZE.to_string(), self.storage_size),
            (metric::BACKLOG.to_string(), self.backlog_size),
            (metric::PRODUCER_COUNT.to_string(), self.producer_count as f64),
            (
                metric::SUBSCRIPTION_COUNT.to_string(),
                self.subscriptions.len() as f64,
            ),
        ])
    }

    /// Rebuild from stored metrics; per-subscription detail is not kept in
    /// topic snapshots.
    pub fn from_metrics(metrics: &BTreeMap<String, f64>) -> Self {
        let get = |name: &str| metrics.get(name).copied().unwrap_or(0.0);
        TopicStats {
            msg_rate_in: get(metric::MSG_RATE_IN),
            msg_rate_out: get(metric::MSG_RATE_OUT),
            msg_throughput_in: get(metric::MSG_THROUGHPUT_IN),
            msg_throughput_out: get(metric::MSG_THROUGHPUT_OUT),
            storage_size: get(metric::STORAGE_SIZE),
            backlog_size: get(metric::BACKLOG),
            producer_count: get(metric::PRODUCER_COUNT).max(0.0) as u64,
            subscriptions: Vec::new(),
        }
    }
}

impl SubscriptionStats {
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            (metric::MSG_RATE_OUT.to_string(), self.msg_rate_out),
            (metric::MSG_THROUGHPUT_OUT.to_string(), self.msg_throughput_out),
            (metric::BACKLOG.to_string(), self.msg_backlog),
            (metric::CONSUMER_COUNT.to_string(), self.consumer_count as f64),
        ])
    }
}

impl BrokerStats {
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            (metric::CPU_USAGE.to_string(), self.cpu_usage),
            (metric::MEMORY_USAGE.to_string(), self.memory_usage),
            (metric::DIRECT_MEMORY_USAGE.to_string(), self.direct_memory_usage),
            (metric::MSG_RATE_IN.to_string(), self.msg_rate_in),
            (metric::MSG_RATE_OUT.to_string(), self.msg_rate_out),
            (metric::CONNECTION_COUNT.to_string(), self.connection_count as f64),
        ])
    }

    pub fn from_metrics(url: &str, metrics: &BTreeMap<String, f64>) -> Self {
        let get = |name: &str| metrics.get(name).copied().unwrap_or(0.0);
        BrokerStats {
            url: url.to_string(),
            cpu_usage: get(metric::CPU_USAGE),
            memory_usage: get(metric::MEMORY_USAGE),
            direct_memory_usage: get(metric::DIRECT_MEMORY_USAGE),
            msg_rate_in: get(metric::MSG_RATE_IN),
            msg_rate_out: get(metric::MSG_RATE_OUT),
            connection_count: get(metric::CONNECTION_COUNT).max(0.0) as u64,
        }
    }
}

/// Typed Pulsar admin v2 endpoints on top of [`UpstreamClient::call`].
#[derive(Clone)]
pub struct PulsarAdmin {
    client: Arc<UpstreamClient>,
}

impl PulsarAdmin {
    pub fn new(client: Arc<UpstreamClient>) -> Self {
        PulsarAdmin { client }
    }

    async fn get_json(&self, path: String) -> Result<Value, UpstreamError> {
        let target = self.client.admin_target();
        self.client
            .call(&target, &UpstreamRequest::get(path))
            .await?
            .json()
    }

    async fn mutate(&self, request: UpstreamRequest) -> Result<(), UpstreamError> {
        let target = self.client.admin_target();
        self.client.call(&target, &request).await?;
        Ok(())
    }

    pub async fn list_tenants(&self) -> Result<Vec<String>, UpstreamError> {
        let value = self.get_json("/admin/v2/tenants".to_string()).await?;
        string_list(&value)
    }

    /// Namespace names without the tenant prefix.
    pub async fn list_namespaces(&self, tenant: &str) -> Result<Vec<String>, UpstreamError> {
        let value = self.get_json(format!("/admin/v2/namespaces/{}", tenant)).await?;
        let prefix = format!("{}/", tenant);
        Ok(string_list(&value)?
            .into_iter()
            .map(|ns| ns.strip_prefix(&prefix).map(str::to_string).unwrap_or(ns))
            .collect())
    }

    /// Short topic names in a namespace, partitioned topics listed once.
    pub async fn list_topics(&self, tenant: &str, namespace: &str) -> Result<Vec<String>, UpstreamError> {
        let plain = self
            .get_json(format!("/admin/v2/persistent/{}/{}", tenant, namespace))
            .await?;
        let partitioned = self
            .get_json(format!("/admin/v2/persistent/{}/{}/partitioned", tenant, namespace))
            .await?;

        let mut names: BTreeSet<String> = BTreeSet::new();
        for full in string_list(&plain)?.into_iter().chain(string_list(&partitioned)?) {
            let short = short_topic_name(&full);
            names.insert(strip_partition_suffix(short).to_string());
        }
        Ok(names.into_iter().collect())
    }

    /// Topic statistics; falls back to the partitioned endpoint when the
    /// plain one reports the topic as unknown.
    pub async fn topic_stats(
        &self,
        tenant: &str,
        namespace: &str,
        topic: &str,
    ) -> Result<TopicStats, UpstreamError> {
        let base = format!("/admin/v2/persistent/{}/{}/{}", tenant, namespace, topic);
        let value = match self.get_json(format!("{}/stats", base)).await {
            Err(err) if err.is_not_found() => self.get_json(format!("{}/partitioned-stats", base)).await?,
            other => other?,
        };
        Ok(parse_topic_stats(&value))
    }

    pub async fn list_clusters(&self) -> Result<Vec<String>, UpstreamError> {
        let value = self.get_json("/admin/v2/clusters".to_string()).await?;
        string_list(&value)
    }

    /// Active brokers across every cluster, as `host:port`.
    pub async fn list_brokers(&self) -> Result<Vec<String>, UpstreamError> {
        let mut brokers: BTreeSet<String> = BTreeSet::new();
        for cluster in self.list_clusters().await? {
            let value = self.get_json(format!("/admin/v2/brokers/{}", cluster)).await?;
            brokers.extend(string_list(&value)?);
        }
        Ok(brokers.into_iter().collect())
    }

    /// Load report straight from the broker; the broker is its own breaker target.
    pub async fn broker_stats(&self, broker: &str) -> Result<BrokerStats, UpstreamError> {
        let target = broker_base_url(broker);
        let value: Value = self
            .client
            .call(&target, &UpstreamRequest::get("/admin/v2/broker-stats/load-report"))
            .await?
            .json()?;
        Ok(parse_broker_stats(broker, &value))
    }

    pub async fn create_tenant(&self, tenant: &str, allowed_clusters: &[String]) -> Result<(), UpstreamError> {
        let body = json!({ "adminRoles": [], "allowedClusters": allowed_clusters });
        self.mutate(UpstreamRequest::put(format!("/admin/v2/tenants/{}", tenant), Some(body)))
            .await
    }

    pub async fn delete_tenant(&self, tenant: &str) -> Result<(), UpstreamError> {
        self.mutate(UpstreamRequest::delete(format!("/admin/v2/tenants/{}", tenant)))
            .await
    }

    pub async fn create_namespace(&self, tenant: &str, namespace: &str) -> Result<(), UpstreamError> {
        self.mutate(UpstreamRequest::put(
            format!("/admin/v2/namespaces/{}/{}", tenant, namespace),
            None,
        ))
        .await
    }

    pub async fn delete_namespace(&self, tenant: &str, namespace: &str) -> Result<(), UpstreamError> {
        self.mutate(UpstreamRequest::delete(format!(
            "/admin/v2/namespaces/{}/{}",
            tenant, namespace
        )))
        .await
    }

    pub async fn create_topic(
        &self,
        tenant: &str,
        namespace: &str,
        topic: &str,
        partitions: Option<u32>,
    ) -> Result<(), UpstreamError> {
        let base = format!("/admin/v2/persistent/{}/{}/{}", tenant, namespace, topic);
        let request = match partitions {
            Some(n) if n > 0 => UpstreamRequest::put(format!("{}/partitions", base), Some(json!(n))),
            _ => UpstreamRequest::put(base, None),
        };
        self.mutate(request).await
    }

    pub async fn delete_topic(
        &self,
        tenant: &str,
        namespace: &str,
        topic: &str,
        partitioned: bool,
    ) -> Result<(), UpstreamError> {
        let base = format!("/admin/v2/persistent/{}/{}/{}", tenant, namespace, topic);
        let path = if partitioned {
            format!("{}/partitions", base)
        } else {
            base
        };
        self.mutate(UpstreamRequest::delete(path)).await
    }
}

pub fn broker_base_url(broker: &str) -> String {
    if broker.starts_with("http://") || broker.starts_with("https://") {
        broker.to_string()
    } else {
        format!("http://{}", broker)
    }
}

fn string_list(value: &Value) -> Result<Vec<String>, UpstreamError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| UpstreamError::Decode(format!("expected string, got {}", item)))
            })
            .collect(),
        other => Err(UpstreamError::Decode(format!("expected list, got {}", other))),
    }
}

// persistent://tenant/ns/topic -> topic
fn short_topic_name(full: &str) -> &str {
    let path = full.split_once("://").map(|(_, rest)| rest).unwrap_or(full);
    path.rsplit('/').next().unwrap_or(path)
}

fn strip_partition_suffix(name: &str) -> &str {
    match name.rsplit_once("-partition-") {
        Some((base, index)) if !base.is_empty() && index.chars().all(|c| c.is_ascii_digit()) && !index.is_empty() => base,
        _ => name,
    }
}

fn number(value: &Value, field: &str) -> f64 {
    value.get(field).and_then(Value::as_f64).unwrap_or(0.0)
}

fn array_len(value: &Value, field: &str) -> u64 {
    value
        .get(field)
        .and_then(Value::as_array)
        .map(|items| items.len() as u64)
        .unwrap_or(0)
}

pub(crate) fn parse_topic_stats(value: &Value) -> TopicStats {
    let subscriptions = value
        .get("subscriptions")
        .and_then(Value::as_object)
        .map(|subs| {
            subs.iter()
                .map(|(name, sub)| SubscriptionStats {
                    name: name.clone(),
                    msg_rate_out: number(sub, "msgRateOut"),
                    msg_throughput_out: number(sub, "msgThroughputOut"),
                    msg_backlog: number(sub, "msgBacklog"),
                    consumer_count: array_len(sub, "consumers"),
                })
                .collect()
        })
        .unwrap_or_default();

    TopicStats {
        msg_rate_in: number(value, "msgRateIn"),
        msg_rate_out: number(value, "msgRateOut"),
        msg_throughput_in: number(value, "msgThroughputIn"),
        msg_throughput_out: number(value, "msgThroughputOut"),
        storage_size: number(value, "storageSize"),
        backlog_size: number(value, "backlogSize"),
        producer_count: array_len(value, "publishers"),
        subscriptions,
    }
}

// usage figures come nested as {"cpu": {"usage": .., "limit": ..}}
pub(crate) fn parse_broker_stats(broker: &str, value: &Value) -> BrokerStats {
    let usage = |field: &str| {
        value
            .get(field)
            .and_then(|v| v.get("usage"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    };
    let connections = number(value, "numConsumers") + number(value, "numProducers");

    BrokerStats {
        url: broker.to_string(),
        cpu_usage: usage("cpu"),
        memory_usage: usage("memory"),
        direct_memory_usage: usage("directMemory"),
        msg_rate_in: number(value, "msgRateIn"),
        msg_rate_out: number(value, "msgRateOut"),
        connection_count: connections.max(0.0) as u64,
    }
}
