use anyhow::{anyhow, bail, Context, Result};
use pulsarboard_stats_store::PostgresOptions;
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheTtls;
use crate::environment::{Credential, Environment};
use crate::jobs::AggregatorConfig;
use crate::upstream::{BreakerConfig, RetryPolicy};

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub struct LoadConfiguration {
    /// The cluster this deployment fronts
    pub environment: EnvironmentNode,
    #[serde(default)]
    pub retry: RetryNode,
    #[serde(default)]
    pub circuit_breaker: BreakerNode,
    #[serde(default)]
    pub cache: CacheNode,
    #[serde(default)]
    pub stats_store: StatsStoreNode,
    #[serde(default)]
    pub jobs: JobsNode,
    /// HTTP API address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Prometheus exporter address
    pub prom_exporter: Option<String>,
}

/// Environment descriptor, as written in the file or sent to `PUT /api/v1/environment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentNode {
    #[serde(default = "default_environment_name")]
    pub name: String,
    pub admin_url: String,
    #[serde(default)]
    pub auth: AuthNode,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Admin API authentication, tagged by `mode`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthNode {
    #[default]
    None,
    /// Bearer token read from an environment variable or a file, never inline.
    Token {
        token_env: Option<String>,
        token_file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryNode {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for RetryNode {
    fn default() -> Self {
        RetryNode {
            max_attempts: 3,
            base_delay_ms: 1000,
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerNode {
    pub failure_threshold: u32,
    pub cool_down_ms: u64,
}

impl Default for BreakerNode {
    fn default() -> Self {
        BreakerNode {
            failure_threshold: 5,
            cool_down_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheNode {
    pub backend: CacheBackendKind,
    /// Required when `backend: redis`
    pub redis_url: Option<String>,
    pub redis_op_timeout_ms: u64,
    /// Entry count bound of the in-process cache
    pub max_capacity: u64,
    pub lists_secs: u64,
    pub stats_secs: u64,
    pub config_secs: u64,
    /// How long expired entries stay available as stale fallbacks
    pub stale_retention_secs: u64,
}

impl Default for CacheNode {
    fn default() -> Self {
        CacheNode {
            backend: CacheBackendKind::Memory,
            redis_url: None,
            redis_op_timeout_ms: 250,
            max_capacity: 100_000,
            lists_secs: 10,
            stats_secs: 5,
            config_secs: 300,
            stale_retention_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsStoreKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsStoreNode {
    pub backend: StatsStoreKind,
    /// Required when `backend: postgres`
    pub postgres_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StatsStoreNode {
    fn default() -> Self {
        StatsStoreNode {
            backend: StatsStoreKind::Memory,
            postgres_url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsNode {
    /// Disable to run the API without background collection
    pub enabled: bool,
    pub topic_stats_secs: u64,
    pub subscription_stats_secs: u64,
    pub broker_stats_secs: u64,
    pub aggregation_secs: u64,
    pub cleanup_secs: u64,
    pub retention_days: u32,
    pub aggregation_max_attempts: u32,
    pub aggregation_base_delay_ms: u64,
    /// Stat fetches in flight at once, per collector
    pub collector_concurrency: usize,
}

impl Default for JobsNode {
    fn default() -> Self {
        JobsNode {
            enabled: true,
            topic_stats_secs: 30,
            subscription_stats_secs: 30,
            broker_stats_secs: 60,
            aggregation_secs: 60,
            cleanup_secs: 86_400,
            retention_days: 7,
            aggregation_max_attempts: 3,
            aggregation_base_delay_ms: 500,
            collector_concurrency: 16,
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_environment_name() -> String {
    "default".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl LoadConfiguration {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("invalid configuration file")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = read_to_string(path)
            .with_context(|| format!("unable to read configuration file {}", path.display()))?;
        Self::from_yaml(&content)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheBackendSetting {
    Memory { max_capacity: u64 },
    Redis { url: String, op_timeout: Duration },
}

#[derive(Debug, Clone)]
pub enum StatsStoreSetting {
    Memory,
    Postgres(PostgresOptions),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub backend: CacheBackendSetting,
    pub ttls: CacheTtls,
    pub stale_retention: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    pub enabled: bool,
    pub topic_stats_every: Duration,
    pub subscription_stats_every: Duration,
    pub broker_stats_every: Duration,
    pub aggregation_every: Duration,
    pub cleanup_every: Duration,
    pub retention_days: u32,
    pub collector_concurrency: usize,
    pub aggregator: AggregatorConfig,
}

/// Validated settings the gateway runs with.
#[derive(Debug, Clone)]
pub struct ServiceConfiguration {
    pub environment: Environment,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub cache: CacheSettings,
    pub stats_store: StatsStoreSetting,
    pub jobs: JobSettings,
    pub listen_addr: SocketAddr,
    pub prom_exporter: Option<SocketAddr>,
}

impl ServiceConfiguration {
    pub fn load(path: &Path) -> Result<Self> {
        LoadConfiguration::from_file(path)?.try_into()
    }
}

impl TryFrom<EnvironmentNode> for Environment {
    type Error = anyhow::Error;

    fn try_from(node: EnvironmentNode) -> Result<Self> {
        let admin_url = node.admin_url.trim().trim_end_matches('/').to_string();
        if !(admin_url.starts_with("http://") || admin_url.starts_with("https://")) {
            bail!("environment.admin_url must be an http(s) URL, got {:?}", node.admin_url);
        }
        if node.name.trim().is_empty() {
            bail!("environment.name must not be empty");
        }
        if node.request_timeout_ms == 0 {
            bail!("environment.request_timeout_ms must be positive");
        }

        let credential = match node.auth {
            AuthNode::None => Credential::None,
            AuthNode::Token {
                token_env: Some(var),
                token_file: None,
            } => Credential::TokenEnv(var),
            AuthNode::Token {
                token_env: None,
                token_file: Some(path),
            } => Credential::TokenFile(path),
            AuthNode::Token { .. } => {
                bail!("environment.auth token mode needs exactly one of token_env or token_file")
            }
        };

        Ok(Environment {
            name: node.name,
            admin_url,
            credential,
            request_timeout: Duration::from_millis(node.request_timeout_ms),
        })
    }
}

/// Implementing the TryFrom trait to transform LoadConfiguration into ServiceConfiguration
impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        let environment = Environment::try_from(config.environment)?;

        let retry = &config.retry;
        if retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if retry.factor <= 1.0 {
            bail!("retry.factor must be greater than 1 so delays grow");
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            bail!("retry.jitter must be within [0, 1]");
        }
        let retry = RetryPolicy {
            max_attempts: retry.max_attempts,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            factor: retry.factor,
            jitter: retry.jitter,
        };

        if config.circuit_breaker.failure_threshold == 0 {
            bail!("circuit_breaker.failure_threshold must be at least 1");
        }
        let breaker = BreakerConfig {
            failure_threshold: config.circuit_breaker.failure_threshold,
            cool_down: Duration::from_millis(config.circuit_breaker.cool_down_ms),
        };

        let cache_node = config.cache;
        let backend = match cache_node.backend {
            CacheBackendKind::Memory => CacheBackendSetting::Memory {
                max_capacity: cache_node.max_capacity,
            },
            CacheBackendKind::Redis => CacheBackendSetting::Redis {
                url: cache_node
                    .redis_url
                    .ok_or_else(|| anyhow!("cache.redis_url is required for the redis backend"))?,
                op_timeout: Duration::from_millis(cache_node.redis_op_timeout_ms),
            },
        };
        for (field, secs) in [
            ("cache.lists_secs", cache_node.lists_secs),
            ("cache.stats_secs", cache_node.stats_secs),
            ("cache.config_secs", cache_node.config_secs),
        ] {
            if secs == 0 {
                bail!("{} must be positive", field);
            }
        }
        let cache = CacheSettings {
            backend,
            ttls: CacheTtls {
                lists: Duration::from_secs(cache_node.lists_secs),
                stats: Duration::from_secs(cache_node.stats_secs),
                config: Duration::from_secs(cache_node.config_secs),
            },
            stale_retention: Duration::from_secs(cache_node.stale_retention_secs),
        };

        let stats_store = match config.stats_store.backend {
            StatsStoreKind::Memory => StatsStoreSetting::Memory,
            StatsStoreKind::Postgres => {
                let url = config
                    .stats_store
                    .postgres_url
                    .ok_or_else(|| anyhow!("stats_store.postgres_url is required for the postgres backend"))?;
                let mut options = PostgresOptions::new(url);
                options.max_connections = config.stats_store.max_connections.max(1);
                StatsStoreSetting::Postgres(options)
            }
        };

        let jobs_node = config.jobs;
        for (field, secs) in [
            ("jobs.topic_stats_secs", jobs_node.topic_stats_secs),
            ("jobs.subscription_stats_secs", jobs_node.subscription_stats_secs),
            ("jobs.broker_stats_secs", jobs_node.broker_stats_secs),
            ("jobs.aggregation_secs", jobs_node.aggregation_secs),
            ("jobs.cleanup_secs", jobs_node.cleanup_secs),
        ] {
            if secs == 0 {
                bail!("{} must be positive", field);
            }
        }
        if jobs_node.retention_days == 0 {
            bail!("jobs.retention_days must be at least 1");
        }
        let jobs = JobSettings {
            enabled: jobs_node.enabled,
            topic_stats_every: Duration::from_secs(jobs_node.topic_stats_secs),
            subscription_stats_every: Duration::from_secs(jobs_node.subscription_stats_secs),
            broker_stats_every: Duration::from_secs(jobs_node.broker_stats_secs),
            aggregation_every: Duration::from_secs(jobs_node.aggregation_secs),
            cleanup_every: Duration::from_secs(jobs_node.cleanup_secs),
            retention_days: jobs_node.retention_days,
            collector_concurrency: jobs_node.collector_concurrency.max(1),
            aggregator: AggregatorConfig {
                max_attempts: jobs_node.aggregation_max_attempts.max(1),
                base_delay: Duration::from_millis(jobs_node.aggregation_base_delay_ms),
                concurrency: jobs_node.collector_concurrency.max(1),
                snapshot_horizon: Duration::from_secs(jobs_node.topic_stats_secs.saturating_mul(2)),
            },
        };

        let listen_addr: SocketAddr = config
            .listen_addr
            .parse()
            .with_context(|| format!("Failed to parse listen_addr: {}", config.listen_addr))?;

        let prom_exporter = match config.prom_exporter {
            Some(addr) => Some(
                addr.parse()
                    .with_context(|| format!("Failed to parse prom_exporter: {}", addr))?,
            ),
            None => None,
        };

        Ok(ServiceConfiguration {
            environment,
            retry,
            breaker,
            cache,
            stats_store,
            jobs,
            listen_addr,
            prom_exporter,
        })
    }
}

/// Re-read only the environment section of the config file, for an explicit reload.
pub fn reload_environment(path: &Path) -> Result<Environment> {
    Environment::try_from(LoadConfiguration::from_file(path)?.environment)
}
