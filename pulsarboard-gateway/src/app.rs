use axum::extract::State;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use pulsarboard_core::{Clock, StatsRepository};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::cache::{CacheBackend, CacheStore, CacheTtls};
use crate::config::{JobSettings, ServiceConfiguration};
use crate::environment::{Environment, EnvironmentHandle, EnvironmentView};
use crate::jobs::{
    spawn_periodic, Aggregator, BrokerStatsCollector, CleanupJob, CollectorContext, SubscriptionStatsCollector,
    TopicStatsCollector,
};
use crate::read_through::ReadThroughService;
use crate::ui::{aggregations, environment, history, mutations, reads};
use crate::upstream::{BreakerConfig, CircuitReport, CircuitStatus, PulsarAdmin, RetryPolicy, Transport, UpstreamClient};

/// Tunables of the request path, split from [`ServiceConfiguration`] so
/// tests can build an [`AppState`] without a config file.
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub ttls: CacheTtls,
    pub stale_retention: Duration,
    /// Aggregator cadence; rollups older than twice this are reported stale.
    pub aggregation_every: Duration,
    /// File re-read by `POST /api/v1/environment/reload`.
    pub config_path: Option<PathBuf>,
}

impl AppOptions {
    pub fn from_config(config: &ServiceConfiguration, config_path: Option<PathBuf>) -> Self {
        AppOptions {
            retry: config.retry.clone(),
            breaker: config.breaker.clone(),
            ttls: config.cache.ttls.clone(),
            stale_retention: config.cache.stale_retention,
            aggregation_every: config.jobs.aggregation_every,
            config_path,
        }
    }
}

pub struct AppState {
    pub environment: EnvironmentHandle,
    pub client: Arc<UpstreamClient>,
    pub admin: PulsarAdmin,
    pub cache: Arc<CacheStore>,
    pub reads: Arc<ReadThroughService>,
    pub repository: Arc<dyn StatsRepository>,
    pub clock: Arc<dyn Clock>,
    pub aggregation_every: Duration,
    pub config_path: Option<PathBuf>,
    // serializes environment swaps with their breaker reset and cache flush
    environment_update: Mutex<()>,
}

pub fn create_app_state(
    environment: EnvironmentHandle,
    transport: Arc<dyn Transport>,
    cache_backend: Arc<dyn CacheBackend>,
    repository: Arc<dyn StatsRepository>,
    clock: Arc<dyn Clock>,
    options: AppOptions,
) -> Arc<AppState> {
    let client = Arc::new(UpstreamClient::new(
        transport,
        environment.clone(),
        options.retry,
        options.breaker,
    ));
    let admin = PulsarAdmin::new(client.clone());
    let cache = Arc::new(CacheStore::new(
        cache_backend,
        clock.clone(),
        options.ttls,
        options.stale_retention,
    ));
    let reads = Arc::new(ReadThroughService::new(
        admin.clone(),
        cache.clone(),
        repository.clone(),
        clock.clone(),
    ));

    Arc::new(AppState {
        environment,
        client,
        admin,
        cache,
        reads,
        repository,
        clock,
        aggregation_every: options.aggregation_every,
        config_path: options.config_path,
        environment_update: Mutex::new(()),
    })
}

impl AppState {
    /// Swap the active environment. Breakers and every cached value belong to
    /// the previous cluster, so both are dropped before the call returns.
    pub async fn apply_environment(&self, environment: Environment) -> EnvironmentView {
        let _guard = self.environment_update.lock().await;
        let view = environment.view();
        let previous = self.environment.replace(environment);
        self.client.reset_breakers();
        self.cache.clear().await;
        info!(
            from = %previous.name,
            to = %view.name,
            admin_url = %view.admin_url,
            "environment updated, breakers reset and cache cleared"
        );
        view
    }

    pub fn collector_context(&self, concurrency: usize) -> CollectorContext {
        CollectorContext {
            admin: self.admin.clone(),
            topology: self.reads.clone(),
            repository: self.repository.clone(),
            cache: self.cache.clone(),
            clock: self.clock.clone(),
            concurrency,
        }
    }
}

/// Start every background job on its own schedule.
pub fn spawn_jobs(state: &AppState, settings: &JobSettings, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let ctx = state.collector_context(settings.collector_concurrency);
    let aggregator = Aggregator::new(
        state.reads.clone(),
        state.repository.clone(),
        state.clock.clone(),
        settings.aggregator.clone(),
    );
    let cleanup = CleanupJob::new(state.repository.clone(), state.clock.clone(), settings.retention_days);

    vec![
        spawn_periodic(
            Arc::new(TopicStatsCollector::new(ctx.clone())),
            settings.topic_stats_every,
            shutdown.clone(),
        ),
        spawn_periodic(
            Arc::new(SubscriptionStatsCollector::new(ctx.clone())),
            settings.subscription_stats_every,
            shutdown.clone(),
        ),
        spawn_periodic(
            Arc::new(BrokerStatsCollector::new(ctx)),
            settings.broker_stats_every,
            shutdown.clone(),
        ),
        spawn_periodic(Arc::new(aggregator), settings.aggregation_every, shutdown.clone()),
        spawn_periodic(Arc::new(cleanup), settings.cleanup_every, shutdown),
    ]
}

#[derive(Serialize)]
struct HealthDto {
    status: &'static str,
    environment: String,
    stats_store_reachable: bool,
    loads_in_flight: usize,
    circuits: Vec<CircuitReport>,
}

pub fn build_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::permissive();

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/tenants", get(reads::list_tenants))
        .route(
            "/api/v1/tenants/{tenant}",
            put(mutations::create_tenant).delete(mutations::delete_tenant),
        )
        .route("/api/v1/tenants/{tenant}/namespaces", get(reads::list_namespaces))
        .route(
            "/api/v1/namespaces/{tenant}/{namespace}",
            put(mutations::create_namespace).delete(mutations::delete_namespace),
        )
        .route("/api/v1/namespaces/{tenant}/{namespace}/topics", get(reads::list_topics))
        .route(
            "/api/v1/topics/{tenant}/{namespace}/{topic}",
            put(mutations::create_topic).delete(mutations::delete_topic),
        )
        .route("/api/v1/topics/{tenant}/{namespace}/{topic}/stats", get(reads::topic_stats))
        .route(
            "/api/v1/topics/{tenant}/{namespace}/{topic}/subscriptions",
            get(reads::topic_subscriptions),
        )
        .route("/api/v1/topics/{tenant}/{namespace}/{topic}/history", get(history::topic_history))
        .route("/api/v1/brokers", get(reads::list_brokers))
        .route("/api/v1/brokers/{broker}/stats", get(reads::broker_stats))
        .route("/api/v1/brokers/{broker}/history", get(history::broker_history))
        .route("/api/v1/clusters", get(reads::list_clusters))
        .route("/api/v1/aggregations/tenants", get(aggregations::list_tenants))
        .route("/api/v1/aggregations/tenants/{tenant}", get(aggregations::tenant))
        .route(
            "/api/v1/aggregations/namespaces/{tenant}/{namespace}",
            get(aggregations::namespace),
        )
        .route(
            "/api/v1/environment",
            get(environment::get_environment).put(environment::put_environment),
        )
        .route("/api/v1/environment/reload", post(environment::reload_environment))
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthDto> {
    let circuits = state.client.circuit_reports();
    let stats_store_reachable = state.repository.ping().await.is_ok();
    let all_closed = circuits.iter().all(|c| c.status == CircuitStatus::Closed);
    let status = if all_closed && stats_store_reachable {
        "ok"
    } else {
        "degraded"
    };
    Json(HealthDto {
        status,
        environment: state.environment.current().name.clone(),
        stats_store_reachable,
        loads_in_flight: state.cache.loads_in_flight(),
        circuits,
    })
}
