use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pulsarboard_core::{StatsRepository, SystemClock};
use pulsarboard_gateway::app::{build_router, create_app_state, spawn_jobs, AppOptions};
use pulsarboard_gateway::cache::{CacheBackend, MemoryCache, RedisCache};
use pulsarboard_gateway::config::{CacheBackendSetting, ServiceConfiguration, StatsStoreSetting};
use pulsarboard_gateway::environment::EnvironmentHandle;
use pulsarboard_gateway::gateway_metrics::init_metrics;
use pulsarboard_gateway::upstream::HttpTransport;
use pulsarboard_stats_store::{MemoryStatsRepository, PostgresStatsRepository, StatsStorage};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "pulsarboard-gateway")]
#[command(about = "Cached, self-healing dashboard API over the Pulsar admin API", long_about = None)]
#[command(version)]
struct ServerArgs {
    /// Path to the YAML configuration file
    #[arg(long, env = "PULSARBOARD_CONFIG", default_value = "config/pulsarboard.yaml")]
    config_file: PathBuf,

    /// HTTP API listen address, overrides `listen_addr`
    #[arg(long, env = "PULSARBOARD_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Pulsar admin API base URL, overrides `environment.admin_url`
    #[arg(long, env = "PULSARBOARD_ADMIN_URL")]
    admin_url: Option<String>,

    /// Prometheus exporter address, overrides `prom_exporter`
    #[arg(long)]
    prom_exporter: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = ServerArgs::parse();

    let mut service_config = ServiceConfiguration::load(&args.config_file)?;

    if let Some(listen_addr) = args.listen_addr {
        let listen_address: SocketAddr = listen_addr
            .parse()
            .context(format!("Failed to parse into Socket address: {}", listen_addr))?;
        service_config.listen_addr = listen_address;
    }

    if let Some(admin_url) = args.admin_url {
        if !(admin_url.starts_with("http://") || admin_url.starts_with("https://")) {
            bail!("--admin-url must be an http(s) URL, got {:?}", admin_url);
        }
        service_config.environment.admin_url = admin_url.trim_end_matches('/').to_string();
    }

    if let Some(prom_exporter) = args.prom_exporter {
        let prom_address: SocketAddr = prom_exporter
            .parse()
            .context(format!("Failed to parse into Socket address: {}", prom_exporter))?;
        service_config.prom_exporter = Some(prom_address);
    }

    init_metrics(service_config.prom_exporter)?;

    let repository: Arc<dyn StatsRepository> = match &service_config.stats_store {
        StatsStoreSetting::Postgres(options) => {
            info!("Initializing Postgres as stats store");
            let store = PostgresStatsRepository::connect(options)
                .await
                .context("unable to connect to the stats store")?;
            Arc::new(StatsStorage::Postgres(store))
        }
        StatsStoreSetting::Memory => {
            warn!("Using the in-memory stats store, history is lost on restart");
            Arc::new(StatsStorage::InMemory(MemoryStatsRepository::new()))
        }
    };

    let cache_backend: Arc<dyn CacheBackend> = match &service_config.cache.backend {
        CacheBackendSetting::Redis { url, op_timeout } => {
            let cache = RedisCache::connect(url, *op_timeout)
                .await
                .context("unable to connect to the redis cache")?;
            Arc::new(cache)
        }
        CacheBackendSetting::Memory { max_capacity } => Arc::new(MemoryCache::new(*max_capacity)),
    };

    let environment = EnvironmentHandle::new(service_config.environment.clone());
    let transport = Arc::new(HttpTransport::new(environment.clone())?);

    let state = create_app_state(
        environment,
        transport,
        cache_backend,
        repository,
        Arc::new(SystemClock),
        AppOptions::from_config(&service_config, Some(args.config_file.clone())),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let jobs = if service_config.jobs.enabled {
        spawn_jobs(&state, &service_config.jobs, shutdown_rx.clone())
    } else {
        info!("Background jobs disabled");
        Vec::new()
    };

    let router = build_router(state.clone());
    let listener = TcpListener::bind(service_config.listen_addr).await?;
    info!(
        addr = %service_config.listen_addr,
        environment = %service_config.environment.name,
        admin_url = %service_config.environment.admin_url,
        "Starting HTTP server"
    );

    let mut server_shutdown = shutdown_rx;
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    });

    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "unable to listen for shutdown signal");
            // keep the sender alive, dropping it would stop everything
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    for job in jobs {
        let _ = job.await;
    }
    info!("pulsarboard-gateway stopped");
    Ok(())
}
