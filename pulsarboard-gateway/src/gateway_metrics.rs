use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 10] = [
    UPSTREAM_REQUESTS_TOTAL,
    UPSTREAM_RETRIES_TOTAL,
    CACHE_HITS_TOTAL,
    CACHE_MISSES_TOTAL,
    CACHE_COALESCED_TOTAL,
    CACHE_ERRORS_TOTAL,
    READ_FALLBACKS_TOTAL,
    COLLECTOR_CYCLES_TOTAL,
    SNAPSHOTS_PERSISTED_TOTAL,
    AGGREGATIONS_UPSERTED_TOTAL,
];
pub(crate) const GAUGES: [Metric; 1] = [CIRCUIT_STATE];
pub(crate) const HISTOGRAMS: [Metric; 2] = [UPSTREAM_LATENCY_MS, JOB_CYCLE_DURATION_SECONDS];

// UPSTREAM Metrics --------------------------

pub(crate) const UPSTREAM_REQUESTS_TOTAL: Metric = Metric {
    name: "pulsarboard_upstream_requests_total",
    description: "Admin API attempts by target and outcome",
};

pub(crate) const UPSTREAM_RETRIES_TOTAL: Metric = Metric {
    name: "pulsarboard_upstream_retries_total",
    description: "Admin API attempts repeated after a transient failure",
};

pub(crate) const UPSTREAM_LATENCY_MS: Metric = Metric {
    name: "pulsarboard_upstream_latency_ms",
    description: "Latency of a single admin API attempt in milliseconds",
};

pub(crate) const CIRCUIT_STATE: Metric = Metric {
    name: "pulsarboard_circuit_state",
    description: "Circuit breaker state per target (0=closed,1=half_open,2=open)",
};

// CACHE Metrics --------------------------

pub(crate) const CACHE_HITS_TOTAL: Metric = Metric {
    name: "pulsarboard_cache_hits_total",
    description: "Reads answered by a fresh cache entry",
};

pub(crate) const CACHE_MISSES_TOTAL: Metric = Metric {
    name: "pulsarboard_cache_misses_total",
    description: "Reads that started an upstream load",
};

pub(crate) const CACHE_COALESCED_TOTAL: Metric = Metric {
    name: "pulsarboard_cache_coalesced_total",
    description: "Reads that joined a load already in flight for the same key",
};

pub(crate) const CACHE_ERRORS_TOTAL: Metric = Metric {
    name: "pulsarboard_cache_errors_total",
    description: "Cache backend operations that failed and were degraded",
};

pub(crate) const READ_FALLBACKS_TOTAL: Metric = Metric {
    name: "pulsarboard_read_fallbacks_total",
    description: "Reads served from an older value because the upstream failed",
};

// JOB Metrics --------------------------

pub(crate) const COLLECTOR_CYCLES_TOTAL: Metric = Metric {
    name: "pulsarboard_job_cycles_total",
    description: "Background job cycles by job and outcome",
};

pub(crate) const SNAPSHOTS_PERSISTED_TOTAL: Metric = Metric {
    name: "pulsarboard_snapshots_persisted_total",
    description: "Stat snapshots written to the stats repository",
};

pub(crate) const AGGREGATIONS_UPSERTED_TOTAL: Metric = Metric {
    name: "pulsarboard_aggregations_upserted_total",
    description: "Tenant and namespace rollups written by the aggregator",
};

pub(crate) const JOB_CYCLE_DURATION_SECONDS: Metric = Metric {
    name: "pulsarboard_job_cycle_duration_seconds",
    description: "Wall time of one background job cycle",
};

/// Installs the Prometheus exporter (when an address is given) and describes
/// every series up front so they show on the first scrape.
pub fn init_metrics(prom_addr: Option<SocketAddr>) -> anyhow::Result<()> {
    info!("initializing metrics exporter");

    if let Some(addr) = prom_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus recorder")?;
        info!(addr = %addr, "prometheus exporter listening");
    }

    for metric in COUNTERS {
        metrics::describe_counter!(metric.name, metric.description);
    }
    for metric in GAUGES {
        metrics::describe_gauge!(metric.name, metric.description);
    }
    for metric in HISTOGRAMS {
        metrics::describe_histogram!(metric.name, metric.description);
    }
    Ok(())
}
