//! Background jobs: stats collectors, the aggregator and snapshot cleanup.
//!
//! Each job runs as its own periodic task. Jobs never call each other; they
//! meet only in the cache and the stats repository.

mod aggregator;
pub use aggregator::{Aggregator, AggregatorConfig};

mod cleanup;
pub use cleanup::CleanupJob;

mod collector;
pub use collector::{BrokerStatsCollector, CollectorContext, SubscriptionStatsCollector, TopicStatsCollector};

#[cfg(test)]
mod aggregator_test;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::gateway_metrics::{COLLECTOR_CYCLES_TOTAL, JOB_CYCLE_DURATION_SECONDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Every unit of work succeeded.
    Success,
    /// Some resources or keys failed; the rest were persisted.
    PartialFailure,
    /// Nothing was persisted this cycle (enumeration or repository write failed).
    Failed,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Success => "success",
            CycleOutcome::PartialFailure => "partial_failure",
            CycleOutcome::Failed => "failed",
        }
    }
}

/// Summary of one job cycle.
///
/// `fetched` counts units of work attempted successfully, `failed` those that
/// were skipped, `persisted` the rows written (or removed, for cleanup).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub fetched: u64,
    pub failed: u64,
    pub persisted: u64,
}

impl CycleReport {
    pub fn completed(fetched: u64, failed: u64, persisted: u64) -> Self {
        let outcome = if failed == 0 {
            CycleOutcome::Success
        } else {
            CycleOutcome::PartialFailure
        };
        CycleReport {
            outcome,
            fetched,
            failed,
            persisted,
        }
    }

    pub fn failed(fetched: u64, failed: u64) -> Self {
        CycleReport {
            outcome: CycleOutcome::Failed,
            fetched,
            failed,
            persisted: 0,
        }
    }
}

#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// One full cycle. Failures are reported, never raised: the schedule must
    /// not depend on how the previous cycle went.
    async fn run_once(&self) -> CycleReport;
}

/// Run `job` every `every` until `shutdown` flips to `true`.
///
/// The first cycle starts immediately. A cycle in progress is allowed to
/// finish; an overrunning cycle delays the next tick rather than bursting.
pub fn spawn_periodic(job: Arc<dyn Job>, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = job.name();
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(job = name, every_secs = every.as_secs(), "background job started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let started = Instant::now();
            let report = job.run_once().await;
            let elapsed = started.elapsed();
            record_cycle(name, &report, elapsed);
        }

        info!(job = name, "background job stopped");
    })
}

fn record_cycle(job: &'static str, report: &CycleReport, elapsed: Duration) {
    histogram!(JOB_CYCLE_DURATION_SECONDS.name, "job" => job).record(elapsed.as_secs_f64());
    counter!(COLLECTOR_CYCLES_TOTAL.name, "job" => job, "outcome" => report.outcome.as_str()).increment(1);

    match report.outcome {
        CycleOutcome::Success => info!(
            job,
            fetched = report.fetched,
            persisted = report.persisted,
            elapsed_ms = elapsed.as_millis() as u64,
            "job cycle succeeded"
        ),
        CycleOutcome::PartialFailure => warn!(
            job,
            fetched = report.fetched,
            failed = report.failed,
            persisted = report.persisted,
            elapsed_ms = elapsed.as_millis() as u64,
            "job cycle finished with failures"
        ),
        CycleOutcome::Failed => warn!(
            job,
            fetched = report.fetched,
            failed = report.failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "job cycle failed"
        ),
    }
}
