use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use pulsarboard_core::{Clock, StatsRepository};
use std::sync::Arc;
use tracing::warn;

use super::{CycleReport, Job};

/// Purges snapshots past the retention window. Aggregations are left alone.
pub struct CleanupJob {
    repository: Arc<dyn StatsRepository>,
    clock: Arc<dyn Clock>,
    retention: ChronoDuration,
}

impl CleanupJob {
    pub fn new(repository: Arc<dyn StatsRepository>, clock: Arc<dyn Clock>, retention_days: u32) -> Self {
        CleanupJob {
            repository,
            clock,
            retention: ChronoDuration::days(i64::from(retention_days)),
        }
    }
}

#[async_trait]
impl Job for CleanupJob {
    fn name(&self) -> &'static str {
        "snapshot_cleanup"
    }

    async fn run_once(&self) -> CycleReport {
        let cutoff = self.clock.now() - self.retention;
        match self.repository.purge_older_than(cutoff).await {
            Ok(purged) => CycleReport::completed(0, 0, purged),
            Err(err) => {
                warn!(cutoff = %cutoff, error = %err, "snapshot purge failed");
                CycleReport::failed(0, 1)
            }
        }
    }
}
