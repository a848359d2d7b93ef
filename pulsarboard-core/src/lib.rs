pub mod clock;
pub mod model;
pub mod staleness;
pub mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use model::{
    metric, Aggregation, AggregationType, ResourceKey, ResourceKind, Scope, StatSnapshot,
};
pub use staleness::{DataSource, Served, Staleness};
pub use stats::{MemoryStatsRepository, RepositoryError, StatsRepository};
