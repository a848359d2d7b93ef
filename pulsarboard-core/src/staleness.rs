use chrono::{DateTime, Utc};
use serde::Serialize;

/// Where a served value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Fetched from the upstream during this request.
    Live,
    /// Fresh cache entry.
    Cache,
    /// Expired cache entry served because the upstream failed.
    StaleCache,
    /// Snapshot or aggregation from the stats repository.
    Repository,
}

/// Staleness fact attached to every value handed to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Staleness {
    pub stale: bool,
    pub age_seconds: i64,
    pub source: DataSource,
}

impl Staleness {
    pub fn live() -> Self {
        Staleness {
            stale: false,
            age_seconds: 0,
            source: DataSource::Live,
        }
    }

    pub fn fresh(source: DataSource, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Staleness {
            stale: false,
            age_seconds: age_seconds(stored_at, now),
            source,
        }
    }

    pub fn stale(source: DataSource, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Staleness {
            stale: true,
            age_seconds: age_seconds(stored_at, now),
            source,
        }
    }
}

/// Value plus its staleness, serialized as `{value, stale, age_seconds, source}`.
#[derive(Debug, Clone, Serialize)]
pub struct Served<T> {
    pub value: T,
    #[serde(flatten)]
    pub staleness: Staleness,
}

impl<T> Served<T> {
    pub fn new(value: T, staleness: Staleness) -> Self {
        Served { value, staleness }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Served<U> {
        Served {
            value: f(self.value),
            staleness: self.staleness,
        }
    }
}

fn age_seconds(stored_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - stored_at).num_seconds().max(0)
}
