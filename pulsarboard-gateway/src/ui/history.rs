use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use pulsarboard_core::{DataSource, ResourceKey, ResourceKind, Served, StatSnapshot, Staleness};
use serde::Deserialize;

use crate::app::AppState;
use crate::http::ApiError;

const DEFAULT_WINDOW_MINUTES: i64 = 60;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

async fn history(
    state: &AppState,
    kind: ResourceKind,
    key: ResourceKey,
    query: HistoryQuery,
) -> Result<Json<Served<Vec<StatSnapshot>>>, ApiError> {
    let now = state.clock.now();
    let to = query.to.unwrap_or(now);
    let from = query.from.unwrap_or(to - Duration::minutes(DEFAULT_WINDOW_MINUTES));

    let snapshots = state.repository.range(kind, &key, from, to).await?;
    let newest = snapshots.last().map(|s| s.collected_at).unwrap_or(now);
    Ok(Json(Served::new(
        snapshots,
        Staleness::fresh(DataSource::Repository, newest, now),
    )))
}

/// Persisted snapshots of one topic, oldest first. Defaults to the last hour.
pub async fn topic_history(
    State(state): State<Arc<AppState>>,
    Path((tenant, namespace, topic)): Path<(String, String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Served<Vec<StatSnapshot>>>, ApiError> {
    let key = ResourceKey::topic(&tenant, &namespace, &topic);
    history(&state, ResourceKind::Topic, key, query).await
}

pub async fn broker_history(
    State(state): State<Arc<AppState>>,
    Path(broker): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Served<Vec<StatSnapshot>>>, ApiError> {
    history(&state, ResourceKind::Broker, ResourceKey::broker(&broker), query).await
}
