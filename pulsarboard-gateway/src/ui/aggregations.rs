use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use pulsarboard_core::{Aggregation, AggregationType, DataSource, Scope, Served, Staleness};

use crate::app::AppState;
use crate::http::ApiError;

/// Rollups are stale once they have missed two aggregation cycles.
fn staleness(state: &AppState, computed_at: DateTime<Utc>) -> Staleness {
    let now = state.clock.now();
    let limit = chrono::Duration::from_std(state.aggregation_every * 2).unwrap_or(chrono::Duration::MAX);
    if now - computed_at > limit {
        Staleness::stale(DataSource::Repository, computed_at, now)
    } else {
        Staleness::fresh(DataSource::Repository, computed_at, now)
    }
}

async fn one(state: &AppState, scope: Scope) -> Result<Json<Served<Aggregation>>, ApiError> {
    let aggregation = state
        .repository
        .get_aggregation(scope.aggregation_type(), &scope.aggregation_key())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no aggregation for {}", scope)))?;
    let staleness = staleness(state, aggregation.computed_at);
    Ok(Json(Served::new(aggregation, staleness)))
}

/// Every tenant rollup; the reported age is that of the oldest one.
pub async fn list_tenants(State(state): State<Arc<AppState>>) -> Result<Json<Served<Vec<Aggregation>>>, ApiError> {
    let aggregations = state.repository.list_aggregations(AggregationType::Tenant).await?;
    let staleness = match aggregations.iter().map(|a| a.computed_at).min() {
        Some(oldest) => staleness(&state, oldest),
        None => Staleness::fresh(DataSource::Repository, state.clock.now(), state.clock.now()),
    };
    Ok(Json(Served::new(aggregations, staleness)))
}

pub async fn tenant(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> Result<Json<Served<Aggregation>>, ApiError> {
    one(&state, Scope::tenant(tenant)).await
}

pub async fn namespace(
    State(state): State<Arc<AppState>>,
    Path((tenant, namespace)): Path<(String, String)>,
) -> Result<Json<Served<Aggregation>>, ApiError> {
    one(&state, Scope::namespace(tenant, namespace)).await
}
