use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use pulsarboard_core::Served;

use crate::app::AppState;
use crate::http::ApiError;
use crate::read_through::ListResource;
use crate::upstream::{BrokerStats, SubscriptionStats, TopicStats};

type ReadResult<T> = Result<Json<Served<T>>, ApiError>;

async fn list(state: &AppState, resource: ListResource) -> ReadResult<Vec<String>> {
    Ok(Json(state.reads.get_list(&resource).await?))
}

pub async fn list_tenants(State(state): State<Arc<AppState>>) -> ReadResult<Vec<String>> {
    list(&state, ListResource::Tenants).await
}

pub async fn list_namespaces(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> ReadResult<Vec<String>> {
    list(&state, ListResource::Namespaces { tenant }).await
}

pub async fn list_topics(
    State(state): State<Arc<AppState>>,
    Path((tenant, namespace)): Path<(String, String)>,
) -> ReadResult<Vec<String>> {
    list(&state, ListResource::Topics { tenant, namespace }).await
}

pub async fn list_brokers(State(state): State<Arc<AppState>>) -> ReadResult<Vec<String>> {
    list(&state, ListResource::Brokers).await
}

pub async fn list_clusters(State(state): State<Arc<AppState>>) -> ReadResult<Vec<String>> {
    list(&state, ListResource::Clusters).await
}

pub async fn topic_stats(
    State(state): State<Arc<AppState>>,
    Path((tenant, namespace, topic)): Path<(String, String, String)>,
) -> ReadResult<TopicStats> {
    Ok(Json(state.reads.topic_stats(&tenant, &namespace, &topic).await?))
}

pub async fn topic_subscriptions(
    State(state): State<Arc<AppState>>,
    Path((tenant, namespace, topic)): Path<(String, String, String)>,
) -> ReadResult<Vec<SubscriptionStats>> {
    Ok(Json(
        state
            .reads
            .topic_subscriptions(&tenant, &namespace, &topic)
            .await?,
    ))
}

pub async fn broker_stats(State(state): State<Arc<AppState>>, Path(broker): Path<String>) -> ReadResult<BrokerStats> {
    Ok(Json(state.reads.broker_stats(&broker).await?))
}
