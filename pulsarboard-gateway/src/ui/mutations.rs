use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::validate_name;
use crate::app::AppState;
use crate::http::ApiError;

#[derive(Debug, Default, Deserialize)]
pub struct CreateTenantRequest {
    #[serde(default)]
    pub allowed_clusters: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateTopicQuery {
    pub partitions: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteTopicQuery {
    #[serde(default)]
    pub partitioned: bool,
}

#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub success: bool,
    pub message: String,
}

fn done(message: String) -> Json<MutationResponse> {
    info!(%message, "admin mutation applied");
    Json(MutationResponse { success: true, message })
}

/// Create a tenant. Without an explicit cluster list the tenant is allowed on
/// every cluster the upstream knows.
pub async fn create_tenant(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    body: Option<Json<CreateTenantRequest>>,
) -> Result<Json<MutationResponse>, ApiError> {
    validate_name("tenant", &tenant)?;
    let mut allowed_clusters = body.map(|Json(req)| req.allowed_clusters).unwrap_or_default();
    if allowed_clusters.is_empty() {
        allowed_clusters = state.admin.list_clusters().await?;
    }

    state.admin.create_tenant(&tenant, &allowed_clusters).await?;
    state.cache.invalidate_tenant(&tenant).await;
    Ok(done(format!("tenant {} created", tenant)))
}

pub async fn delete_tenant(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> Result<Json<MutationResponse>, ApiError> {
    validate_name("tenant", &tenant)?;
    state.admin.delete_tenant(&tenant).await?;
    state.cache.invalidate_tenant(&tenant).await;
    Ok(done(format!("tenant {} deleted", tenant)))
}

pub async fn create_namespace(
    State(state): State<Arc<AppState>>,
    Path((tenant, namespace)): Path<(String, String)>,
) -> Result<Json<MutationResponse>, ApiError> {
    validate_name("tenant", &tenant)?;
    validate_name("namespace", &namespace)?;
    state.admin.create_namespace(&tenant, &namespace).await?;
    state.cache.invalidate_namespace(&tenant, &namespace).await;
    Ok(done(format!("namespace {}/{} created", tenant, namespace)))
}

pub async fn delete_namespace(
    State(state): State<Arc<AppState>>,
    Path((tenant, namespace)): Path<(String, String)>,
) -> Result<Json<MutationResponse>, ApiError> {
    validate_name("tenant", &tenant)?;
    validate_name("namespace", &namespace)?;
    state.admin.delete_namespace(&tenant, &namespace).await?;
    state.cache.invalidate_namespace(&tenant, &namespace).await;
    Ok(done(format!("namespace {}/{} deleted", tenant, namespace)))
}

pub async fn create_topic(
    State(state): State<Arc<AppState>>,
    Path((tenant, namespace, topic)): Path<(String, String, String)>,
    Query(query): Query<CreateTopicQuery>,
) -> Result<Json<MutationResponse>, ApiError> {
    validate_name("tenant", &tenant)?;
    validate_name("namespace", &namespace)?;
    validate_name("topic", &topic)?;
    state
        .admin
        .create_topic(&tenant, &namespace, &topic, query.partitions)
        .await?;
    state.cache.invalidate_topic(&tenant, &namespace, &topic).await;

    let message = match query.partitions {
        Some(n) if n > 0 => format!("topic {}/{}/{} created with {} partitions", tenant, namespace, topic, n),
        _ => format!("topic {}/{}/{} created", tenant, namespace, topic),
    };
    Ok(done(message))
}

pub async fn delete_topic(
    State(state): State<Arc<AppState>>,
    Path((tenant, namespace, topic)): Path<(String, String, String)>,
    Query(query): Query<DeleteTopicQuery>,
) -> Result<Json<MutationResponse>, ApiError> {
    validate_name("tenant", &tenant)?;
    validate_name("namespace", &namespace)?;
    validate_name("topic", &topic)?;
    state
        .admin
        .delete_topic(&tenant, &namespace, &topic, query.partitioned)
        .await?;
    state.cache.invalidate_topic(&tenant, &namespace, &topic).await;
    Ok(done(format!("topic {}/{}/{} deleted", tenant, namespace, topic)))
}
