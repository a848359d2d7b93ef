use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::app::AppState;
use crate::config::{self, EnvironmentNode};
use crate::environment::{Environment, EnvironmentView};
use crate::http::ApiError;

pub async fn get_environment(State(state): State<Arc<AppState>>) -> Json<EnvironmentView> {
    Json(state.environment.current().view())
}

pub async fn put_environment(
    State(state): State<Arc<AppState>>,
    Json(node): Json<EnvironmentNode>,
) -> Result<Json<EnvironmentView>, ApiError> {
    let environment = Environment::try_from(node).map_err(|e| ApiError::bad_request(format!("{:#}", e)))?;
    Ok(Json(state.apply_environment(environment).await))
}

/// Re-read the environment section of the config file the gateway started with.
pub async fn reload_environment(State(state): State<Arc<AppState>>) -> Result<Json<EnvironmentView>, ApiError> {
    let path = state
        .config_path
        .clone()
        .ok_or_else(|| ApiError::bad_request("gateway was started without a config file"))?;
    let environment = config::reload_environment(&path)
        .map_err(|e| ApiError::bad_request(format!("reload from {} failed: {:#}", path.display(), e)))?;
    Ok(Json(state.apply_environment(environment).await))
}
