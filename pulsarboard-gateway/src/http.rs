use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use pulsarboard_core::stats::RepositoryError;
use serde_json::{json, Value};
use std::time::Duration;

use crate::read_through::ReadError;
use crate::upstream::UpstreamError;

// hint used when the failure itself carries none
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Error response: status, JSON body and an optional `Retry-After`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: json!({ "error": message.into(), "code": code }),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn unavailable(code: &str, message: String, retry_after: Duration) -> Self {
        let seconds = retry_after.as_secs().max(1);
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: json!({ "error": message, "code": code, "retry_after_seconds": seconds }),
            retry_after: Some(Duration::from_secs(seconds)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Map an upstream failure onto the HTTP status the dashboard sees.
pub fn map_error(err: &UpstreamError) -> ApiError {
    let message = err.to_string();
    match err {
        UpstreamError::ClientError { status, .. } => {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            ApiError::new(status, err.kind(), message)
        }
        UpstreamError::Unauthorized { status } => {
            let status = if *status == 403 {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::UNAUTHORIZED
            };
            ApiError::new(status, err.kind(), message)
        }
        UpstreamError::Timeout => ApiError::new(StatusCode::GATEWAY_TIMEOUT, err.kind(), message),
        UpstreamError::Unavailable(_) | UpstreamError::CircuitOpen { .. } => ApiError::unavailable(
            err.kind(),
            message,
            err.retry_after().unwrap_or(DEFAULT_RETRY_AFTER),
        ),
        UpstreamError::Decode(_) => ApiError::new(StatusCode::BAD_GATEWAY, err.kind(), message),
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        map_error(&err)
    }
}

impl From<ReadError> for ApiError {
    fn from(err: ReadError) -> Self {
        match &err {
            ReadError::NoFallbackAvailable(cause) => ApiError::unavailable(
                "no_fallback_available",
                err.to_string(),
                cause.retry_after().unwrap_or(DEFAULT_RETRY_AFTER),
            ),
            ReadError::Upstream(cause) => map_error(cause),
        }
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Unavailable(_) => {
                ApiError::unavailable("stats_store_unavailable", err.to_string(), DEFAULT_RETRY_AFTER)
            }
            RepositoryError::InvalidArguments(message) => ApiError::bad_request(message),
            other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "stats_store_error", other.to_string()),
        }
    }
}
