use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::errors::{TransportError, UpstreamError};
use crate::environment::EnvironmentHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

/// One admin API request, relative to a target base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl UpstreamRequest {
    pub fn get(path: impl Into<String>) -> Self {
        UpstreamRequest {
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    pub fn put(path: impl Into<String>, body: Option<Value>) -> Self {
        UpstreamRequest {
            method: Method::Put,
            path: path.into(),
            body,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        UpstreamRequest {
            method: Method::Delete,
            path: path.into(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: String,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        UpstreamResponse {
            status,
            body: body.into(),
        }
    }

    /// Decode the body as JSON. An empty body decodes as `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, UpstreamError> {
        let raw = if self.body.trim().is_empty() {
            "null"
        } else {
            self.body.as_str()
        };
        serde_json::from_str(raw).map_err(|e| UpstreamError::Decode(e.to_string()))
    }
}

/// The network seam of the upstream client.
///
/// Implementations report HTTP error statuses as a normal response; only
/// failures to obtain a response at all are errors.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(
        &self,
        target: &str,
        request: &UpstreamRequest,
        timeout: Duration,
    ) -> Result<UpstreamResponse, TransportError>;
}

/// reqwest-backed transport; attaches the environment's bearer token per call.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    environment: EnvironmentHandle,
}

impl HttpTransport {
    pub fn new(environment: EnvironmentHandle) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("pulsarboard/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpTransport { http, environment })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        target: &str,
        request: &UpstreamRequest,
        timeout: Duration,
    ) -> Result<UpstreamResponse, TransportError> {
        let url = format!("{}{}", target.trim_end_matches('/'), request.path);
        let mut builder = match request.method {
            Method::Get => self.http.get(&url),
            Method::Put => self.http.put(&url),
            Method::Post => self.http.post(&url),
            Method::Delete => self.http.delete(&url),
        }
        .timeout(timeout);

        let token = self
            .environment
            .current()
            .credential
            .resolve()
            .await
            .map_err(TransportError::Credential)?;
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        debug!(target = %target, path = %request.path, status, "admin api responded");
        Ok(UpstreamResponse { status, body })
    }
}
