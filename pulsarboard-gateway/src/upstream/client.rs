use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use super::circuit_breaker::{BreakerConfig, CircuitBreakers, CircuitReport};
use super::errors::{TransportError, UpstreamError};
use super::retry::RetryPolicy;
use super::transport::{Transport, UpstreamRequest, UpstreamResponse};
use crate::environment::EnvironmentHandle;
use crate::gateway_metrics::{UPSTREAM_LATENCY_MS, UPSTREAM_REQUESTS_TOTAL, UPSTREAM_RETRIES_TOTAL};

// longest slice of an error body kept in ClientError messages
const MAX_ERROR_BODY: usize = 512;

/// HTTP client to the cluster admin API with per-attempt timeout, retry with
/// backoff, and a circuit breaker per target.
pub struct UpstreamClient {
    transport: Arc<dyn Transport>,
    environment: EnvironmentHandle,
    retry: RetryPolicy,
    breakers: CircuitBreakers,
}

impl UpstreamClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        environment: EnvironmentHandle,
        retry: RetryPolicy,
        breaker: BreakerConfig,
    ) -> Self {
        UpstreamClient {
            transport,
            environment,
            retry,
            breakers: CircuitBreakers::new(breaker),
        }
    }

    /// Base URL of the active environment's admin API.
    pub fn admin_target(&self) -> String {
        self.environment.current().admin_url.clone()
    }

    /// Send `request` to `target`.
    ///
    /// Every network attempt is admitted by the target's breaker and its
    /// outcome recorded there. `Timeout` and `Unavailable` are retried up to
    /// the policy's attempt budget; everything else returns immediately. When
    /// the breaker refuses an attempt the call fails with `CircuitOpen`
    /// without touching the network.
    pub async fn call(
        &self,
        target: &str,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let breaker = self.breakers.get(target);
        let timeout = self.environment.current().request_timeout;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(retry_after) => {
                    counter!(UPSTREAM_REQUESTS_TOTAL.name, "target" => target.to_string(), "outcome" => "circuit_open")
                        .increment(1);
                    return Err(UpstreamError::CircuitOpen {
                        target: target.to_string(),
                        retry_after,
                    });
                }
            };

            let started = Instant::now();
            let outcome = self.attempt(target, request, timeout).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            histogram!(UPSTREAM_LATENCY_MS.name, "target" => target.to_string()).record(elapsed_ms);

            let label = match &outcome {
                Ok(_) => "ok",
                Err(err) => err.kind(),
            };
            counter!(UPSTREAM_REQUESTS_TOTAL.name, "target" => target.to_string(), "outcome" => label)
                .increment(1);

            // 4xx means the upstream is up and answering
            match &outcome {
                Err(err) if err.is_retryable() => permit.failure(),
                _ => permit.success(),
            }

            match outcome {
                Ok(response) => {
                    debug!(upstream = %target, path = %request.path, attempt, elapsed_ms, "admin call succeeded");
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        upstream = %target,
                        path = %request.path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "admin call failed, retrying"
                    );
                    counter!(UPSTREAM_RETRIES_TOTAL.name, "target" => target.to_string()).increment(1);
                    time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(upstream = %target, path = %request.path, attempt, error = %err, "admin call failed");
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        target: &str,
        request: &UpstreamRequest,
        timeout: Duration,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let sent = time::timeout(timeout, self.transport.send(target, request, timeout)).await;
        match sent {
            Err(_) | Ok(Err(TransportError::Timeout)) => Err(UpstreamError::Timeout),
            Ok(Err(TransportError::Connect(message))) => Err(UpstreamError::Unavailable(message)),
            Ok(Err(TransportError::Credential(message))) => {
                warn!(upstream = %target, error = %message, "unable to resolve admin credential");
                Err(UpstreamError::Unauthorized { status: 401 })
            }
            Ok(Ok(response)) => classify(response),
        }
    }

    pub fn circuit_reports(&self) -> Vec<CircuitReport> {
        self.breakers.reports()
    }

    pub fn reset_breakers(&self) {
        self.breakers.reset_all();
    }
}

fn classify(response: UpstreamResponse) -> Result<UpstreamResponse, UpstreamError> {
    match response.status {
        200..=399 => Ok(response),
        401 | 403 => Err(UpstreamError::Unauthorized {
            status: response.status,
        }),
        400..=499 => Err(UpstreamError::ClientError {
            status: response.status,
            message: error_message(&response.body),
        }),
        status => Err(UpstreamError::Unavailable(format!("admin api returned {}", status))),
    }
}

// Pulsar wraps errors as {"reason": "..."}
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(reason) = value.get("reason").and_then(|r| r.as_str()) {
            return reason.to_string();
        }
    }
    body.chars().take(MAX_ERROR_BODY).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_status_families() {
        assert!(classify(UpstreamResponse::new(204, "")).is_ok());
        assert_eq!(
            classify(UpstreamResponse::new(403, "")),
            Err(UpstreamError::Unauthorized { status: 403 })
        );
        assert_eq!(
            classify(UpstreamResponse::new(409, r#"{"reason":"Tenant already exists"}"#)),
            Err(UpstreamError::ClientError {
                status: 409,
                message: "Tenant already exists".to_string()
            })
        );
        assert!(matches!(
            classify(UpstreamResponse::new(503, "")),
            Err(UpstreamError::Unavailable(_))
        ));
    }
}
