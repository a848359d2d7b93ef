mod admin;
pub use admin::{broker_base_url, BrokerStats, PulsarAdmin, SubscriptionStats, TopicStats};

pub(crate) mod circuit_breaker;
pub use circuit_breaker::{BreakerConfig, CircuitReport, CircuitState, CircuitStatus};

mod client;
pub use client::UpstreamClient;

mod errors;
pub use errors::{TransportError, UpstreamError};

mod retry;
pub use retry::RetryPolicy;

mod transport;
pub use transport::{HttpTransport, Method, Transport, UpstreamRequest, UpstreamResponse};

#[cfg(test)]
mod circuit_breaker_test;
