#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use pulsarboard_core::stats::MemoryStatsRepository;
use pulsarboard_core::ManualClock;
use pulsarboard_gateway::app::{create_app_state, AppOptions, AppState};
use pulsarboard_gateway::cache::{CacheTtls, MemoryCache};
use pulsarboard_gateway::environment::{Credential, Environment, EnvironmentHandle};
use pulsarboard_gateway::upstream::{
    BreakerConfig, Method, RetryPolicy, Transport, TransportError, UpstreamRequest, UpstreamResponse,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const ADMIN_URL: &str = "http://pulsar-admin:8080";

/// One scripted answer of the fake admin API.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, String),
    Timeout,
    Refused,
    /// Answer only after the given delay.
    Slow(Duration, u16, String),
}

impl Reply {
    pub fn json(body: serde_json::Value) -> Self {
        Reply::Status(200, body.to_string())
    }

    pub fn ok() -> Self {
        Reply::Status(204, String::new())
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub target: String,
    pub method: Method,
    pub path: String,
    pub at: Instant,
}

/// Transport answering from per-path scripts. The last reply of a script
/// repeats once the earlier ones are used up; unknown paths answer 404.
#[derive(Default)]
pub struct FakeTransport {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeTransport::default())
    }

    pub fn script(&self, path: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(path.to_string(), replies.into_iter().collect());
    }

    pub fn respond(&self, path: &str, reply: Reply) {
        self.script(path, vec![reply]);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.path == path).collect()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn next_reply(&self, path: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(path) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Reply::Status(404, "not found".into())),
            None => Reply::Status(404, format!("no route for {}", path)),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(
        &self,
        target: &str,
        request: &UpstreamRequest,
        _timeout: Duration,
    ) -> Result<UpstreamResponse, TransportError> {
        self.calls.lock().unwrap().push(Call {
            target: target.to_string(),
            method: request.method,
            path: request.path.clone(),
            at: Instant::now(),
        });
        match self.next_reply(&request.path) {
            Reply::Status(status, body) => Ok(UpstreamResponse::new(status, body)),
            Reply::Timeout => Err(TransportError::Timeout),
            Reply::Refused => Err(TransportError::Connect("connection refused".into())),
            Reply::Slow(delay, status, body) => {
                tokio::time::sleep(delay).await;
                Ok(UpstreamResponse::new(status, body))
            }
        }
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub transport: Arc<FakeTransport>,
    pub clock: Arc<ManualClock>,
    pub repository: Arc<MemoryStatsRepository>,
}

pub fn environment(name: &str, admin_url: &str) -> Environment {
    Environment {
        name: name.to_string(),
        admin_url: admin_url.to_string(),
        credential: Credential::None,
        request_timeout: Duration::from_secs(1),
    }
}

/// No jitter so delays are exact; a breaker threshold high enough to stay
/// out of the way unless a test lowers it.
pub fn test_options() -> AppOptions {
    AppOptions {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.0,
        },
        breaker: BreakerConfig {
            failure_threshold: 1_000,
            cool_down: Duration::from_secs(30),
        },
        ttls: CacheTtls::default(),
        stale_retention: Duration::from_secs(3600),
        aggregation_every: Duration::from_secs(60),
        config_path: None,
    }
}

pub fn harness() -> Harness {
    harness_with(test_options())
}

pub fn harness_with(options: AppOptions) -> Harness {
    let transport = FakeTransport::new();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()));
    let repository = Arc::new(MemoryStatsRepository::new());
    let state = create_app_state(
        EnvironmentHandle::new(environment("test", ADMIN_URL)),
        transport.clone(),
        Arc::new(MemoryCache::new(10_000)),
        repository.clone(),
        clock.clone(),
        options,
    );
    Harness {
        state,
        transport,
        clock,
        repository,
    }
}

pub fn topic_stats_body(backlog: u64, rate_in: f64) -> serde_json::Value {
    serde_json::json!({
        "msgRateIn": rate_in,
        "msgRateOut": rate_in / 2.0,
        "msgThroughputIn": rate_in * 100.0,
        "msgThroughputOut": rate_in * 50.0,
        "storageSize": backlog * 10,
        "backlogSize": backlog,
        "publishers": [{}],
        "subscriptions": {
            "audit": { "msgRateOut": 1.5, "msgThroughputOut": 10.0, "msgBacklog": backlog, "consumers": [{}, {}] }
        }
    })
}
