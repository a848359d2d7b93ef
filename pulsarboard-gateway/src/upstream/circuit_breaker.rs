use dashmap::DashMap;
use metrics::gauge;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::gateway_metrics::CIRCUIT_STATE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failed attempts that open the circuit.
    pub failure_threshold: u32,
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

/// Public, time-free view of a [`CircuitState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitStatus {
    fn gauge_value(self) -> f64 {
        match self {
            CircuitStatus::Closed => 0.0,
            CircuitStatus::HalfOpen => 1.0,
            CircuitStatus::Open => 2.0,
        }
    }
}

impl From<CircuitState> for CircuitStatus {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed { .. } => CircuitStatus::Closed,
            CircuitState::HalfOpen { .. } => CircuitStatus::HalfOpen,
            CircuitState::Open { .. } => CircuitStatus::Open,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitReport {
    pub target: String,
    pub status: CircuitStatus,
    pub seconds_in_state: u64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    last_transition: Instant,
}

/// Circuit breaker guarding one upstream target.
///
/// All transitions happen under the breaker's own lock, which is never held
/// across an await point.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: BreakerConfig) -> Self {
        CircuitBreaker {
            target: target.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed {
                    consecutive_failures: 0,
                },
                last_transition: Instant::now(),
            }),
        }
    }

    /// Ask to send one attempt. Returns the wait before the circuit may admit
    /// calls again when it refuses.
    pub fn try_acquire(self: &Arc<Self>) -> Result<Permit, Duration> {
        let mut inner = self.lock();
        let now = Instant::now();
        let state = inner.state;
        match state {
            CircuitState::Closed { .. } => Ok(Permit::new(self.clone(), false)),
            CircuitState::Open { until } if now >= until => {
                self.transition(&mut inner, CircuitState::HalfOpen { trial_in_flight: true });
                Ok(Permit::new(self.clone(), true))
            }
            CircuitState::Open { until } => Err(until - now),
            CircuitState::HalfOpen { trial_in_flight: false } => {
                inner.state = CircuitState::HalfOpen { trial_in_flight: true };
                Ok(Permit::new(self.clone(), true))
            }
            CircuitState::HalfOpen { trial_in_flight: true } => Err(self.config.cool_down),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn status(&self) -> CircuitStatus {
        self.state().into()
    }

    /// Current status and how long the breaker has been in it.
    pub fn report(&self) -> CircuitReport {
        let inner = self.lock();
        CircuitReport {
            target: self.target.clone(),
            status: inner.state.into(),
            seconds_in_state: inner.last_transition.elapsed().as_secs(),
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed { .. } => {
                inner.state = CircuitState::Closed {
                    consecutive_failures: 0,
                };
            }
            CircuitState::HalfOpen { .. } => {
                self.transition(
                    &mut inner,
                    CircuitState::Closed {
                        consecutive_failures: 0,
                    },
                );
            }
            // an attempt admitted before the circuit opened; it does not close it
            CircuitState::Open { .. } => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        let until = Instant::now() + self.config.cool_down;
        let state = inner.state;
        match state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open { until });
                } else {
                    inner.state = CircuitState::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.transition(&mut inner, CircuitState::Open { until });
            }
            CircuitState::Open { .. } => {}
        }
    }

    fn on_abandoned_trial(&self) {
        let mut inner = self.lock();
        if let CircuitState::HalfOpen { trial_in_flight: true } = inner.state {
            inner.state = CircuitState::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState) {
        let from = CircuitStatus::from(inner.state);
        let to = CircuitStatus::from(next);
        inner.state = next;
        inner.last_transition = Instant::now();

        match to {
            CircuitStatus::Open => warn!(upstream = %self.target, from = ?from, "circuit opened"),
            _ => info!(upstream = %self.target, from = ?from, to = ?to, "circuit state changed"),
        }
        gauge!(CIRCUIT_STATE.name, "target" => self.target.clone()).set(to.gauge_value());
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission for a single attempt. Settle it with [`Permit::success`] or
/// [`Permit::failure`]; a HalfOpen trial dropped unsettled frees the trial slot.
#[derive(Debug)]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl Permit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Permit {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure();
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_abandoned_trial();
        }
    }
}

/// One breaker per upstream target, created on first use.
#[derive(Debug)]
pub struct CircuitBreakers {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreakers {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(target) {
            return breaker.clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())))
            .clone()
    }

    /// Forget every breaker; used when the environment changes.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            gauge!(CIRCUIT_STATE.name, "target" => entry.key().clone()).set(0.0);
        }
        self.breakers.clear();
    }

    pub fn reports(&self) -> Vec<CircuitReport> {
        let mut out: Vec<CircuitReport> = self.breakers.iter().map(|entry| entry.value().report()).collect();
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }
}
