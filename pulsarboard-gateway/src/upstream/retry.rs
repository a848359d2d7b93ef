use rand::Rng;
use std::time::Duration;

/// Exponential backoff for transient upstream failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    /// Upper bound of the random extra delay, as a fraction of the backoff.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `failed_attempts` attempts have failed.
    ///
    /// `base * factor^(n-1) * (1 + j)` with `j` drawn from `[0, jitter)`. The
    /// jitter is capped below `factor - 1` so consecutive delays always grow.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
        let backoff = self.base_delay.as_secs_f64() * self.factor.powi(exponent);

        let jitter = self.effective_jitter();
        let extra = if jitter > 0.0 {
            rand::rng().random_range(0.0..jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64(backoff * (1.0 + extra))
    }

    fn effective_jitter(&self) -> f64 {
        let ceiling = ((self.factor - 1.0) * 0.9).max(0.0);
        self.jitter.clamp(0.0, ceiling)
    }
}
