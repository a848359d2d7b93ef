#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::upstream::circuit_breaker::{
        BreakerConfig, CircuitBreaker, CircuitBreakers, CircuitState, CircuitStatus,
    };

    fn breaker(threshold: u32, cool_down_secs: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "http://pulsar:8080",
            BreakerConfig {
                failure_threshold: threshold,
                cool_down: Duration::from_secs(cool_down_secs),
            },
        ))
    }

    fn fail(breaker: &Arc<CircuitBreaker>, times: u32) {
        for _ in 0..times {
            breaker.try_acquire().expect("admitted").failure();
        }
    }

    /// Test: threshold consecutive failures open the circuit
    ///
    /// Purpose
    /// - Closed counts consecutive failures and opens exactly at the threshold.
    ///
    /// Flow
    /// - Fail threshold-1 times, succeed once (counter resets), then fail threshold times.
    ///
    /// Expected
    /// - The circuit stays closed until the threshold-th consecutive failure,
    ///   then refuses with a retry-after equal to the cool-down.
    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = breaker(3, 30);

        fail(&breaker, 2);
        breaker.try_acquire().expect("admitted").success();
        assert_eq!(
            breaker.state(),
            CircuitState::Closed {
                consecutive_failures: 0
            }
        );

        fail(&breaker, 2);
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        fail(&breaker, 1);
        assert_eq!(breaker.status(), CircuitStatus::Open);

        let retry_after = breaker.try_acquire().expect_err("open circuit refuses");
        assert_eq!(retry_after, Duration::from_secs(30));
    }

    /// Test: one trial after the cool-down
    ///
    /// Purpose
    /// - After the cool-down exactly one caller is admitted as the HalfOpen trial.
    ///
    /// Expected
    /// - A second caller is refused while the trial is in flight; a successful
    ///   trial closes the circuit.
    #[tokio::test(start_paused = true)]
    async fn admits_single_trial_after_cool_down() {
        let breaker = breaker(1, 10);
        fail(&breaker, 1);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.try_acquire().expect("trial admitted");
        assert!(trial.is_trial());
        assert_eq!(breaker.status(), CircuitStatus::HalfOpen);
        assert!(breaker.try_acquire().is_err(), "only one trial at a time");

        trial.success();
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        assert!(!breaker.try_acquire().expect("closed").is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_restarts_cool_down() {
        let breaker = breaker(1, 10);
        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(10)).await;

        breaker.try_acquire().expect("trial admitted").failure();
        assert_eq!(breaker.status(), CircuitStatus::Open);

        let retry_after = breaker.try_acquire().expect_err("open again");
        assert_eq!(retry_after, Duration::from_secs(10));
    }

    /// Test: an abandoned trial does not wedge the breaker
    ///
    /// Purpose
    /// - A caller cancelled mid-trial drops its permit unsettled; the next
    ///   caller must be able to run the trial instead.
    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_the_slot() {
        let breaker = breaker(1, 5);
        fail(&breaker, 1);
        tokio::time::advance(Duration::from_secs(5)).await;

        let trial = breaker.try_acquire().expect("trial admitted");
        drop(trial);

        let next = breaker.try_acquire().expect("slot freed");
        assert!(next.is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_does_not_close_an_open_circuit() {
        let breaker = breaker(2, 30);
        let slow = breaker.try_acquire().expect("admitted");
        fail(&breaker, 2);

        slow.success();

        assert_eq!(breaker.status(), CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_keeps_one_breaker_per_target() {
        let breakers = CircuitBreakers::new(BreakerConfig {
            failure_threshold: 1,
            cool_down: Duration::from_secs(30),
        });

        breakers.get("http://a").try_acquire().expect("admitted").failure();
        assert!(Arc::ptr_eq(&breakers.get("http://a"), &breakers.get("http://a")));
        assert_eq!(breakers.get("http://b").status(), CircuitStatus::Closed);

        let reports = breakers.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].target, "http://a");
        assert_eq!(reports[0].status, CircuitStatus::Open);

        breakers.reset_all();
        assert_eq!(breakers.get("http://a").status(), CircuitStatus::Closed);
    }
}
