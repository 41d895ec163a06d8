use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use toolmesh_common::{Result, ToolmeshError};
use tracing::{info, warn};

/// The gate the retry executor consults before deciding to retry.
///
/// Implementations decide whether work may proceed. Outcomes are reported
/// separately by whoever observes them.
pub trait CircuitGate: Send + Sync {
    /// Returns `Err(CircuitOpen)` when calls should fail fast.
    fn allow_request(&self) -> Result<()>;

    fn record_success(&self) {}

    fn record_failure(&self) {}

    /// Hands back an admission from `allow_request` whose call never ran or
    /// whose outcome says nothing about the dependency.
    fn release_trial(&self) {}
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests flow through
    Closed,
    /// Circuit is tripped, requests fail fast
    Open,
    /// Probing whether the dependency has recovered
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before tripping the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing again
    pub success_threshold: u32,
    /// Open period after the first trip
    pub base_timeout: Duration,
    /// Cap on the open period
    pub max_timeout: Duration,
    /// Growth of the open period for every consecutive trip
    pub backoff_multiplier: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            base_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl CircuitBreakerConfig {
    /// Open period after `trips` consecutive trips (1-based).
    pub fn calculate_timeout(&self, trips: u32) -> Duration {
        let exponent = trips.max(1) as i32 - 1;
        let multiplier = self.backoff_multiplier.powi(exponent);
        let backoff = self.base_timeout.as_secs_f64() * multiplier;
        if !backoff.is_finite() || backoff >= self.max_timeout.as_secs_f64() {
            self.max_timeout
        } else {
            Duration::from_secs_f64(backoff)
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    trips: u32,
    opened_at: Option<Instant>,
    /// Start of the half-open trial call currently in flight
    trial_started: Option<Instant>,
}

/// A counting circuit breaker with exponentially growing open periods.
///
/// While half-open only one trial call is let through at a time. The trial
/// ends with [`record_success`](CircuitGate::record_success),
/// [`record_failure`](CircuitGate::record_failure) or
/// [`release_trial`](CircuitGate::release_trial). A trial that never reports back is
/// abandoned after `base_timeout`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                trips: 0,
                opened_at: None,
                trial_started: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn trip(&self, inner: &mut BreakerState) {
        inner.trips = inner.trips.saturating_add(1);
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.consecutive_successes = 0;
        inner.trial_started = None;
        warn!(
            breaker = %self.name,
            trips = inner.trips,
            open_for_ms = self.config.calculate_timeout(inner.trips).as_millis() as u64,
            "circuit opened"
        );
    }

}

impl CircuitGate for CircuitBreaker {
    fn allow_request(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => return Ok(()),
            CircuitState::HalfOpen => {
                let busy = inner
                    .trial_started
                    .is_some_and(|t| t.elapsed() < self.config.base_timeout);
                if busy {
                    return Err(ToolmeshError::CircuitOpen(format!(
                        "{} half-open, trial call in flight",
                        self.name
                    )));
                }
                inner.trial_started = Some(Instant::now());
                return Ok(());
            }
            CircuitState::Open => {}
        }

        let timeout = self.config.calculate_timeout(inner.trips);
        let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
        if elapsed >= timeout {
            inner.state = CircuitState::HalfOpen;
            inner.opened_at = None;
            inner.consecutive_successes = 0;
            inner.trial_started = Some(Instant::now());
            info!(breaker = %self.name, "circuit half-open");
            Ok(())
        } else {
            Err(ToolmeshError::CircuitOpen(format!(
                "{} open for another {}ms",
                self.name,
                (timeout - elapsed).as_millis()
            )))
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.trial_started = None;
        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                inner.state = CircuitState::Closed;
                inner.trips = 0;
                inner.consecutive_successes = 0;
                info!(breaker = %self.name, "circuit closed");
            }
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_started = None;
        match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                self.trip(&mut inner);
            }
            CircuitState::HalfOpen => self.trip(&mut inner),
            _ => {}
        }
    }

    fn release_trial(&self) {
        self.inner.lock().trial_started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            base_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_calculate_timeout() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.calculate_timeout(1).as_secs(), 30);
        assert_eq!(config.calculate_timeout(2).as_secs(), 60);
        assert_eq!(config.calculate_timeout(3).as_secs(), 120);
        assert_eq!(config.calculate_timeout(4).as_secs(), 240);
        // capped
        assert_eq!(config.calculate_timeout(5).as_secs(), 300);
        assert_eq!(config.calculate_timeout(50).as_secs(), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold() {
        let breaker = CircuitBreaker::new("svc", config());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(breaker.allow_request(), Err(ToolmeshError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_streak() {
        let breaker = CircuitBreaker::new("svc", config());

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_then_close() {
        let breaker = CircuitBreaker::new("svc", config());
        for _ in 0..3 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.allow_request().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow_request().is_ok());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_trial_at_a_time() {
        let breaker = CircuitBreaker::new("svc", config());
        for _ in 0..3 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.allow_request().is_ok());
        assert!(matches!(breaker.allow_request(), Err(ToolmeshError::CircuitOpen(_))));
        assert!(breaker.allow_request().is_err());

        // a released trial frees the slot without changing state
        breaker.release_trial();
        assert!(breaker.allow_request().is_ok());
        assert!(breaker.allow_request().is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // a trial that never reports back is abandoned
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.allow_request().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_longer_timeout() {
        let breaker = CircuitBreaker::new("svc", config());
        for _ in 0..3 {
            breaker.record_failure();
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.allow_request().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // second trip doubles the open period
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.allow_request().is_err());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.allow_request().is_ok());
    }
}
