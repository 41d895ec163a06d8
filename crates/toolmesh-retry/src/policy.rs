//! Retry policies.
//!
//! A policy answers two questions for the executor: should a failed operation
//! be tried again, and how long to wait before doing so. Attempt numbers follow
//! one convention throughout:
//!
//! - [`RetryPolicy::should_retry`] receives the number of attempts already
//!   made (1 after the first failure).
//! - [`RetryPolicy::next_delay`] receives the zero-based index of the retry
//!   about to happen (0 before the first retry).
//!
//! With `max_attempts = 3` an always-failing operation therefore runs exactly
//! three times and waits `next_delay(0)` and `next_delay(1)` in between.

use crate::classification::{classify_error, RetryClassification};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use toolmesh_common::ToolmeshError;

pub trait RetryPolicy: Send + Sync {
    /// Decides whether another attempt should be made after `attempt` failed tries.
    fn should_retry(&self, attempt: u32, err: &ToolmeshError, elapsed: Duration) -> bool;

    /// Delay before retry number `attempt` (zero-based).
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Clears any per-execution state. Called once at the start of every execution.
    fn reset(&self) {}

    /// Upper bound on the number of attempts this policy allows.
    fn max_attempts(&self) -> u32;
}

fn default_retryable() -> HashSet<RetryClassification> {
    [
        RetryClassification::Retryable,
        RetryClassification::Network,
        RetryClassification::Timeout,
        RetryClassification::Throttled,
    ]
    .into_iter()
    .collect()
}

fn gate(
    attempt: u32,
    max_attempts: u32,
    err: &ToolmeshError,
    retryable: &HashSet<RetryClassification>,
) -> bool {
    attempt < max_attempts && retryable.contains(&classify_error(err))
}

/// Exponential backoff: `base_delay * multiplier^attempt`, jittered by
/// `±jitter` of the delay and capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_attempts: u32,
    pub retryable: HashSet<RetryClassification>,
}

impl ExponentialBackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts,
            retryable: default_retryable(),
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter fraction. `0.0` makes delays deterministic.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_retryable(mut self, classes: impl IntoIterator<Item = RetryClassification>) -> Self {
        self.retryable = classes.into_iter().collect();
        self
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn should_retry(&self, attempt: u32, err: &ToolmeshError, _elapsed: Duration) -> bool {
        gate(attempt, self.max_attempts, err, &self.retryable)
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.base_delay.min(self.max_delay);
        }

        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut delay = base * self.multiplier.powi(exponent);
        // capped delays are not jittered; an infinite band would also panic in gen_range
        if !delay.is_finite() || delay >= max {
            return self.max_delay;
        }

        if self.jitter > 0.0 && delay > 0.0 {
            let spread = delay * self.jitter;
            delay += rand::thread_rng().gen_range(-spread..=spread);
        }

        Duration::try_from_secs_f64(delay.clamp(0.0, max))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Linear backoff: `base_delay + attempt * increment`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct LinearBackoffPolicy {
    pub base_delay: Duration,
    pub increment: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub retryable: HashSet<RetryClassification>,
}

impl LinearBackoffPolicy {
    pub fn new(base_delay: Duration, increment: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            increment,
            max_delay,
            max_attempts,
            retryable: [
                RetryClassification::Retryable,
                RetryClassification::Network,
                RetryClassification::Timeout,
            ]
            .into_iter()
            .collect(),
        }
    }

    pub fn with_retryable(mut self, classes: impl IntoIterator<Item = RetryClassification>) -> Self {
        self.retryable = classes.into_iter().collect();
        self
    }
}

impl RetryPolicy for LinearBackoffPolicy {
    fn should_retry(&self, attempt: u32, err: &ToolmeshError, _elapsed: Duration) -> bool {
        gate(attempt, self.max_attempts, err, &self.retryable)
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_add(self.increment.saturating_mul(attempt));
        delay.min(self.max_delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Picks a policy per tool, then per server, then falls back to a default.
#[derive(Clone)]
pub struct ToolSpecificRetryPolicy {
    default_policy: Arc<dyn RetryPolicy>,
    tool_policies: HashMap<String, Arc<dyn RetryPolicy>>,
    server_policies: HashMap<String, Arc<dyn RetryPolicy>>,
}

impl ToolSpecificRetryPolicy {
    pub fn new(default_policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            default_policy,
            tool_policies: HashMap::new(),
            server_policies: HashMap::new(),
        }
    }

    pub fn set_tool_policy(&mut self, tool_name: impl Into<String>, policy: Arc<dyn RetryPolicy>) {
        self.tool_policies.insert(tool_name.into(), policy);
    }

    pub fn set_server_policy(&mut self, server_name: impl Into<String>, policy: Arc<dyn RetryPolicy>) {
        self.server_policies.insert(server_name.into(), policy);
    }

    pub fn with_tool_policy(mut self, tool_name: impl Into<String>, policy: Arc<dyn RetryPolicy>) -> Self {
        self.set_tool_policy(tool_name, policy);
        self
    }

    pub fn with_server_policy(mut self, server_name: impl Into<String>, policy: Arc<dyn RetryPolicy>) -> Self {
        self.set_server_policy(server_name, policy);
        self
    }

    pub fn policy_for(&self, tool_name: &str, server_name: &str) -> Arc<dyn RetryPolicy> {
        self.tool_policies
            .get(tool_name)
            .or_else(|| self.server_policies.get(server_name))
            .unwrap_or(&self.default_policy)
            .clone()
    }
}

impl Default for ToolSpecificRetryPolicy {
    fn default() -> Self {
        Self::new(Arc::new(presets::standard()))
    }
}

/// Tuning for [`AdaptiveRetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub window_size: usize,
    /// Above this success rate delays are scaled by `fast_multiplier`.
    pub high_success_rate: f64,
    /// Below this success rate delays are scaled by `slow_multiplier`.
    pub low_success_rate: f64,
    pub fast_multiplier: f64,
    pub slow_multiplier: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            high_success_rate: 0.8,
            low_success_rate: 0.3,
            fast_multiplier: 0.5,
            slow_multiplier: 2.0,
        }
    }
}

/// Wraps a policy and scales its delays by the recent success rate.
///
/// Outcomes are not observed automatically; callers feed them through
/// [`record_result`](Self::record_result).
pub struct AdaptiveRetryPolicy {
    base: Arc<dyn RetryPolicy>,
    config: AdaptiveConfig,
    window: Mutex<VecDeque<bool>>,
}

impl AdaptiveRetryPolicy {
    pub fn new(base: Arc<dyn RetryPolicy>, config: AdaptiveConfig) -> Self {
        let capacity = config.window_size.max(1);
        Self {
            base,
            config,
            window: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record_result(&self, success: bool) {
        let mut window = self.window.lock();
        if window.len() >= self.config.window_size.max(1) {
            window.pop_front();
        }
        window.push_back(success);
    }

    /// Fraction of successes in the window. An empty window counts as fully healthy.
    pub fn success_rate(&self) -> f64 {
        let window = self.window.lock();
        if window.is_empty() {
            return 1.0;
        }
        window.iter().filter(|ok| **ok).count() as f64 / window.len() as f64
    }

    pub fn delay_multiplier(&self) -> f64 {
        let rate = self.success_rate();
        if rate > self.config.high_success_rate {
            self.config.fast_multiplier
        } else if rate < self.config.low_success_rate {
            self.config.slow_multiplier
        } else {
            1.0
        }
    }
}

impl RetryPolicy for AdaptiveRetryPolicy {
    fn should_retry(&self, attempt: u32, err: &ToolmeshError, elapsed: Duration) -> bool {
        self.base.should_retry(attempt, err, elapsed)
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.base.next_delay(attempt);
        let scaled = delay.as_secs_f64() * self.delay_multiplier().max(0.0);
        Duration::try_from_secs_f64(scaled).unwrap_or(Duration::MAX)
    }

    fn reset(&self) {
        self.base.reset();
    }

    fn max_attempts(&self) -> u32 {
        self.base.max_attempts()
    }
}

/// Ready-made policies for common situations.
pub mod presets {
    use super::*;

    /// 100ms base, 5s cap, 3 attempts.
    pub fn quick() -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5), 3)
    }

    /// 1s base, 30s cap, 5 attempts.
    pub fn standard() -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 5)
    }

    /// 5s base, 2 minute cap, 3 attempts.
    pub fn slow() -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(120), 3)
    }

    /// Only network and timeout failures, 500ms base, 10s cap, 4 attempts.
    pub fn network() -> ExponentialBackoffPolicy {
        ExponentialBackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(10), 4)
            .with_retryable([RetryClassification::Network, RetryClassification::Timeout])
    }

    /// Only throttling, linear 2s + 1s per retry, 30s cap, 3 attempts.
    pub fn throttle() -> LinearBackoffPolicy {
        LinearBackoffPolicy::new(
            Duration::from_secs(2),
            Duration::from_secs(1),
            Duration::from_secs(30),
            3,
        )
        .with_retryable([RetryClassification::Throttled])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retryable_err() -> ToolmeshError {
        ToolmeshError::Execution("upstream hiccup".into())
    }

    #[test]
    fn test_exponential_delays_without_jitter() {
        let policy = ExponentialBackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 5)
            .with_jitter(0.0);

        assert_eq!(policy.next_delay(0), Duration::from_millis(100));
        assert_eq!(policy.next_delay(1), Duration::from_millis(200));
        assert_eq!(policy.next_delay(2), Duration::from_millis(400));
        assert_eq!(policy.next_delay(3), Duration::from_millis(800));
        // capped
        assert_eq!(policy.next_delay(4), Duration::from_secs(1));
        assert_eq!(policy.next_delay(60), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_jitter_stays_in_band() {
        let policy = ExponentialBackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10), 5)
            .with_jitter(0.1);

        for _ in 0..100 {
            let delay = policy.next_delay(2);
            assert!(delay >= Duration::from_millis(359), "{:?}", delay);
            assert!(delay <= Duration::from_millis(441), "{:?}", delay);
        }
    }

    #[test]
    fn test_exponential_huge_attempt_is_capped() {
        let policy = ExponentialBackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 5000);

        assert_eq!(policy.next_delay(1100), Duration::from_secs(30));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_adaptive_scaling_saturates() {
        let base = Arc::new(
            ExponentialBackoffPolicy::new(Duration::from_secs(1), Duration::MAX, 5000).with_jitter(0.0),
        );
        let policy = AdaptiveRetryPolicy::new(base, AdaptiveConfig { window_size: 2, ..Default::default() });
        policy.record_result(false);
        policy.record_result(false);

        assert_eq!(policy.next_delay(2000), Duration::MAX);
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = presets::quick();
        let err = retryable_err();

        assert!(policy.should_retry(1, &err, Duration::ZERO));
        assert!(policy.should_retry(2, &err, Duration::ZERO));
        assert!(!policy.should_retry(3, &err, Duration::ZERO));
    }

    #[test]
    fn test_should_retry_respects_allow_set() {
        let policy = presets::network();

        assert!(policy.should_retry(1, &ToolmeshError::Execution("connection reset".into()), Duration::ZERO));
        assert!(!policy.should_retry(1, &retryable_err(), Duration::ZERO));
        assert!(!policy.should_retry(1, &ToolmeshError::Cancelled, Duration::ZERO));
    }

    #[test]
    fn test_linear_delays() {
        let policy = presets::throttle();

        assert_eq!(policy.next_delay(0), Duration::from_secs(2));
        assert_eq!(policy.next_delay(1), Duration::from_secs(3));
        assert_eq!(policy.next_delay(5), Duration::from_secs(7));
        assert_eq!(policy.next_delay(100), Duration::from_secs(30));
    }

    #[test]
    fn test_linear_only_retries_throttling() {
        let policy = presets::throttle();

        assert!(policy.should_retry(1, &ToolmeshError::Execution("rate limit hit".into()), Duration::ZERO));
        assert!(!policy.should_retry(1, &ToolmeshError::Execution("connection refused".into()), Duration::ZERO));
    }

    #[test]
    fn test_tool_specific_lookup_order() {
        let default: Arc<dyn RetryPolicy> = Arc::new(presets::standard());
        let by_tool: Arc<dyn RetryPolicy> = Arc::new(presets::quick());
        let by_server: Arc<dyn RetryPolicy> = Arc::new(presets::slow());

        let router = ToolSpecificRetryPolicy::new(default)
            .with_tool_policy("web_search", by_tool)
            .with_server_policy("slow-server", by_server);

        assert_eq!(router.policy_for("web_search", "slow-server").max_attempts(), 3);
        assert_eq!(
            router.policy_for("other", "slow-server").next_delay(0),
            Duration::from_secs(5)
        );
        assert_eq!(router.policy_for("other", "other").max_attempts(), 5);
    }

    #[test]
    fn test_adaptive_multiplier_follows_success_rate() {
        let base = Arc::new(
            ExponentialBackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10), 3).with_jitter(0.0),
        );
        let policy = AdaptiveRetryPolicy::new(base, AdaptiveConfig { window_size: 10, ..Default::default() });

        // empty window counts as healthy
        assert_eq!(policy.success_rate(), 1.0);
        assert_eq!(policy.next_delay(0), Duration::from_millis(50));

        for _ in 0..10 {
            policy.record_result(false);
        }
        assert_eq!(policy.success_rate(), 0.0);
        assert_eq!(policy.next_delay(0), Duration::from_millis(200));

        for _ in 0..5 {
            policy.record_result(true);
        }
        assert!((policy.success_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(policy.next_delay(0), Duration::from_millis(100));
    }

    #[test]
    fn test_adaptive_window_is_bounded() {
        let policy = AdaptiveRetryPolicy::new(
            Arc::new(presets::quick()),
            AdaptiveConfig { window_size: 4, ..Default::default() },
        );
        for _ in 0..100 {
            policy.record_result(false);
        }
        for _ in 0..4 {
            policy.record_result(true);
        }
        assert_eq!(policy.success_rate(), 1.0);
    }
}
