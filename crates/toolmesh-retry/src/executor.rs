use crate::circuit_breaker::CircuitGate;
use crate::policy::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use toolmesh_common::{Result, ToolmeshError};
use tracing::{debug, info, warn};

/// Counters describing what the executor has done so far.
///
/// Shared by reference so several executors (one per tool policy, say) can
/// report into the same totals.
#[derive(Debug, Default)]
pub struct RetryMetrics {
    total_executions: AtomicU64,
    total_attempts: AtomicU64,
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
}

/// Point-in-time view of [`RetryMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryMetricsSnapshot {
    pub total_executions: u64,
    pub total_attempts: u64,
    pub total_retries: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub average_attempts: f64,
}

impl RetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RetryMetricsSnapshot {
        let total_executions = self.total_executions.load(Ordering::Relaxed);
        let total_attempts = self.total_attempts.load(Ordering::Relaxed);
        let average_attempts = if total_executions > 0 {
            total_attempts as f64 / total_executions as f64
        } else {
            0.0
        };

        RetryMetricsSnapshot {
            total_executions,
            total_attempts,
            total_retries: self.total_retries.load(Ordering::Relaxed),
            successful_retries: self.successful_retries.load(Ordering::Relaxed),
            failed_retries: self.failed_retries.load(Ordering::Relaxed),
            average_attempts,
        }
    }
}

/// Runs fallible operations under a [`RetryPolicy`].
///
/// Before every retry the optional circuit gate is consulted. A closed gate
/// fails the execution immediately with [`ToolmeshError::CircuitOpen`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
/// use toolmesh_retry::{ExponentialBackoffPolicy, RetryExecutor};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let policy = ExponentialBackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 3);
/// let executor = RetryExecutor::new(Arc::new(policy));
///
/// let value = executor
///     .execute_with_result(&CancellationToken::new(), || async { Ok(42) })
///     .await
///     .unwrap();
/// assert_eq!(value, 42);
/// # });
/// ```
pub struct RetryExecutor {
    policy: Arc<dyn RetryPolicy>,
    circuit_breaker: Option<Arc<dyn CircuitGate>>,
    metrics: Arc<RetryMetrics>,
}

impl RetryExecutor {
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            policy,
            circuit_breaker: None,
            metrics: Arc::new(RetryMetrics::new()),
        }
    }

    pub fn with_circuit_breaker(mut self, gate: Arc<dyn CircuitGate>) -> Self {
        self.circuit_breaker = Some(gate);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RetryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> RetryMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runs `operation` until it succeeds or the policy gives up.
    pub async fn execute<F, Fut>(&self, cancel: &CancellationToken, operation: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.execute_with_result(cancel, operation).await
    }

    /// Runs `operation` until it succeeds or the policy gives up, returning its value.
    ///
    /// # Errors
    ///
    /// - `Cancelled` if `cancel` fires before or between attempts
    /// - the operation's own error, unchanged, if it is a cancellation
    /// - `CircuitOpen` if the gate refuses further work
    /// - `RetriesExhausted` wrapping the last error once the policy stops retrying
    pub async fn execute_with_result<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.policy.reset();
        self.metrics.total_executions.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ToolmeshError::Cancelled);
            }

            attempts += 1;
            self.metrics.total_attempts.fetch_add(1, Ordering::Relaxed);

            let err = match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        self.metrics.successful_retries.fetch_add(1, Ordering::Relaxed);
                        info!(attempts, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.is_cancellation() {
                return Err(err);
            }

            if let Some(gate) = &self.circuit_breaker {
                if let Err(open) = gate.allow_request() {
                    self.record_failed_retry(attempts);
                    debug!(attempts, error = %err, "circuit breaker refused retry");
                    return Err(open);
                }
            }

            if !self.policy.should_retry(attempts, &err, started.elapsed()) {
                if let Some(gate) = &self.circuit_breaker {
                    gate.release_trial();
                }
                self.record_failed_retry(attempts);
                warn!(attempts, error = %err, "giving up on operation");
                return Err(ToolmeshError::RetriesExhausted {
                    attempts,
                    source: Box::new(err),
                });
            }

            let delay = self.policy.next_delay(attempts - 1);
            self.metrics.total_retries.fetch_add(1, Ordering::Relaxed);
            debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "operation failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(ToolmeshError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn record_failed_retry(&self, attempts: u32) {
        if attempts > 1 {
            self.metrics.failed_retries.fetch_add(1, Ordering::Relaxed);
        }
    }
}
