//! Retry and circuit-breaking for toolmesh.
//!
//! - [`classify_error`] maps a [`ToolmeshError`](toolmesh_common::ToolmeshError)
//!   to a [`RetryClassification`]
//! - [`RetryPolicy`] implementations decide whether and when to retry
//! - [`RetryExecutor`] runs an operation under a policy, consulting an optional
//!   [`CircuitGate`] before every retry
//!
//! Policies are shared behind `Arc` and are safe to use from many executions at
//! once. [`AdaptiveRetryPolicy`] is the only one with state, and that state is a
//! rolling window of outcomes the caller reports explicitly.

mod circuit_breaker;
mod classification;
mod executor;
mod policy;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitGate, CircuitState};
pub use classification::{classify_error, RetryClassification};
pub use executor::{RetryExecutor, RetryMetrics, RetryMetricsSnapshot};
pub use policy::{
    presets, AdaptiveConfig, AdaptiveRetryPolicy, ExponentialBackoffPolicy, LinearBackoffPolicy,
    RetryPolicy, ToolSpecificRetryPolicy,
};
