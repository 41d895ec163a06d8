use crate::endpoint::ServerEndpoint;
use crate::health_checker::{EndpointProber, FactoryProber};
use crate::load_balancer::{LoadBalancer, LoadBalancerConfig, LoadBalancerStats};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use toolmesh_cache::{CacheConfig, CacheManager, GlobalCacheStats};
use toolmesh_common::{
    Connection, ConnectionFactory, Result, ToolExecution, ToolExecutor, ToolResult, ToolmeshError,
};
use toolmesh_metrics::{MetricsConfig, MetricsRegistry, MetricsSnapshot};
use toolmesh_pool::{ConnectionPool, ConnectionPoolConfig, PoolStats};
use toolmesh_retry::{
    classify_error, AdaptiveConfig, AdaptiveRetryPolicy, CircuitBreaker, CircuitBreakerConfig,
    CircuitGate, CircuitState, RetryClassification, RetryExecutor, RetryMetrics,
    RetryMetricsSnapshot, RetryPolicy, ToolSpecificRetryPolicy,
};
use tracing::{debug, info};

/// Performs a tool call over a pooled connection.
///
/// This is the protocol-specific part the embedding application supplies. A
/// returned `Err` is a transport failure and may be retried on another
/// endpoint; a `ToolResult` with `success == false` is a tool-level failure and
/// is passed through as is.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        conn: Arc<dyn Connection>,
        endpoint: &ServerEndpoint,
        execution: &ToolExecution,
    ) -> Result<ToolResult>;
}

/// Configuration for every component the orchestrator owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub load_balancer: LoadBalancerConfig,
    pub pool: ConnectionPoolConfig,
    pub cache: CacheConfig,
    /// One breaker is created per tool with this configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Wraps the routed retry policy of each `server:tool` pair when set
    #[serde(default)]
    pub adaptive_retry: Option<AdaptiveConfig>,
    pub metrics: MetricsConfig,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        self.load_balancer.validate()?;
        self.pool.validate()?;
        self.cache.validate()?;
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(ToolmeshError::InvalidConfig(
                "circuit breaker thresholds must be greater than zero".into(),
            ));
        }
        if let Some(adaptive) = &self.adaptive_retry {
            if adaptive.window_size == 0 {
                return Err(ToolmeshError::InvalidConfig(
                    "adaptive retry window_size must be greater than zero".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Point-in-time view of every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub load_balancer: LoadBalancerStats,
    pub pool: PoolStats,
    pub cache: GlobalCacheStats,
    pub retry: RetryMetricsSnapshot,
    pub metrics: MetricsSnapshot,
    pub circuit_breakers: BTreeMap<String, CircuitState>,
}

/// Builds an [`Orchestrator`].
pub struct OrchestratorBuilder {
    factory: Arc<dyn ConnectionFactory>,
    invoker: Arc<dyn ToolInvoker>,
    config: OrchestratorConfig,
    retry_policy: ToolSpecificRetryPolicy,
    prober: Option<Arc<dyn EndpointProber>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_policy(mut self, policy: ToolSpecificRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Overrides the endpoint health probe. Defaults to a [`FactoryProber`]
    /// over the connection factory.
    pub fn prober(mut self, prober: Arc<dyn EndpointProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;

        let prober = self
            .prober
            .unwrap_or_else(|| Arc::new(FactoryProber::new(Arc::clone(&self.factory))));
        let load_balancer = Arc::new(LoadBalancer::new(self.config.load_balancer.clone(), prober)?);
        let pool = Arc::new(ConnectionPool::new(self.config.pool.clone(), self.factory)?);
        let metrics = Arc::new(MetricsRegistry::with_config(self.config.metrics.clone()));

        let routed = Arc::new(RoutedExecutor {
            load_balancer: Arc::clone(&load_balancer),
            pool: Arc::clone(&pool),
            invoker: self.invoker,
            retry_policy: self.retry_policy,
            adaptive_config: self.config.adaptive_retry.clone(),
            adaptive: RwLock::new(HashMap::new()),
            breaker_config: self.config.circuit_breaker.clone(),
            breakers: RwLock::new(HashMap::new()),
            retry_metrics: Arc::new(RetryMetrics::new()),
            metrics: Arc::clone(&metrics),
        });
        let cache = CacheManager::new(Arc::clone(&routed) as Arc<dyn ToolExecutor>, self.config.cache)?;

        Ok(Orchestrator {
            load_balancer,
            pool,
            metrics,
            routed,
            cache,
        })
    }
}

/// The uncached call path: retry around lease, pool checkout and invoke.
struct RoutedExecutor {
    load_balancer: Arc<LoadBalancer>,
    pool: Arc<ConnectionPool>,
    invoker: Arc<dyn ToolInvoker>,
    retry_policy: ToolSpecificRetryPolicy,
    adaptive_config: Option<AdaptiveConfig>,
    /// Keyed by `server:tool`
    adaptive: RwLock<HashMap<String, Arc<AdaptiveRetryPolicy>>>,
    breaker_config: CircuitBreakerConfig,
    /// Keyed by tool name
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    retry_metrics: Arc<RetryMetrics>,
    metrics: Arc<MetricsRegistry>,
}

impl RoutedExecutor {
    fn breaker_for(&self, tool_name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(tool_name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(tool_name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(tool_name, self.breaker_config.clone()))
        });
        Arc::clone(breaker)
    }

    fn adaptive_for(&self, execution: &ToolExecution) -> Option<Arc<AdaptiveRetryPolicy>> {
        let config = self.adaptive_config.as_ref()?;
        let key = format!("{}:{}", execution.server_name, execution.tool_name);
        if let Some(policy) = self.adaptive.read().get(&key) {
            return Some(Arc::clone(policy));
        }
        let mut adaptive = self.adaptive.write();
        let policy = adaptive.entry(key).or_insert_with(|| {
            let base = self
                .retry_policy
                .policy_for(&execution.tool_name, &execution.server_name);
            Arc::new(AdaptiveRetryPolicy::new(base, config.clone()))
        });
        Some(Arc::clone(policy))
    }

    async fn attempt(
        &self,
        cancel: &CancellationToken,
        execution: &ToolExecution,
        breaker: &CircuitBreaker,
        adaptive: Option<&AdaptiveRetryPolicy>,
    ) -> Result<ToolResult> {
        let started = Instant::now();
        let lease = match self.load_balancer.acquire_endpoint(&execution.tool_name) {
            Ok(lease) => lease,
            Err(e) => {
                let outcome = Err(e);
                self.record(execution, None, started, &outcome, breaker, adaptive);
                return outcome;
            }
        };

        let outcome = self
            .invoke_on(cancel, lease.endpoint(), execution)
            .await
            .map(|mut result| {
                result.server_name = lease.id().to_string();
                result.duration = started.elapsed();
                result
            });
        self.record(execution, Some(lease.id()), started, &outcome, breaker, adaptive);
        outcome
    }

    async fn invoke_on(
        &self,
        cancel: &CancellationToken,
        endpoint: &Arc<ServerEndpoint>,
        execution: &ToolExecution,
    ) -> Result<ToolResult> {
        let conn = self.pool.get_connection(cancel, endpoint.id()).await?;
        let handle = match conn.use_handle() {
            Ok(handle) => handle,
            Err(e) => {
                self.pool.return_connection(conn).await;
                return Err(e);
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ToolmeshError::Cancelled),
            outcome = self.invoker.invoke(handle, endpoint, execution) => outcome,
        };
        self.pool.return_connection(conn).await;
        outcome
    }

    fn record(
        &self,
        execution: &ToolExecution,
        endpoint: Option<&str>,
        started: Instant,
        outcome: &Result<ToolResult>,
        breaker: &CircuitBreaker,
        adaptive: Option<&AdaptiveRetryPolicy>,
    ) {
        let success = matches!(outcome, Ok(result) if result.success);
        self.metrics
            .record_execution(&execution.tool_name, endpoint, started.elapsed(), success);

        match outcome {
            Ok(_) => {
                breaker.record_success();
                if let Some(policy) = adaptive {
                    policy.record_result(true);
                }
            }
            // only failures a retry could fix count against the circuit
            Err(e) if classify_error(e) != RetryClassification::NonRetryable => {
                breaker.record_failure();
                if let Some(policy) = adaptive {
                    policy.record_result(false);
                }
            }
            Err(_) => breaker.release_trial(),
        }
    }
}

#[async_trait]
impl ToolExecutor for RoutedExecutor {
    async fn execute_tool(
        &self,
        cancel: &CancellationToken,
        execution: &ToolExecution,
    ) -> Result<ToolResult> {
        let breaker = self.breaker_for(&execution.tool_name);
        if let Err(e) = breaker.allow_request() {
            self.metrics.record_circuit_rejection();
            debug!(tool = %execution.tool_name, "circuit open, rejecting call");
            return Err(e);
        }

        let adaptive = self.adaptive_for(execution);
        let policy: Arc<dyn RetryPolicy> = match &adaptive {
            Some(policy) => Arc::clone(policy) as Arc<dyn RetryPolicy>,
            None => self
                .retry_policy
                .policy_for(&execution.tool_name, &execution.server_name),
        };
        let executor = RetryExecutor::new(policy)
            .with_circuit_breaker(Arc::clone(&breaker) as Arc<dyn CircuitGate>)
            .with_metrics(Arc::clone(&self.retry_metrics));

        let breaker = breaker.as_ref();
        let adaptive = adaptive.as_deref();
        executor
            .execute_with_result(cancel, || async move {
                self.attempt(cancel, execution, breaker, adaptive).await
            })
            .await
    }
}

/// Resilient tool-call front end.
///
/// # Call path
///
/// 1. The result cache for the `server:tool` pair is consulted
/// 2. On a miss, the tool's circuit breaker must allow the call
/// 3. Under the routed retry policy, each attempt:
///    - leases an endpoint offering the tool from the load balancer
///    - checks out a pooled connection to that endpoint
///    - hands it to the [`ToolInvoker`] and returns it to the pool
/// 4. A successful result is cached
///
/// The returned result's `server_name` is the endpoint that served it, which
/// may differ from the server named in the request. Every attempt feeds the
/// breaker, the adaptive policy (if configured) and the metrics registry.
///
/// Background work (endpoint health checks, pool cleanup) runs only between
/// [`start`](Self::start) and [`close`](Self::close).
pub struct Orchestrator {
    load_balancer: Arc<LoadBalancer>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<MetricsRegistry>,
    routed: Arc<RoutedExecutor>,
    cache: CacheManager,
}

impl Orchestrator {
    pub fn builder(factory: Arc<dyn ConnectionFactory>, invoker: Arc<dyn ToolInvoker>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            factory,
            invoker,
            config: OrchestratorConfig::default(),
            retry_policy: ToolSpecificRetryPolicy::default(),
            prober: None,
        }
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn circuit_state(&self, tool_name: &str) -> Option<CircuitState> {
        self.routed.breakers.read().get(tool_name).map(|b| b.state())
    }

    pub fn add_endpoint(&self, endpoint: ServerEndpoint) -> Arc<ServerEndpoint> {
        self.load_balancer.add_endpoint(endpoint)
    }

    pub fn remove_endpoint(&self, endpoint_id: &str) -> Result<Arc<ServerEndpoint>> {
        self.load_balancer.remove_endpoint(endpoint_id)
    }

    /// Runs a tool call through the cache, retry and routing layers.
    pub async fn execute_tool(
        &self,
        cancel: &CancellationToken,
        execution: &ToolExecution,
    ) -> Result<ToolResult> {
        self.cache.execute_with_cache(cancel, execution).await
    }

    pub fn start(&self) {
        self.load_balancer.start();
        self.pool.start();
        info!(
            endpoints = self.load_balancer.get_endpoints().len(),
            strategy = %self.load_balancer.strategy(),
            "orchestrator started"
        );
    }

    /// Stops health checks and sweeps, then closes every pooled connection.
    pub async fn close(&self) {
        self.load_balancer.stop().await;
        self.cache.close().await;
        self.pool.close().await;
        info!("orchestrator closed");
    }

    pub async fn stats(&self) -> OrchestratorStats {
        let circuit_breakers = self
            .routed
            .breakers
            .read()
            .iter()
            .map(|(tool, breaker)| (tool.clone(), breaker.state()))
            .collect();

        OrchestratorStats {
            load_balancer: self.load_balancer.stats(),
            pool: self.pool.stats(),
            cache: self.cache.global_stats().await,
            retry: self.routed.retry_metrics.snapshot(),
            metrics: self.metrics.snapshot(),
            circuit_breakers,
        }
    }
}

#[async_trait]
impl ToolExecutor for Orchestrator {
    async fn execute_tool(
        &self,
        cancel: &CancellationToken,
        execution: &ToolExecution,
    ) -> Result<ToolResult> {
        Orchestrator::execute_tool(self, cancel, execution).await
    }
}
