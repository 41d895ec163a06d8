// Copyright 2025 Toolmesh Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-process simulation of a fleet of MCP servers.
//!
//! Builds an [`Orchestrator`] over simulated endpoints whose calls fail at a
//! configurable rate, fires a batch of calls at it with bounded concurrency
//! and reports what happened.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use toolmesh_cache::CacheConfig;
use toolmesh_common::{
    Connection, ConnectionFactory, Result, ToolContent, ToolExecution, ToolResult, ToolmeshError,
};
use toolmesh_orchestrator::{
    LoadBalancerConfig, LoadBalancingStrategy, Orchestrator, OrchestratorConfig, OrchestratorStats,
    ServerEndpoint, ToolInvoker,
};
use toolmesh_retry::{presets, ToolSpecificRetryPolicy};
use tracing::{debug, info};

/// Tools every simulated server offers.
pub const SIMULATED_TOOLS: [&str; 3] = ["web_search", "content_fetch", "summarize_text"];

/// Parameters of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationConfig {
    pub endpoints: usize,
    pub calls: usize,
    pub concurrency: usize,
    /// Probability that a single invocation fails with a transport error
    pub failure_rate: f64,
    pub latency: Duration,
    /// Distinct queries per tool; lower values produce more cache hits
    pub distinct_queries: usize,
    pub strategy: LoadBalancingStrategy,
    pub cache: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            endpoints: 3,
            calls: 100,
            concurrency: 8,
            failure_rate: 0.1,
            latency: Duration::from_millis(20),
            distinct_queries: 10,
            strategy: LoadBalancingStrategy::RoundRobin,
            cache: true,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints == 0 {
            return Err(ToolmeshError::InvalidConfig("endpoints must be greater than zero".into()));
        }
        if self.concurrency == 0 {
            return Err(ToolmeshError::InvalidConfig("concurrency must be greater than zero".into()));
        }
        if self.distinct_queries == 0 {
            return Err(ToolmeshError::InvalidConfig(
                "distinct_queries must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ToolmeshError::InvalidConfig(format!(
                "failure_rate must be in [0, 1], got {}",
                self.failure_rate
            )));
        }
        Ok(())
    }

    fn orchestrator_config(&self) -> OrchestratorConfig {
        let cache = if self.cache {
            CacheConfig::default()
        } else {
            CacheConfig::disabled()
        };
        OrchestratorConfig {
            load_balancer: LoadBalancerConfig::default().with_strategy(self.strategy),
            cache,
            ..Default::default()
        }
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub calls: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Invocations that reached a simulated server, retries included
    pub invocations: u64,
    pub elapsed_ms: u64,
    pub stats: OrchestratorStats,
}

struct SimulatedConnection;

#[async_trait]
impl Connection for SimulatedConnection {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct SimulatedFactory;

#[async_trait]
impl ConnectionFactory for SimulatedFactory {
    async fn create_connection(&self, _server_id: &str) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(SimulatedConnection))
    }
}

struct SimulatedInvoker {
    failure_rate: f64,
    latency: Duration,
    invocations: AtomicU64,
}

#[async_trait]
impl ToolInvoker for SimulatedInvoker {
    async fn invoke(
        &self,
        _conn: Arc<dyn Connection>,
        endpoint: &ServerEndpoint,
        execution: &ToolExecution,
    ) -> Result<ToolResult> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;

        if rand::thread_rng().gen_bool(self.failure_rate) {
            debug!(endpoint = %endpoint.id(), tool = %execution.tool_name, "simulated failure");
            return Err(ToolmeshError::Execution(format!(
                "simulated connection reset by {}",
                endpoint.address()
            )));
        }

        let query = execution
            .arguments
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(ToolResult::success(
            &execution.tool_name,
            endpoint.id(),
            vec![ToolContent::text(format!(
                "{} handled {} for {}",
                endpoint.id(),
                execution.tool_name,
                query
            ))],
            self.latency,
        ))
    }
}

/// Runs a simulation to completion and shuts the orchestrator down.
pub async fn run(config: &SimulationConfig) -> Result<SimulationReport> {
    config.validate()?;

    let invoker = Arc::new(SimulatedInvoker {
        failure_rate: config.failure_rate,
        latency: config.latency,
        invocations: AtomicU64::new(0),
    });
    let orchestrator = Orchestrator::builder(Arc::new(SimulatedFactory), invoker.clone())
        .config(config.orchestrator_config())
        .retry_policy(ToolSpecificRetryPolicy::new(Arc::new(presets::quick())))
        .build()?;

    for i in 0..config.endpoints {
        let id = format!("sim-{}", i + 1);
        orchestrator.add_endpoint(
            ServerEndpoint::new(id.clone(), format!("sim://{}", id)).with_tools(SIMULATED_TOOLS),
        );
    }
    orchestrator.start();

    info!(
        calls = config.calls,
        concurrency = config.concurrency,
        failure_rate = config.failure_rate,
        strategy = %config.strategy,
        "starting simulation"
    );

    let cancel = CancellationToken::new();
    let started = Instant::now();
    let outcomes: Vec<bool> = stream::iter(0..config.calls)
        .map(|i| {
            let execution = ToolExecution::new(SIMULATED_TOOLS[i % SIMULATED_TOOLS.len()], "sim")
                .with_argument("query", format!("query-{}", i % config.distinct_queries));
            let orchestrator = &orchestrator;
            let cancel = &cancel;
            async move {
                match orchestrator.execute_tool(cancel, &execution).await {
                    Ok(result) => result.success,
                    Err(e) => {
                        debug!(tool = %execution.tool_name, error = %e, "simulated call failed");
                        false
                    }
                }
            }
        })
        .buffer_unordered(config.concurrency)
        .collect()
        .await;
    let elapsed = started.elapsed();

    let stats = orchestrator.stats().await;
    orchestrator.close().await;

    let succeeded = outcomes.iter().filter(|ok| **ok).count();
    let report = SimulationReport {
        calls: config.calls,
        succeeded,
        failed: outcomes.len() - succeeded,
        invocations: invoker.invocations.load(Ordering::Relaxed),
        elapsed_ms: elapsed.as_millis() as u64,
        stats,
    };
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        elapsed_ms = report.elapsed_ms,
        "simulation finished"
    );
    Ok(report)
}
