//! Toolmesh Orchestrator
//!
//! Routes tool calls across redundant MCP servers.
//!
//! - [`ServerEndpoint`]: a server, the tools it offers and its health score
//! - [`LoadBalancer`]: picks a healthy endpoint for a tool using a
//!   [`LoadBalancingStrategy`]
//! - [`EndpointHealthChecker`]: probes each endpoint on an interval through an
//!   [`EndpointProber`]
//! - [`Orchestrator`]: the full call path, composing the balancer with the
//!   connection pool, retry executor, circuit breakers, result cache and
//!   metrics registry

pub mod endpoint;
pub mod health_checker;
pub mod load_balancer;
pub mod orchestrator;

pub use endpoint::{EndpointStats, HealthScoring, ServerEndpoint};
pub use health_checker::{EndpointHealthChecker, EndpointProber, FactoryProber};
pub use load_balancer::{
    EndpointLease, LoadBalancer, LoadBalancerConfig, LoadBalancerStats, LoadBalancingStrategy,
};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, OrchestratorConfig, OrchestratorStats, ToolInvoker,
};
