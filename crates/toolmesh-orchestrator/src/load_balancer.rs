use crate::endpoint::{EndpointStats, HealthScoring, ServerEndpoint};
use crate::health_checker::{EndpointHealthChecker, EndpointProber};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use toolmesh_common::{Result, ToolmeshError};
use tracing::{debug, info};

/// How the balancer picks among healthy endpoints offering a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    Random,
    HealthBased,
    ResponseTimeBased,
}

impl LoadBalancingStrategy {
    pub const ALL: [LoadBalancingStrategy; 6] = [
        LoadBalancingStrategy::RoundRobin,
        LoadBalancingStrategy::LeastConnections,
        LoadBalancingStrategy::WeightedRoundRobin,
        LoadBalancingStrategy::Random,
        LoadBalancingStrategy::HealthBased,
        LoadBalancingStrategy::ResponseTimeBased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::LeastConnections => "least_connections",
            LoadBalancingStrategy::WeightedRoundRobin => "weighted_round_robin",
            LoadBalancingStrategy::Random => "random",
            LoadBalancingStrategy::HealthBased => "health_based",
            LoadBalancingStrategy::ResponseTimeBased => "response_time_based",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = ToolmeshError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == wanted)
            .ok_or_else(|| ToolmeshError::InvalidConfig(format!("unknown load balancing strategy: {}", s)))
    }
}

/// Load balancer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalancingStrategy,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub scoring: HealthScoring,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            scoring: HealthScoring::default(),
        }
    }
}

impl LoadBalancerConfig {
    pub fn with_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_health_check(mut self, interval: Duration, timeout: Duration) -> Self {
        self.health_check_interval = interval;
        self.health_check_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_check_interval.is_zero() {
            return Err(ToolmeshError::InvalidConfig(
                "health_check_interval must be greater than zero".into(),
            ));
        }
        if self.health_check_timeout.is_zero() {
            return Err(ToolmeshError::InvalidConfig(
                "health_check_timeout must be greater than zero".into(),
            ));
        }
        self.scoring.validate()
    }
}

/// Snapshot of the balancer and its endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerStats {
    pub strategy: LoadBalancingStrategy,
    pub total_endpoints: usize,
    pub tools_supported: usize,
    pub healthy_endpoints: usize,
    pub total_connections: usize,
    pub endpoints: BTreeMap<String, EndpointStats>,
}

/// A selected endpoint whose in-use count is released on drop.
#[derive(Debug)]
pub struct EndpointLease {
    endpoint: Arc<ServerEndpoint>,
}

impl EndpointLease {
    pub fn endpoint(&self) -> &Arc<ServerEndpoint> {
        &self.endpoint
    }
}

impl Deref for EndpointLease {
    type Target = ServerEndpoint;

    fn deref(&self) -> &ServerEndpoint {
        &self.endpoint
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        self.endpoint.release();
    }
}

#[derive(Default)]
struct Registry {
    endpoints: HashMap<String, Arc<ServerEndpoint>>,
    /// Endpoints per tool, in registration order
    by_tool: HashMap<String, Vec<Arc<ServerEndpoint>>>,
}

impl Registry {
    fn remove(&mut self, id: &str) -> Option<Arc<ServerEndpoint>> {
        let removed = self.endpoints.remove(id)?;
        for tool in removed.tools() {
            if let Some(candidates) = self.by_tool.get_mut(tool) {
                candidates.retain(|e| e.id() != id);
                if candidates.is_empty() {
                    self.by_tool.remove(tool);
                }
            }
        }
        Some(removed)
    }
}

/// Chooses an endpoint for each tool call.
///
/// # Architecture
///
/// - A registry of endpoints plus a tool-to-endpoints index, behind one lock
/// - Candidates are filtered to endpoints that are available with a health
///   score above the configured threshold, then the strategy picks one
/// - Round robin counters are kept per tool
/// - Each endpoint has its own health-check loop once [`start`](Self::start)ed
///
/// Selection increments the chosen endpoint's in-use count. Pair every
/// [`select_endpoint`](Self::select_endpoint) with one
/// [`release_endpoint`](Self::release_endpoint), or use
/// [`acquire_endpoint`](Self::acquire_endpoint) which releases on drop.
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    registry: RwLock<Registry>,
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    health_checker: EndpointHealthChecker,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig, prober: Arc<dyn EndpointProber>) -> Result<Self> {
        config.validate()?;
        let health_checker = EndpointHealthChecker::new(
            prober,
            config.health_check_interval,
            config.health_check_timeout,
            config.scoring,
        );
        Ok(Self {
            config,
            registry: RwLock::new(Registry::default()),
            counters: RwLock::new(HashMap::new()),
            health_checker,
        })
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.config.strategy
    }

    pub fn health_checker(&self) -> &EndpointHealthChecker {
        &self.health_checker
    }

    /// Registers an endpoint, replacing any endpoint with the same id.
    pub fn add_endpoint(&self, endpoint: ServerEndpoint) -> Arc<ServerEndpoint> {
        let endpoint = Arc::new(endpoint);
        let replaced = {
            let mut registry = self.registry.write();
            let replaced = registry.remove(endpoint.id());
            registry
                .endpoints
                .insert(endpoint.id().to_string(), Arc::clone(&endpoint));
            for tool in endpoint.tools() {
                registry
                    .by_tool
                    .entry(tool.to_string())
                    .or_default()
                    .push(Arc::clone(&endpoint));
            }
            replaced
        };

        if replaced.is_some() {
            self.health_checker.unwatch(endpoint.id());
        }
        self.health_checker.watch(Arc::clone(&endpoint));

        info!(
            endpoint = %endpoint.id(),
            address = %endpoint.address(),
            tools = endpoint.tools().count(),
            replaced = replaced.is_some(),
            "registered endpoint"
        );
        endpoint
    }

    /// Stops the endpoint's health checks and removes it.
    ///
    /// # Errors
    ///
    /// Returns `EndpointNotFound` for an unknown id.
    pub fn remove_endpoint(&self, endpoint_id: &str) -> Result<Arc<ServerEndpoint>> {
        if !self.registry.read().endpoints.contains_key(endpoint_id) {
            return Err(ToolmeshError::EndpointNotFound(endpoint_id.to_string()));
        }
        self.health_checker.unwatch(endpoint_id);

        let removed = self
            .registry
            .write()
            .remove(endpoint_id)
            .ok_or_else(|| ToolmeshError::EndpointNotFound(endpoint_id.to_string()))?;
        info!(endpoint = %endpoint_id, "removed endpoint");
        Ok(removed)
    }

    /// Picks an endpoint for `tool_name` and counts it as in use.
    ///
    /// # Errors
    ///
    /// - `NoEndpointsForTool` if no endpoint offers the tool
    /// - `EndpointUnavailable` if none of them is currently healthy
    pub fn select_endpoint(&self, tool_name: &str) -> Result<Arc<ServerEndpoint>> {
        let selected = {
            let registry = self.registry.read();
            let candidates = registry
                .by_tool
                .get(tool_name)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| ToolmeshError::NoEndpointsForTool(tool_name.to_string()))?;

            let healthy: Vec<&Arc<ServerEndpoint>> = candidates
                .iter()
                .filter(|e| e.is_selectable(&self.config.scoring))
                .collect();
            if healthy.is_empty() {
                return Err(ToolmeshError::EndpointUnavailable(tool_name.to_string()));
            }

            Arc::clone(self.pick(tool_name, &healthy))
        };

        selected.acquire();
        debug!(
            tool = %tool_name,
            endpoint = %selected.id(),
            strategy = %self.config.strategy,
            "selected endpoint"
        );
        Ok(selected)
    }

    /// Releases an endpoint returned by [`select_endpoint`](Self::select_endpoint).
    pub fn release_endpoint(&self, endpoint: &ServerEndpoint) {
        endpoint.release();
    }

    /// Like [`select_endpoint`](Self::select_endpoint), releasing when the lease drops.
    pub fn acquire_endpoint(&self, tool_name: &str) -> Result<EndpointLease> {
        self.select_endpoint(tool_name)
            .map(|endpoint| EndpointLease { endpoint })
    }

    fn pick<'a>(&self, tool_name: &str, healthy: &[&'a Arc<ServerEndpoint>]) -> &'a Arc<ServerEndpoint> {
        match self.config.strategy {
            LoadBalancingStrategy::RoundRobin => self.round_robin(tool_name, healthy),
            LoadBalancingStrategy::LeastConnections => {
                first_best(healthy, |a, b| a.connection_count() < b.connection_count())
            }
            LoadBalancingStrategy::WeightedRoundRobin => self.weighted_round_robin(tool_name, healthy),
            LoadBalancingStrategy::Random => healthy[rand::thread_rng().gen_range(0..healthy.len())],
            LoadBalancingStrategy::HealthBased => {
                first_best(healthy, |a, b| a.health_score() > b.health_score())
            }
            LoadBalancingStrategy::ResponseTimeBased => {
                first_best(healthy, |a, b| a.response_time() < b.response_time())
            }
        }
    }

    fn next_count(&self, tool_name: &str) -> u64 {
        let counter = {
            let existing = self.counters.read().get(tool_name).cloned();
            match existing {
                Some(counter) => counter,
                None => Arc::clone(
                    self.counters
                        .write()
                        .entry(tool_name.to_string())
                        .or_insert_with(|| Arc::new(AtomicU64::new(0))),
                ),
            }
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn round_robin<'a>(&self, tool_name: &str, healthy: &[&'a Arc<ServerEndpoint>]) -> &'a Arc<ServerEndpoint> {
        let count = self.next_count(tool_name);
        healthy[((count - 1) % healthy.len() as u64) as usize]
    }

    fn weighted_round_robin<'a>(
        &self,
        tool_name: &str,
        healthy: &[&'a Arc<ServerEndpoint>],
    ) -> &'a Arc<ServerEndpoint> {
        let total_weight: u64 = healthy.iter().map(|e| e.weight() as u64).sum();
        if total_weight == 0 {
            return self.round_robin(tool_name, healthy);
        }

        let point = (self.next_count(tool_name) - 1) % total_weight;
        let mut band_end = 0;
        for &endpoint in healthy {
            band_end += endpoint.weight() as u64;
            if point < band_end {
                return endpoint;
            }
        }
        healthy[healthy.len() - 1]
    }

    /// Every registered endpoint, ordered by id.
    pub fn get_endpoints(&self) -> Vec<Arc<ServerEndpoint>> {
        let mut endpoints: Vec<_> = self.registry.read().endpoints.values().cloned().collect();
        endpoints.sort_by(|a, b| a.id().cmp(b.id()));
        endpoints
    }

    /// Endpoints offering `tool_name`, in registration order, healthy or not.
    pub fn get_endpoints_for_tool(&self, tool_name: &str) -> Vec<Arc<ServerEndpoint>> {
        self.registry
            .read()
            .by_tool
            .get(tool_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> LoadBalancerStats {
        let registry = self.registry.read();
        let endpoints: BTreeMap<String, EndpointStats> = registry
            .endpoints
            .iter()
            .map(|(id, endpoint)| (id.clone(), endpoint.stats()))
            .collect();

        LoadBalancerStats {
            strategy: self.config.strategy,
            total_endpoints: endpoints.len(),
            tools_supported: registry.by_tool.len(),
            healthy_endpoints: registry
                .endpoints
                .values()
                .filter(|e| e.is_selectable(&self.config.scoring))
                .count(),
            total_connections: endpoints.values().map(|e| e.connections).sum(),
            endpoints,
        }
    }

    /// Starts health checks for every registered endpoint.
    pub fn start(&self) {
        self.health_checker.start(self.get_endpoints());
    }

    /// Stops every health-check loop and waits for them.
    pub async fn stop(&self) {
        self.health_checker.stop().await;
    }
}

/// First endpoint for which no later endpoint is strictly better.
fn first_best<'a>(
    healthy: &[&'a Arc<ServerEndpoint>],
    better: impl Fn(&Arc<ServerEndpoint>, &Arc<ServerEndpoint>) -> bool,
) -> &'a Arc<ServerEndpoint> {
    let mut best = healthy[0];
    for candidate in &healthy[1..] {
        if better(*candidate, best) {
            best = *candidate;
        }
    }
    best
}
