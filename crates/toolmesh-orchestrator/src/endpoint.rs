use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use toolmesh_common::{Result, ToolmeshError};

/// Constants driving endpoint health scores.
///
/// A successful probe moves the score a `recovery_rate` fraction of the way
/// towards 1.0; a failed probe multiplies it by `decay_factor`. Endpoints whose
/// score falls below `unavailable_threshold` are taken out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthScoring {
    pub recovery_rate: f64,
    pub decay_factor: f64,
    pub unavailable_threshold: f64,
}

impl Default for HealthScoring {
    fn default() -> Self {
        Self {
            recovery_rate: 0.1,
            decay_factor: 0.8,
            unavailable_threshold: 0.1,
        }
    }
}

impl HealthScoring {
    pub fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.recovery_rate) || self.recovery_rate == 0.0 {
            return Err(ToolmeshError::InvalidConfig(format!(
                "recovery_rate must be in (0, 1], got {}",
                self.recovery_rate
            )));
        }
        if !unit.contains(&self.decay_factor) {
            return Err(ToolmeshError::InvalidConfig(format!(
                "decay_factor must be in [0, 1], got {}",
                self.decay_factor
            )));
        }
        if !unit.contains(&self.unavailable_threshold) {
            return Err(ToolmeshError::InvalidConfig(format!(
                "unavailable_threshold must be in [0, 1], got {}",
                self.unavailable_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Health {
    score: f64,
    available: bool,
    response_time: Duration,
    last_check: Option<SystemTime>,
}

/// Read-only view of an endpoint for stats output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub id: String,
    pub address: String,
    pub available: bool,
    pub health_score: f64,
    pub connections: usize,
    pub failures: u64,
    pub response_time_ms: u64,
    pub tools: Vec<String>,
}

/// A backend server offering a set of tools.
///
/// Identity, address and tool set are fixed at construction. Health fields
/// move together under one lock so `available` can never be true while the
/// score is below the threshold; load counters are plain atomics shared by
/// every selecting caller.
#[derive(Debug)]
pub struct ServerEndpoint {
    id: String,
    address: String,
    weight: u32,
    max_connections: usize,
    tools: BTreeSet<String>,
    metadata: HashMap<String, String>,
    health: Mutex<Health>,
    connection_count: AtomicUsize,
    failure_count: AtomicU64,
}

impl ServerEndpoint {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight: 1,
            max_connections: 100,
            tools: BTreeSet::new(),
            metadata: HashMap::new(),
            health: Mutex::new(Health {
                score: 1.0,
                available: true,
                response_time: Duration::ZERO,
                last_check: None,
            }),
            connection_count: AtomicUsize::new(0),
            failure_count: AtomicU64::new(0),
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.insert(tool.into());
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(String::as_str)
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.tools.contains(tool)
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn health_score(&self) -> f64 {
        self.health.lock().score
    }

    pub fn is_available(&self) -> bool {
        self.health.lock().available
    }

    pub fn response_time(&self) -> Duration {
        self.health.lock().response_time
    }

    pub fn last_health_check(&self) -> Option<SystemTime> {
        self.health.lock().last_check
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Whether the balancer may route to this endpoint.
    pub fn is_selectable(&self, scoring: &HealthScoring) -> bool {
        let health = self.health.lock();
        health.available && health.score > scoring.unavailable_threshold
    }

    /// Applies a successful probe. Returns true if the endpoint became available.
    pub fn record_success(&self, response_time: Duration, scoring: &HealthScoring) -> bool {
        let mut health = self.health.lock();
        health.score = (health.score + (1.0 - health.score) * scoring.recovery_rate).clamp(0.0, 1.0);
        health.response_time = response_time;
        health.last_check = Some(SystemTime::now());

        if !health.available && health.score >= scoring.unavailable_threshold {
            health.available = true;
            return true;
        }
        false
    }

    /// Applies a failed probe. Returns true if the endpoint became unavailable.
    pub fn record_failure(&self, response_time: Duration, scoring: &HealthScoring) -> bool {
        self.failure_count.fetch_add(1, Ordering::Relaxed);

        let mut health = self.health.lock();
        health.score = (health.score * scoring.decay_factor).clamp(0.0, 1.0);
        health.response_time = response_time;
        health.last_check = Some(SystemTime::now());

        if health.available && health.score < scoring.unavailable_threshold {
            health.available = false;
            return true;
        }
        false
    }

    pub(crate) fn acquire(&self) {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release(&self) {
        // saturating: a stray release never wraps below zero
        let _ = self
            .connection_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn stats(&self) -> EndpointStats {
        let health = *self.health.lock();
        EndpointStats {
            id: self.id.clone(),
            address: self.address.clone(),
            available: health.available,
            health_score: health.score,
            connections: self.connection_count(),
            failures: self.failure_count(),
            response_time_ms: health.response_time.as_millis() as u64,
            tools: self.tools.iter().cloned().collect(),
        }
    }
}
