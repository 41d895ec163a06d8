use serde::{Deserialize, Serialize};
use std::time::Duration;
use toolmesh_common::{Result, ToolmeshError};

/// Connection pool configuration.
///
/// Controls how many connections are kept per server, how long they may live,
/// how they are health-checked and how reconnection backs off.
///
/// # Default Configuration
///
/// - `min_connections`: 2
/// - `max_connections`: 10
/// - `max_idle_time`: 30 minutes
/// - `health_check_interval`: 30 seconds
/// - `health_check_timeout`: 5 seconds
/// - `reconnect_backoff`: 1 second, growing 1.5x per attempt up to 30 seconds
/// - `max_reconnect_attempts`: 5
/// - `connection_timeout`: 10 seconds
/// - `max_connection_age`: 1 hour
/// - `cleanup_interval`: 1 minute
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use toolmesh_pool::ConnectionPoolConfig;
///
/// let config = ConnectionPoolConfig::default()
///     .with_limits(1, 4)
///     .with_connection_timeout(Duration::from_secs(2));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    /// Connections seeded for every server on first use and kept through cleanup
    pub min_connections: usize,
    /// Hard ceiling on live connections per server
    pub max_connections: usize,
    pub max_idle_time: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    /// First reconnect delay
    pub reconnect_backoff: Duration,
    /// Cap on the reconnect delay
    pub max_reconnect_backoff: Duration,
    /// Growth factor of the reconnect delay
    pub reconnect_multiplier: f64,
    pub max_reconnect_attempts: u32,
    /// Bounds both connection creation and waiting for a free connection
    pub connection_timeout: Duration,
    pub max_connection_age: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            max_idle_time: Duration::from_secs(30 * 60),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_backoff: Duration::from_secs(30),
            reconnect_multiplier: 1.5,
            max_reconnect_attempts: 5,
            connection_timeout: Duration::from_secs(10),
            max_connection_age: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl ConnectionPoolConfig {
    pub fn with_limits(mut self, min_connections: usize, max_connections: usize) -> Self {
        self.min_connections = min_connections;
        self.max_connections = max_connections;
        self
    }

    pub fn with_health_check(mut self, interval: Duration, timeout: Duration) -> Self {
        self.health_check_interval = interval;
        self.health_check_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, backoff: Duration, max_backoff: Duration, max_attempts: u32) -> Self {
        self.reconnect_backoff = backoff;
        self.max_reconnect_backoff = max_backoff;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_lifetimes(mut self, max_idle_time: Duration, max_connection_age: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self.max_connection_age = max_connection_age;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Delay before reconnect attempt `attempt + 1`, given the previous delay.
    pub(crate) fn next_reconnect_backoff(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.reconnect_multiplier.max(1.0))
            .min(self.max_reconnect_backoff)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ToolmeshError::InvalidConfig(msg.to_string()));

        if self.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        if self.min_connections > self.max_connections {
            return invalid("min_connections cannot exceed max_connections");
        }
        if self.health_check_interval.is_zero() || self.cleanup_interval.is_zero() {
            return invalid("health_check_interval and cleanup_interval must be non-zero");
        }
        if self.connection_timeout.is_zero() {
            return invalid("connection_timeout must be non-zero");
        }
        if !self.reconnect_multiplier.is_finite() || self.reconnect_multiplier < 1.0 {
            return invalid("reconnect_multiplier must be a finite value of at least 1.0");
        }
        Ok(())
    }
}
