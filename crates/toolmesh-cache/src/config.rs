use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use toolmesh_common::{Result, ToolmeshError};

/// Cache configuration.
///
/// # Default Configuration
///
/// - `enabled`: true
/// - `default_ttl`: 15 minutes
/// - `max_keys`: 10 000 per cache
/// - `cleanup_interval`: 5 minutes
/// - per-tool TTLs for the common research tools (see [`CacheConfig::default`])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl: Duration,
    /// Maximum entries per `server:tool` cache before LRU eviction kicks in
    pub max_keys: usize,
    /// How often the background sweep removes expired entries
    pub cleanup_interval: Duration,
    #[serde(default)]
    pub tool_ttls: HashMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let minutes = |m: u64| Duration::from_secs(m * 60);
        let tool_ttls = [
            ("web_search", minutes(5)),
            ("content_fetch", minutes(30)),
            ("summarize_text", minutes(60)),
            ("sentiment_analysis", minutes(45)),
            ("compute_metric", minutes(20)),
            ("entity_extraction", minutes(60)),
        ]
        .into_iter()
        .map(|(tool, ttl)| (tool.to_string(), ttl))
        .collect();

        Self {
            enabled: true,
            default_ttl: minutes(15),
            max_keys: 10_000,
            cleanup_interval: minutes(5),
            tool_ttls,
        }
    }
}

impl CacheConfig {
    /// A configuration under which every lookup misses and every write is dropped.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_tool_ttl(mut self, tool_name: impl Into<String>, ttl: Duration) -> Self {
        self.tool_ttls.insert(tool_name.into(), ttl);
        self
    }

    /// TTL for results of `tool_name`, falling back to `default_ttl`.
    pub fn ttl_for_tool(&self, tool_name: &str) -> Duration {
        self.tool_ttls
            .get(tool_name)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_keys == 0 {
            return Err(ToolmeshError::InvalidConfig("cache max_keys must be at least 1".into()));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ToolmeshError::InvalidConfig("cache cleanup_interval must be non-zero".into()));
        }
        Ok(())
    }
}
