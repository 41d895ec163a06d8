use crate::config::CacheConfig;
use crate::key::CacheKey;
use crate::memory::MemoryCache;
use crate::store::{CacheStats, NoOpCache, ResultCache};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use toolmesh_common::{Result, ToolExecution, ToolExecutor, ToolResult};
use tracing::{debug, info, warn};

/// Aggregate statistics across every cache owned by a [`CacheManager`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalCacheStats {
    pub enabled: bool,
    pub total_caches: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_keys: usize,
    pub total_size_bytes: usize,
    pub hit_rate: f64,
    pub caches: BTreeMap<String, CacheStats>,
}

/// Puts a result cache in front of a [`ToolExecutor`].
///
/// One cache is kept per `server:tool` pair and created on first use. Cache
/// failures are logged and treated as misses, so a broken cache never fails a
/// call that the executor could have served.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use toolmesh_cache::{CacheConfig, CacheManager};
/// use toolmesh_common::{ToolExecution, ToolExecutor};
///
/// # async fn example(executor: Arc<dyn ToolExecutor>) -> toolmesh_common::Result<()> {
/// let manager = CacheManager::new(executor, CacheConfig::default())?;
///
/// let execution = ToolExecution::new("web_search", "search-1").with_argument("query", "rust");
/// let result = manager.execute_with_cache(&CancellationToken::new(), &execution).await?;
///
/// manager.close().await;
/// # Ok(())
/// # }
/// ```
pub struct CacheManager {
    executor: Arc<dyn ToolExecutor>,
    config: RwLock<CacheConfig>,
    caches: RwLock<HashMap<String, Arc<dyn ResultCache>>>,
    disabled: Arc<dyn ResultCache>,
}

impl CacheManager {
    pub fn new(executor: Arc<dyn ToolExecutor>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            executor,
            config: RwLock::new(config),
            caches: RwLock::new(HashMap::new()),
            disabled: Arc::new(NoOpCache),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    pub fn config(&self) -> CacheConfig {
        self.config.read().clone()
    }

    /// Returns the cache for `server_name:tool_name`, creating it if needed.
    ///
    /// With caching disabled this is a no-op cache.
    pub fn get_cache(&self, tool_name: &str, server_name: &str) -> Arc<dyn ResultCache> {
        let config = self.config.read();
        if !config.enabled {
            return Arc::clone(&self.disabled);
        }

        let name = format!("{}:{}", server_name, tool_name);
        if let Some(cache) = self.caches.read().get(&name) {
            return Arc::clone(cache);
        }

        let mut caches = self.caches.write();
        let cache = caches.entry(name.clone()).or_insert_with(|| {
            let cache = MemoryCache::from_config(name.clone(), &config);
            cache.start();
            debug!(cache = %name, "created result cache");
            Arc::new(cache)
        });
        Arc::clone(cache)
    }

    /// Serves `execution` from cache when possible, otherwise runs it and
    /// caches a successful result.
    ///
    /// # Errors
    ///
    /// Only errors from the wrapped executor are returned. Cache errors are
    /// logged and ignored.
    pub async fn execute_with_cache(
        &self,
        cancel: &CancellationToken,
        execution: &ToolExecution,
    ) -> Result<ToolResult> {
        let key = CacheKey::from_execution(execution);
        let cache = self.get_cache(&execution.tool_name, &execution.server_name);

        match cache.get(&key).await {
            Ok(Some(hit)) => {
                debug!(key = %key, "cache hit");
                return Ok(hit.result);
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "cache lookup failed, executing tool"),
        }

        let started = Instant::now();
        let mut result = self.executor.execute_tool(cancel, execution).await?;

        if !result.success {
            return Ok(result);
        }

        if let Some(first) = result.content.first_mut() {
            let cached_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            first.metadata.insert(
                "execution_time_ms".to_string(),
                Value::from(started.elapsed().as_millis() as u64),
            );
            first.metadata.insert("cached_at".to_string(), Value::from(cached_at));
        }

        let ttl = self.config.read().ttl_for_tool(&execution.tool_name);
        if let Err(e) = cache.set(&key, result.clone(), ttl).await {
            warn!(key = %key, error = %e, "failed to cache tool result");
        }

        Ok(result)
    }

    /// Clears every cache whose `server:tool` name contains `pattern`.
    ///
    /// Returns the number of caches cleared.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> usize {
        let matching: Vec<(String, Arc<dyn ResultCache>)> = self
            .caches
            .read()
            .iter()
            .filter(|(name, _)| name.contains(pattern))
            .map(|(name, cache)| (name.clone(), Arc::clone(cache)))
            .collect();

        let mut cleared = 0;
        for (name, cache) in matching {
            match cache.clear().await {
                Ok(()) => cleared += 1,
                Err(e) => warn!(cache = %name, error = %e, "failed to invalidate cache"),
            }
        }
        if cleared > 0 {
            info!(pattern, cleared, "invalidated caches");
        }
        cleared
    }

    pub async fn global_stats(&self) -> GlobalCacheStats {
        let enabled = self.is_enabled();
        let snapshot = self.snapshot_caches();

        let mut stats = GlobalCacheStats {
            enabled,
            total_caches: snapshot.len(),
            ..Default::default()
        };

        for (name, cache) in snapshot {
            match cache.stats().await {
                Ok(cache_stats) => {
                    stats.hits += cache_stats.hits;
                    stats.misses += cache_stats.misses;
                    stats.evictions += cache_stats.evictions;
                    stats.total_keys += cache_stats.total_keys;
                    stats.total_size_bytes += cache_stats.total_size_bytes;
                    stats.caches.insert(name, cache_stats);
                }
                Err(e) => warn!(cache = %name, error = %e, "failed to read cache stats"),
            }
        }
        stats.hit_rate = CacheStats::compute_hit_rate(stats.hits, stats.misses);
        stats
    }

    /// Replaces the configuration. Disabling caching closes and drops every cache.
    pub async fn configure(&self, config: CacheConfig) -> Result<()> {
        config.validate()?;
        let enabled = config.enabled;
        *self.config.write() = config;

        if !enabled {
            self.close().await;
            info!("result caching disabled");
        }
        Ok(())
    }

    /// Closes every cache and forgets them.
    pub async fn close(&self) {
        let caches: Vec<(String, Arc<dyn ResultCache>)> = self.caches.write().drain().collect();
        for (name, cache) in caches {
            if let Err(e) = cache.close().await {
                warn!(cache = %name, error = %e, "failed to close cache");
            }
        }
    }

    fn snapshot_caches(&self) -> Vec<(String, Arc<dyn ResultCache>)> {
        self.caches
            .read()
            .iter()
            .map(|(name, cache)| (name.clone(), Arc::clone(cache)))
            .collect()
    }
}
