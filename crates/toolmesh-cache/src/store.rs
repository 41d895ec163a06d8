use crate::key::CacheKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use toolmesh_common::{Result, ToolResult};

/// A stored tool result with its freshness bookkeeping.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub result: ToolResult,
    pub cached_at: Instant,
    pub ttl: Duration,
    pub last_access: Instant,
    pub access_count: u64,
    pub size_bytes: usize,
}

impl CachedResult {
    /// An entry is fresh strictly before `cached_at + ttl`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.cached_at) >= self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

/// Counters reported by a cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_keys: usize,
    pub total_size_bytes: usize,
    pub hit_rate: f64,
    pub last_cleanup: Option<SystemTime>,
}

impl CacheStats {
    pub(crate) fn compute_hit_rate(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// A keyed store of tool results.
///
/// Reads never hand out references into the store: `get` returns an owned
/// copy, so callers cannot change what other callers will see.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>>;

    async fn set(&self, key: &CacheKey, result: ToolResult, ttl: Duration) -> Result<()>;

    /// Returns whether an entry was removed.
    async fn delete(&self, key: &CacheKey) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    /// TTL-aware: an expired entry does not exist.
    async fn exists(&self, key: &CacheKey) -> Result<bool>;

    async fn stats(&self) -> Result<CacheStats>;

    /// Removes every expired entry, returning how many were dropped.
    async fn cleanup(&self) -> Result<usize>;

    /// Stops background work. The cache must not be used afterwards.
    async fn close(&self) -> Result<()>;
}

/// A cache that stores nothing. Every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCache;

#[async_trait]
impl ResultCache for NoOpCache {
    async fn get(&self, _key: &CacheKey) -> Result<Option<CachedResult>> {
        Ok(None)
    }

    async fn set(&self, _key: &CacheKey, _result: ToolResult, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &CacheKey) -> Result<bool> {
        Ok(false)
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _key: &CacheKey) -> Result<bool> {
        Ok(false)
    }

    async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats::default())
    }

    async fn cleanup(&self) -> Result<usize> {
        Ok(0)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[tokio::test]
    async fn test_noop_cache_never_stores() {
        let cache = NoOpCache;
        let key = CacheKey::new("echo", "s1", &Map::new());
        let result = ToolResult::success("echo", "s1", Vec::new(), Duration::ZERO);

        cache.set(&key, result, Duration::from_secs(60)).await.unwrap();

        assert!(cache.get(&key).await.unwrap().is_none());
        assert!(!cache.exists(&key).await.unwrap());
        assert_eq!(cache.stats().await.unwrap(), CacheStats::default());
    }
}
