//! In-memory TTL/LRU cache.
//!
//! Entries live in a `HashMap` keyed by the rendered [`CacheKey`]. Recency is
//! tracked with a monotonically increasing tick per access, mirrored in a
//! `BTreeMap<tick, key>` so the least recently used key is always the first
//! entry of that map.

use crate::config::CacheConfig;
use crate::key::CacheKey;
use crate::store::{CacheStats, CachedResult, ResultCache};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use toolmesh_common::{Result, ToolResult};
use tracing::{debug, warn};

struct Entry {
    cached: CachedResult,
    tick: u64,
}

#[derive(Default)]
struct CacheState {
    data: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    total_size: usize,
    last_cleanup: Option<SystemTime>,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.data.remove(key)?;
        self.order.remove(&entry.tick);
        self.total_size = self.total_size.saturating_sub(entry.cached.size_bytes);
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        if let Some(entry) = self.data.remove(&key) {
            self.total_size = self.total_size.saturating_sub(entry.cached.size_bytes);
        }
        self.evictions += 1;
        Some(key)
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .data
            .iter()
            .filter(|(_, entry)| entry.cached.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }
        self.last_cleanup = Some(SystemTime::now());
        expired.len()
    }
}

/// Bounded in-memory cache with TTL expiry and LRU eviction.
///
/// Expired entries are dropped lazily on read and actively by
/// [`cleanup`](ResultCache::cleanup), which a background task calls every
/// `cleanup_interval` once [`start`](Self::start) has been called.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use serde_json::Map;
/// use toolmesh_cache::{CacheKey, MemoryCache, ResultCache};
/// use toolmesh_common::ToolResult;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let cache = MemoryCache::new("s1:echo", 100, Duration::from_secs(60));
/// let key = CacheKey::new("echo", "s1", &Map::new());
/// let result = ToolResult::success("echo", "s1", Vec::new(), Duration::ZERO);
///
/// cache.set(&key, result, Duration::from_secs(30)).await.unwrap();
/// assert!(cache.get(&key).await.unwrap().is_some());
/// # });
/// ```
pub struct MemoryCache {
    name: String,
    max_keys: usize,
    cleanup_interval: Duration,
    state: Arc<Mutex<CacheState>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl MemoryCache {
    pub fn new(name: impl Into<String>, max_keys: usize, cleanup_interval: Duration) -> Self {
        Self {
            name: name.into(),
            max_keys: max_keys.max(1),
            cleanup_interval,
            state: Arc::new(Mutex::new(CacheState::default())),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CacheConfig) -> Self {
        Self::new(name, config.max_keys, config.cleanup_interval)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the periodic expiry sweep on the current tokio runtime.
    ///
    /// Outside a runtime no sweep runs and expired entries are only dropped
    /// when read or evicted.
    pub fn start(&self) {
        if self.shutdown.is_cancelled() || self.cleanup_interval.is_zero() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(cache = %self.name, "no tokio runtime, expiry sweep not started");
            return;
        };

        let state = Arc::clone(&self.state);
        let shutdown = self.shutdown.clone();
        let interval = self.cleanup_interval;
        let name = self.name.clone();

        let sweep = async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = state.lock().sweep(Instant::now());
                        if removed > 0 {
                            debug!(cache = %name, removed, "swept expired cache entries");
                        }
                    }
                }
            }
        };
        self.tracker.spawn_on(sweep, &handle);
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>> {
        let key = key.to_string();
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = match state.data.get(&key) {
            None => {
                state.misses += 1;
                return Ok(None);
            }
            Some(entry) => entry.cached.is_expired_at(now),
        };

        if expired {
            state.remove(&key);
            state.misses += 1;
            return Ok(None);
        }

        let tick = state.tick();
        state.hits += 1;
        let Some(entry) = state.data.get_mut(&key) else {
            return Ok(None);
        };
        let previous_tick = std::mem::replace(&mut entry.tick, tick);
        entry.cached.access_count += 1;
        entry.cached.last_access = now;
        let copy = entry.cached.clone();

        state.order.remove(&previous_tick);
        state.order.insert(tick, key);
        Ok(Some(copy))
    }

    async fn set(&self, key: &CacheKey, result: ToolResult, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }

        let key = key.to_string();
        let now = Instant::now();
        let size_bytes = result.estimated_size(&key);
        let mut state = self.state.lock();

        if state.remove(&key).is_none() {
            while state.data.len() >= self.max_keys {
                match state.evict_lru() {
                    Some(evicted) => debug!(cache = %self.name, key = %evicted, "evicted least recently used entry"),
                    None => break,
                }
            }
        }

        let tick = state.tick();
        state.total_size += size_bytes;
        state.order.insert(tick, key.clone());
        state.data.insert(
            key,
            Entry {
                cached: CachedResult {
                    result,
                    cached_at: now,
                    ttl,
                    last_access: now,
                    access_count: 0,
                    size_bytes,
                },
                tick,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.state.lock().remove(&key.to_string()).is_some())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.data.clear();
        state.order.clear();
        state.total_size = 0;
        Ok(())
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        let state = self.state.lock();
        Ok(state
            .data
            .get(&key.to_string())
            .is_some_and(|entry| !entry.cached.is_expired()))
    }

    async fn stats(&self) -> Result<CacheStats> {
        let state = self.state.lock();
        Ok(CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            total_keys: state.data.len(),
            total_size_bytes: state.total_size,
            hit_rate: CacheStats::compute_hit_rate(state.hits, state.misses),
            last_cleanup: state.last_cleanup,
        })
    }

    async fn cleanup(&self) -> Result<usize> {
        Ok(self.state.lock().sweep(Instant::now()))
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }
}
