//! Result caching for toolmesh tool calls.
//!
//! Successful tool results are stored under a [`CacheKey`] built from the
//! server name, the tool name and a digest of the normalized arguments.
//! Entries expire after a per-tool TTL and the least recently used entry is
//! evicted when a cache is full.
//!
//! - [`ResultCache`]: the store interface, with [`MemoryCache`] and [`NoOpCache`]
//! - [`CacheManager`]: wraps a [`ToolExecutor`](toolmesh_common::ToolExecutor)
//!   with one cache per `server:tool` pair
//! - [`CacheConfig`]: enable flag, TTLs, capacity and sweep interval

mod config;
mod key;
mod manager;
mod memory;
mod store;

pub use config::CacheConfig;
pub use key::{hash_arguments, normalize_arguments, CacheKey};
pub use manager::{CacheManager, GlobalCacheStats};
pub use memory::MemoryCache;
pub use store::{CacheStats, CachedResult, NoOpCache, ResultCache};
