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

use crate::snapshot::{EndpointMetrics, MetricsSnapshot, ToolMetrics};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decades covered by the histogram: 1us up to 100s.
const HISTOGRAM_DECADES: usize = 8;
/// Each decade is split by its leading digit.
const BINS_PER_DECADE: usize = 10;
const NUM_HISTOGRAM_BINS: usize = HISTOGRAM_DECADES * BINS_PER_DECADE;

/// Entries are swept for staleness once every this many recordings.
const CLEANUP_EVERY: u64 = 1000;

/// Limits that keep the registry from growing without bound.
///
/// Tools and endpoints that have not been recorded for longer than their TTL
/// are dropped, and the least recently recorded ones are evicted once the
/// maximum is exceeded. Global counters are never affected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub max_tools: usize,
    pub max_endpoints: usize,
    pub tool_ttl: Duration,
    pub endpoint_ttl: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_tools: 1000,
            max_endpoints: 100,
            tool_ttl: Duration::from_secs(3600),
            endpoint_ttl: Duration::from_secs(3600),
        }
    }
}

/// Log-linear latency histogram.
///
/// A sample of `v` microseconds lands in the bin of its decade and leading
/// digit, so bin `d * 10 + l` covers `[l * 10^d, (l + 1) * 10^d)`. Relative
/// error is therefore bounded by one leading digit. Recording is a single
/// atomic increment; percentiles interpolate linearly inside the bin.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        self.bins[Self::bin_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn bin_index(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }
        let decade = latency_us.ilog10() as usize;
        if decade >= HISTOGRAM_DECADES {
            return NUM_HISTOGRAM_BINS - 1;
        }
        let leading = (latency_us / 10u64.pow(decade as u32)) as usize;
        decade * BINS_PER_DECADE + leading
    }

    /// Lower and upper bound of a bin, in microseconds.
    fn bin_bounds(index: usize) -> (u64, u64) {
        let decade = (index / BINS_PER_DECADE) as u32;
        let leading = (index % BINS_PER_DECADE) as u64;
        let scale = 10u64.pow(decade);
        (leading * scale, (leading + 1) * scale)
    }

    fn percentile(&self, percentile: u64) -> u64 {
        let total = self.samples.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile).div_ceil(100)).max(1);
        let mut cumulative = 0;
        for (index, bin) in self.bins.iter().enumerate() {
            let count = bin.load(Ordering::Relaxed);
            if count > 0 && cumulative + count >= target {
                let (lower, upper) = Self::bin_bounds(index);
                let fraction = (target - cumulative) as f64 / count as f64;
                return lower + (fraction * (upper - lower) as f64) as u64;
            }
            cumulative += count;
        }

        Self::bin_bounds(NUM_HISTOGRAM_BINS - 1).1
    }

    /// Returns `(avg, p50, p95, p99)` in microseconds.
    fn summary(&self) -> (u64, u64, u64, u64) {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return (0, 0, 0, 0);
        }
        let avg = self.total_us.load(Ordering::Relaxed) / samples;
        (avg, self.percentile(50), self.percentile(95), self.percentile(99))
    }
}

#[derive(Debug)]
struct ToolStats {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    latencies: LatencyHistogram,
    last_recorded_ms: AtomicU64,
    /// Strictly increasing across the registry; orders LRU eviction.
    last_sequence: AtomicU64,
}

impl ToolStats {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
            last_recorded_ms: AtomicU64::new(0),
            last_sequence: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> ToolMetrics {
        let (avg_latency_us, p50_latency_us, p95_latency_us, p99_latency_us) = self.latencies.summary();
        ToolMetrics {
            call_count: self.calls.load(Ordering::Relaxed),
            success_count: self.successes.load(Ordering::Relaxed),
            failure_count: self.failures.load(Ordering::Relaxed),
            avg_latency_us,
            p50_latency_us,
            p95_latency_us,
            p99_latency_us,
        }
    }
}

#[derive(Debug)]
struct EndpointStats {
    requests: AtomicU64,
    failures: AtomicU64,
    last_recorded_ms: AtomicU64,
    last_sequence: AtomicU64,
}

impl EndpointStats {
    fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_recorded_ms: AtomicU64::new(0),
            last_sequence: AtomicU64::new(0),
        }
    }

    fn snapshot(&self, endpoint_id: &str) -> EndpointMetrics {
        EndpointMetrics {
            endpoint_id: endpoint_id.to_string(),
            request_count: self.requests.load(Ordering::Relaxed),
            failure_count: self.failures.load(Ordering::Relaxed),
            last_request_ms: self.last_recorded_ms.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe store for tool execution metrics.
///
/// # Concurrency Model
///
/// - Global counters are plain `AtomicU64`s updated with relaxed ordering
/// - Per-tool and per-endpoint entries are `Arc`s looked up under a `RwLock`;
///   the lock is released before any counter is touched
/// - Snapshots are eventually consistent: counters read at slightly different
///   moments may disagree by an in-flight call
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use toolmesh_metrics::MetricsRegistry;
///
/// let registry = MetricsRegistry::new();
/// registry.record_execution("search", Some("search-1"), Duration::from_millis(12), true);
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.total_executions, 1);
/// assert_eq!(snapshot.tools["search"].success_count, 1);
/// ```
#[derive(Debug)]
pub struct MetricsRegistry {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    circuit_rejections: AtomicU64,
    tools: RwLock<HashMap<String, Arc<ToolStats>>>,
    endpoints: RwLock<HashMap<String, Arc<EndpointStats>>>,
    sequence: AtomicU64,
    started_at: Instant,
    config: MetricsConfig,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_config(MetricsConfig::default())
    }

    pub fn with_config(config: MetricsConfig) -> Self {
        Self {
            total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
            tools: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            started_at: Instant::now(),
            config,
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Records one finished tool execution.
    ///
    /// `endpoint` is the endpoint that served the call, if one was selected.
    /// Stale entries are swept every thousandth recording.
    pub fn record_execution(&self, tool: &str, endpoint: Option<&str>, latency: Duration, success: bool) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        if sequence % CLEANUP_EVERY == 0 {
            self.cleanup();
        }
        let now_ms = self.uptime_ms();

        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }

        let stats = Self::entry(&self.tools, tool, ToolStats::new);
        stats.calls.fetch_add(1, Ordering::Relaxed);
        if success {
            stats.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        stats
            .latencies
            .record(u64::try_from(latency.as_micros()).unwrap_or(u64::MAX));
        stats.last_recorded_ms.store(now_ms, Ordering::Relaxed);
        stats.last_sequence.store(sequence, Ordering::Relaxed);

        if let Some(endpoint) = endpoint {
            let stats = Self::entry(&self.endpoints, endpoint, EndpointStats::new);
            stats.requests.fetch_add(1, Ordering::Relaxed);
            if !success {
                stats.failures.fetch_add(1, Ordering::Relaxed);
            }
            stats.last_recorded_ms.store(now_ms, Ordering::Relaxed);
            stats.last_sequence.store(sequence, Ordering::Relaxed);
        }
    }

    /// Counts a call refused by an open circuit breaker.
    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    fn entry<T>(map: &RwLock<HashMap<String, Arc<T>>>, key: &str, create: fn() -> T) -> Arc<T> {
        if let Some(stats) = map.read().get(key) {
            return Arc::clone(stats);
        }
        Arc::clone(
            map.write()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(create())),
        )
    }

    /// Drops entries past their TTL, then evicts the least recently recorded
    /// entries above the configured maximum.
    pub fn cleanup(&self) {
        let now_ms = self.uptime_ms();
        prune(
            &mut self.tools.write(),
            now_ms,
            &self.config.tool_ttl,
            self.config.max_tools,
            |s| (s.last_recorded_ms.load(Ordering::Relaxed), s.last_sequence.load(Ordering::Relaxed)),
        );
        prune(
            &mut self.endpoints.write(),
            now_ms,
            &self.config.endpoint_ttl,
            self.config.max_endpoints,
            |s| (s.last_recorded_ms.load(Ordering::Relaxed), s.last_sequence.load(Ordering::Relaxed)),
        );
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let tools = self
            .tools
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();
        let endpoints = self
            .endpoints
            .read()
            .iter()
            .map(|(id, stats)| (id.clone(), stats.snapshot(id)))
            .collect();

        MetricsSnapshot {
            total_executions: self.total.load(Ordering::Relaxed),
            successful_executions: self.successes.load(Ordering::Relaxed),
            failed_executions: self.failures.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            tools,
            endpoints,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn prune<T>(
    entries: &mut HashMap<String, Arc<T>>,
    now_ms: u64,
    ttl: &Duration,
    max: usize,
    recency: impl Fn(&T) -> (u64, u64),
) {
    let ttl_ms = ttl.as_millis() as u64;
    entries.retain(|_, stats| now_ms.saturating_sub(recency(stats).0) < ttl_ms);

    if entries.len() > max {
        let mut by_age: Vec<(String, u64)> = entries
            .iter()
            .map(|(key, stats)| (key.clone(), recency(stats).1))
            .collect();
        by_age.sort_by_key(|&(_, sequence)| sequence);

        let excess = by_age.len() - max;
        for (key, _) in by_age.into_iter().take(excess) {
            entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_execution_counters() {
        let registry = MetricsRegistry::new();

        registry.record_execution("search", Some("ep-1"), ms(10), true);
        registry.record_execution("search", Some("ep-2"), ms(20), true);
        registry.record_execution("search", Some("ep-1"), ms(30), false);
        registry.record_execution("fetch", None, ms(5), true);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_executions, 4);
        assert_eq!(snapshot.successful_executions, 3);
        assert_eq!(snapshot.failed_executions, 1);

        let search = &snapshot.tools["search"];
        assert_eq!(search.call_count, 3);
        assert_eq!(search.failure_count, 1);
        assert_eq!(search.avg_latency_us, 20_000);
        assert!((search.success_rate() - 2.0 / 3.0).abs() < 1e-9);

        assert_eq!(snapshot.endpoints.len(), 2);
        assert_eq!(snapshot.endpoints["ep-1"].request_count, 2);
        assert_eq!(snapshot.endpoints["ep-1"].failure_count, 1);
        assert_eq!(snapshot.endpoints["ep-2"].endpoint_id, "ep-2");
    }

    #[test]
    fn test_circuit_rejections_are_counted_separately() {
        let registry = MetricsRegistry::new();
        registry.record_circuit_rejection();
        registry.record_circuit_rejection();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.circuit_rejections, 2);
        assert_eq!(snapshot.total_executions, 0);
    }

    #[test]
    fn test_percentiles() {
        let registry = MetricsRegistry::new();
        for us in 0..1000 {
            registry.record_execution("scan", None, Duration::from_micros(us), true);
        }

        let scan = &registry.snapshot().tools["scan"];
        assert_eq!(scan.p50_latency_us, 500);
        assert_eq!(scan.p95_latency_us, 950);
        assert_eq!(scan.p99_latency_us, 990);
        assert_eq!(scan.avg_latency_us, 499);
    }

    #[test]
    fn test_histogram_bins() {
        assert_eq!(LatencyHistogram::bin_index(0), 0);
        assert_eq!(LatencyHistogram::bin_index(7), 7);
        assert_eq!(LatencyHistogram::bin_index(10), 11);
        assert_eq!(LatencyHistogram::bin_index(999), 29);
        assert_eq!(LatencyHistogram::bin_index(u64::MAX), NUM_HISTOGRAM_BINS - 1);
        assert_eq!(LatencyHistogram::bin_bounds(29), (900, 1000));
    }

    #[test]
    fn test_empty_histogram() {
        let histogram = LatencyHistogram::new();
        assert_eq!(histogram.summary(), (0, 0, 0, 0));
    }

    #[test]
    fn test_max_tools_evicts_least_recent() {
        let registry = MetricsRegistry::with_config(MetricsConfig {
            max_tools: 2,
            ..Default::default()
        });

        registry.record_execution("a", None, ms(1), true);
        registry.record_execution("b", None, ms(1), true);
        registry.record_execution("c", None, ms(1), true);
        registry.record_execution("a", None, ms(1), true);
        registry.cleanup();

        let tools = registry.snapshot().tools;
        assert_eq!(tools.len(), 2);
        assert!(tools.contains_key("a"));
        assert!(tools.contains_key("c"));
        assert_eq!(registry.snapshot().total_executions, 4);
    }

    #[test]
    fn test_ttl_cleanup() {
        let registry = MetricsRegistry::with_config(MetricsConfig {
            tool_ttl: ms(20),
            endpoint_ttl: ms(20),
            ..Default::default()
        });

        registry.record_execution("old", Some("ep-old"), ms(1), true);
        thread::sleep(ms(40));
        registry.record_execution("new", Some("ep-new"), ms(1), true);
        registry.cleanup();

        let snapshot = registry.snapshot();
        assert!(!snapshot.tools.contains_key("old"));
        assert!(snapshot.tools.contains_key("new"));
        assert!(!snapshot.endpoints.contains_key("ep-old"));
        assert_eq!(snapshot.total_executions, 2);
    }

    #[test]
    fn test_concurrent_recording() {
        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..250 {
                        registry.record_execution("shared", Some(&format!("ep-{}", i % 2)), ms(1), true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_executions, 2000);
        assert_eq!(snapshot.tools["shared"].call_count, 2000);
        assert_eq!(snapshot.endpoints["ep-0"].request_count, 1000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let registry = MetricsRegistry::new();
        registry.record_execution("search", Some("ep-1"), ms(3), true);

        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(json["tools"]["search"]["call_count"], 1);
        assert_eq!(json["endpoints"]["ep-1"]["request_count"], 1);
    }
}
