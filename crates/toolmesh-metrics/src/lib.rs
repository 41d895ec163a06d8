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

//! Toolmesh Metrics Collection
//!
//! Thread-safe counters for tool executions routed through the orchestrator:
//! success and failure counts, latency percentiles per tool, request counts
//! per endpoint, and calls refused by an open circuit breaker.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: lock-free counters plus per-tool and per-endpoint entries
//! - [`MetricsSnapshot`]: serializable point-in-time view of the registry
//!
//! # Usage Example
//!
//! ```rust
//! use std::time::Duration;
//! use toolmesh_metrics::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new();
//! registry.record_execution("search", Some("search-1"), Duration::from_millis(40), true);
//!
//! let snapshot = registry.snapshot();
//! println!("p99 for search: {}us", snapshot.tools["search"].p99_latency_us);
//! ```

pub mod registry;
pub mod snapshot;

pub use registry::{MetricsConfig, MetricsRegistry};
pub use snapshot::{EndpointMetrics, MetricsSnapshot, ToolMetrics};
