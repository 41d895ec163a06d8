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

//! # Toolmesh CLI
//!
//! Command-line driver for the toolmesh resilience layer.
//!
//! - **simulate**: runs an in-process orchestrator over simulated MCP servers
//!   with a configurable failure rate and prints the resulting statistics
//! - **config**: prints the default configuration of every component
//!
//! Both commands write JSON to stdout so the output can be piped to `jq`.

pub mod sim;

use serde::Serialize;

/// Serializes `value` as JSON, pretty-printed unless `compact` is set.
pub fn to_json<T: Serialize>(value: &T, compact: bool) -> serde_json::Result<String> {
    if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    }
}
