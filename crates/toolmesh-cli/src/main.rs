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

//! # Toolmesh CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Simulate 500 calls against 4 servers that fail 20% of the time
//! toolmesh simulate --endpoints 4 --calls 500 --failure-rate 0.2
//!
//! # Same, routing by health score and without the result cache
//! toolmesh simulate --strategy health_based --no-cache
//!
//! # Print the default configuration
//! toolmesh config
//! ```
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`).

use anyhow::{Context, Result};
use argh::FromArgs;
use std::time::Duration;
use toolmesh_cli::sim::{self, SimulationConfig};
use toolmesh_cli::to_json;
use toolmesh_orchestrator::{LoadBalancingStrategy, OrchestratorConfig};

#[derive(FromArgs)]
/// Toolmesh - resilient tool calls across redundant MCP servers
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Simulate(SimulateArgs),
    Config(ConfigArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "simulate")]
/// run calls against simulated servers and print the resulting stats
struct SimulateArgs {
    /// number of simulated servers
    #[argh(option, short = 'e', default = "3")]
    endpoints: usize,

    /// number of tool calls to issue
    #[argh(option, short = 'n', default = "100")]
    calls: usize,

    /// maximum calls in flight at once
    #[argh(option, short = 'c', default = "8")]
    concurrency: usize,

    /// probability in [0, 1] that a single invocation fails
    #[argh(option, long = "failure-rate", default = "0.1")]
    failure_rate: f64,

    /// simulated latency of every invocation in milliseconds
    #[argh(option, long = "latency-ms", default = "20")]
    latency_ms: u64,

    /// distinct queries per tool; fewer means more cache hits
    #[argh(option, long = "queries", default = "10")]
    distinct_queries: usize,

    /// load balancing strategy (round_robin, least_connections,
    /// weighted_round_robin, random, health_based, response_time_based)
    #[argh(option, short = 's', default = "LoadBalancingStrategy::RoundRobin")]
    strategy: LoadBalancingStrategy,

    /// disable the result cache
    #[argh(switch, long = "no-cache")]
    no_cache: bool,

    /// print single-line JSON
    #[argh(switch)]
    compact: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "config")]
/// print the default configuration of every component
struct ConfigArgs {
    /// print single-line JSON
    #[argh(switch)]
    compact: bool,
}

impl SimulateArgs {
    fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            endpoints: self.endpoints,
            calls: self.calls,
            concurrency: self.concurrency,
            failure_rate: self.failure_rate,
            latency: Duration::from_millis(self.latency_ms),
            distinct_queries: self.distinct_queries,
            strategy: self.strategy,
            cache: !self.no_cache,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate(args) => {
            let report = sim::run(&args.simulation_config())
                .await
                .context("simulation failed")?;
            println!("{}", to_json(&report, args.compact)?);
        }
        Commands::Config(args) => {
            println!("{}", to_json(&OrchestratorConfig::default(), args.compact)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_simulate_defaults() {
        let cli = Cli::from_args(&["toolmesh"], &["simulate"]).unwrap();
        match cli.command {
            Commands::Simulate(args) => {
                let config = args.simulation_config();
                assert_eq!(config.endpoints, 3);
                assert_eq!(config.calls, 100);
                assert_eq!(config.concurrency, 8);
                assert_eq!(config.latency, Duration::from_millis(20));
                assert_eq!(config.strategy, LoadBalancingStrategy::RoundRobin);
                assert!(config.cache);
                assert!(!args.compact);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_cli_parse_simulate_options() {
        let cli = Cli::from_args(
            &["toolmesh"],
            &[
                "simulate",
                "-e", "5",
                "--calls", "40",
                "--failure-rate", "0.25",
                "--strategy", "least-connections",
                "--no-cache",
                "--compact",
            ],
        )
        .unwrap();
        match cli.command {
            Commands::Simulate(args) => {
                let config = args.simulation_config();
                assert_eq!(config.endpoints, 5);
                assert_eq!(config.calls, 40);
                assert_eq!(config.failure_rate, 0.25);
                assert_eq!(config.strategy, LoadBalancingStrategy::LeastConnections);
                assert!(!config.cache);
                assert!(args.compact);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_strategy() {
        let result = Cli::from_args(&["toolmesh"], &["simulate", "--strategy", "fastest"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parse_config() {
        let cli = Cli::from_args(&["toolmesh"], &["config", "--compact"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigArgs { compact: true })));
    }
}
