//! Traits for the collaborators toolmesh consumes but never implements.

use crate::error::Result;
use crate::tool::{ToolExecution, ToolResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A raw connection to one MCP server.
///
/// Only liveness is needed by the pool. The protocol exchange itself is driven
/// by whoever holds the handle.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Cheap round trip used by health checks.
    async fn ping(&self) -> Result<()>;

    /// Releases the underlying transport. Called at most once by the pool.
    async fn close(&self) -> Result<()>;
}

/// Opens raw connections to servers by id.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(&self, server_id: &str) -> Result<Arc<dyn Connection>>;
}

/// Performs the actual remote tool call.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute_tool(
        &self,
        cancel: &CancellationToken,
        execution: &ToolExecution,
    ) -> Result<ToolResult>;
}
