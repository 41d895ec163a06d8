use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolmeshError {
    #[error("failed to connect to server {server_id}: {reason}")]
    ConnectionCreation { server_id: String, reason: String },

    #[error("timed out after {0}ms waiting for a connection")]
    ConnectionTimeout(u64),

    #[error("maximum connections ({max}) reached for server {server_id}")]
    PoolExhausted { server_id: String, max: usize },

    #[error("connection {0} is not connected")]
    ConnectionClosed(String),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("no endpoints available for tool {0}")]
    NoEndpointsForTool(String),

    #[error("no healthy endpoints available for tool {0}")]
    EndpointUnavailable(String),

    #[error("endpoint {0} not found")]
    EndpointNotFound(String),

    #[error("retry policy exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ToolmeshError>,
    },

    #[error("circuit breaker blocking request: {0}")]
    CircuitOpen(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded after {0}ms")]
    DeadlineExceeded(u64),

    #[error("health probe failed: {0}")]
    Probe(String),

    #[error("tool execution failed: {0}")]
    Execution(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl ToolmeshError {
    /// Returns the innermost error, unwrapping any `RetriesExhausted` layers.
    ///
    /// Retry exhaustion wraps the last error that was observed, so this is the
    /// way to test what actually went wrong underneath the retry layer.
    pub fn root_cause(&self) -> &ToolmeshError {
        let mut current = self;
        while let ToolmeshError::RetriesExhausted { source, .. } = current {
            current = source;
        }
        current
    }

    /// True for cancellation and deadline errors, which are never retried.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self.root_cause(),
            ToolmeshError::Cancelled | ToolmeshError::DeadlineExceeded(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ToolmeshError>;
