use serde::{Deserialize, Serialize};
use std::fmt;
use toolmesh_common::ToolmeshError;

const NETWORK_KEYWORDS: &[&str] = &[
    "connection refused",
    "connection reset",
    "network unreachable",
    "no route to host",
    "connection timeout",
    "dial tcp",
    "i/o timeout",
];

const TIMEOUT_KEYWORDS: &[&str] = &["timeout", "timed out", "deadline exceeded"];

const THROTTLE_KEYWORDS: &[&str] = &[
    "rate limit",
    "throttled",
    "too many requests",
    "quota exceeded",
    "rate exceeded",
];

/// How an error should be treated by the retry layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClassification {
    Retryable,
    NonRetryable,
    Throttled,
    Network,
    Timeout,
}

impl RetryClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryClassification::Retryable => "retryable",
            RetryClassification::NonRetryable => "non_retryable",
            RetryClassification::Throttled => "throttled",
            RetryClassification::Network => "network",
            RetryClassification::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RetryClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies an error for retry purposes.
///
/// Cancellation is checked first and is always `NonRetryable`, as are errors
/// no retry can fix (bad configuration, an open circuit, a closed pool, a tool
/// no endpoint offers). After that the message is matched case-insensitively
/// against network, timeout and throttling phrases, in that order. Network
/// phrases win over timeout phrases so that "connection timeout" and
/// "i/o timeout" count as network failures.
/// Anything unrecognised is `Retryable`.
pub fn classify_error(err: &ToolmeshError) -> RetryClassification {
    if err.is_cancellation() {
        return RetryClassification::NonRetryable;
    }

    match err.root_cause() {
        ToolmeshError::InvalidConfig(_)
        | ToolmeshError::CircuitOpen(_)
        | ToolmeshError::PoolClosed
        | ToolmeshError::NoEndpointsForTool(_)
        | ToolmeshError::EndpointNotFound(_) => {
            return RetryClassification::NonRetryable;
        }
        ToolmeshError::ConnectionTimeout(_) => return RetryClassification::Timeout,
        _ => {}
    }

    let message = err.to_string().to_lowercase();
    let contains_any = |keywords: &[&str]| keywords.iter().any(|k| message.contains(k));

    if contains_any(NETWORK_KEYWORDS) {
        RetryClassification::Network
    } else if contains_any(TIMEOUT_KEYWORDS) {
        RetryClassification::Timeout
    } else if contains_any(THROTTLE_KEYWORDS) {
        RetryClassification::Throttled
    } else {
        RetryClassification::Retryable
    }
}
