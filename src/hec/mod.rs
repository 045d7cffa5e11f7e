// Splunk HEC delivery: single-target client and multi-target fan-out.

pub mod client;
pub mod multi;

pub use client::HecClient;
pub use multi::HecForwarder;

use thiserror::Error;

/// Errors from the HEC delivery path.
#[derive(Debug, Error)]
pub enum HecError {
    #[error("circuit breaker open for target '{0}'")]
    CircuitOpen(String),
    #[error("target '{target}' returned status {status}")]
    Status {
        target: String,
        status: reqwest::StatusCode,
    },
    #[error("target '{target}' request failed: {source}")]
    Request {
        target: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("building HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("gzip compression failed: {0}")]
    Gzip(#[source] std::io::Error),
    #[error("target '{0}': invalid HEC token")]
    InvalidToken(String),
    #[error("target '{target}' unhealthy: {status_line}")]
    Unhealthy { target: String, status_line: String },
    #[error("target '{0}': shutdown deadline exceeded")]
    ShutdownTimeout(String),
    #[error("forwarder is shutting down")]
    ShuttingDown,
    #[error("broadcast failed for targets [{0}]")]
    Broadcast(String),
    #[error("all targets failed: {0}")]
    AllTargetsFailed(String),
}
