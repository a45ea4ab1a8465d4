//! Error types for rq-tracing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed trace context in job metadata: {0}")]
    MalformedContext(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("span flush failed: {0}")]
    Flush(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
