use std::time::Duration;

use thiserror::Error;

/// Errors raised while configuring or running the inflight metrics stage.
#[derive(Debug, Error)]
pub enum InflightError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Settings(#[from] config::ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type InflightResult<T> = Result<T, InflightError>;

/// Failure of a single sink write. Logged by the dispatcher, never propagated
/// into the record path.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("collector address {0} did not resolve")]
    Resolve(String),
    #[error("write to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
