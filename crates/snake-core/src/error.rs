//! Error types for snake-runner.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("service request failed: {0}")]
    Service(String),

    #[error("container provider error: {0}")]
    Cloud(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("pipeline config error: {0}")]
    Config(String),

    #[error("key generation failed: {0}")]
    KeyGen(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error was caused by cooperative cancellation rather
    /// than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
