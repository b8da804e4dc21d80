//! Error types shared by the build farm crates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("source control: {0}")]
    SourceControl(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("notification failed: {0}")]
    Notification(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
