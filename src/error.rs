use std::path::PathBuf;
use thiserror::Error;

use crate::engine::task::TaskId;

/// Errors raised by the task registry, the execution engine and session storage
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("task {0} does not exist")]
    TaskNotFound(TaskId),

    /// A run was requested while the previous one is still in flight
    #[error("task {0} is already running")]
    AlreadyRunning(TaskId),

    /// url/selector/method cannot change while the task is running
    #[error("task {0} is running; url, selector and method are locked")]
    LockedTask(TaskId),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("invalid request parameters: {0}")]
    ConfigParse(String),

    #[error("invalid session name: {0:?}")]
    InvalidSessionName(String),

    #[error("malformed file {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ScrapeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn serialization(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serialization { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, ScrapeError>;

/// Failure of a single executor call. Always contained at the task boundary.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0}s")]
    Timeout(u32),

    #[error("server answered with HTTP {0}")]
    HttpStatus(u16),

    #[error("invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("invalid proxy {0:?}")]
    Proxy(String),

    #[error("{0}")]
    Other(String),
}
