//! Errors - エラー型と分類
//!
//! - `HandlerError`: ハンドラが返すビジネスエラー（retryable / fatal）
//! - `StoreError`: ブローカー側の障害（Unavailable はループ内で再試行）
//! - `WorkerError`: コントローラが呼び出し元に返す致命的エラー

use std::fmt;

use thiserror::Error;

use super::envelope::EncodeError;

/// Error value a handler returns to signal a business failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Try again later.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Retrying cannot help; dead-letter the task.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        HandlerError::Retryable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        HandlerError::Fatal(reason.into())
    }
}

/// Failures of the queue store boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Broker connectivity problem. Transient: callers retry within a budget.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid queue name '{0}': must be non-empty and contain no ':' or whitespace")]
    InvalidQueueName(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Broker answered, but with something we cannot use.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Why a single poll loop stopped abnormally.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("poll loop panicked: {0}")]
    Panicked(String),
}

/// One failed queue inside a [`WorkerError::Fatal`].
#[derive(Debug)]
pub struct QueueFailure {
    pub queue: String,
    pub error: LoopError,
}

impl fmt::Display for QueueFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.queue, self.error)
    }
}

/// Errors surfaced by the lifecycle controller.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Build(#[from] crate::app::BuildError),

    #[error("startup recovery failed for queue '{queue}': {source}")]
    Startup {
        queue: String,
        #[source]
        source: StoreError,
    },

    /// One or more loops hit an unrecoverable error; every loop was stopped.
    #[error("worker stopped after fatal errors: {}", join_failures(.0))]
    Fatal(Vec<QueueFailure>),
}

fn join_failures(failures: &[QueueFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
