//! Error types for feedflow

use thiserror::Error;

use crate::FeedId;

/// Core feedflow errors
///
/// Errors travel inside messages (the `ERROR` axis) and across task
/// boundaries, so the type is cheap to clone and comparable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    // Operation manager contract errors
    #[error("Operations manager already completed")]
    OperationsCompleted,

    #[error("Operations manager faulted or disposed")]
    OperationsDisposed,

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    // Cancellation
    #[error("Cancelled")]
    Cancelled,

    // Feed errors
    #[error("Feed {0} completed without producing a value")]
    SourceCompleted(FeedId),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("Dependency type mismatch for feed {0}")]
    DependencyTypeMismatch(FeedId),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Logging initialization failed: {0}")]
    Logging(String),
}

impl FeedError {
    /// Whether this error is a cancellation rather than a failure
    #[inline]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FeedError::Cancelled)
    }

    /// Wrap any displayable failure from user code
    pub fn execution<E: std::fmt::Display>(err: E) -> Self {
        FeedError::ExecutionFailed(err.to_string())
    }

    /// Wrap any displayable failure from an operation
    pub fn operation<E: std::fmt::Display>(err: E) -> Self {
        FeedError::OperationFailed(err.to_string())
    }
}

/// Result type for feedflow operations
pub type FeedResult<T> = Result<T, FeedError>;
