//! Error types for coordinator operations.
//!
//! [`Error`] is what callers of the coordinator see. Lower layers have their
//! own error enums ([`CacheError`], [`LockError`], [`BrokerError`],
//! [`ConfigError`]) which convert into it.
//!
//! Errors inside the shared ingestion pipeline (decode failures, handler
//! failures) never surface here: they are logged or converted into a
//! `FAILED` response instead.

use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerError;
use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::lock::LockError;
use crate::types::TaskId;

/// Errors returned by [`TaskCoordinator`](crate::TaskCoordinator) operations.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskrelay::{Error, TaskId};
///
/// let task_id = TaskId::new();
/// let err = Error::Timeout { task_id, timeout: Duration::from_secs(1) };
/// assert!(err.to_string().contains(&task_id.to_string()));
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// The request is missing a required field.
    #[error("invalid task request: {0}")]
    InvalidRequest(String),

    /// The caller stopped waiting. The task itself keeps running.
    #[error("timed out after {timeout:?} waiting for task {task_id}")]
    Timeout {
        /// The task that was being waited on.
        task_id: TaskId,
        /// How long the caller waited.
        timeout: Duration,
    },

    /// The task reached the `CANCELLED` terminal state.
    #[error("task {task_id} was cancelled")]
    Cancelled {
        /// The cancelled task.
        task_id: TaskId,
    },

    /// The task reached the `FAILED` terminal state.
    #[error("task {task_id} failed: {message}")]
    Failed {
        /// The failed task.
        task_id: TaskId,
        /// The worker or handler output, decoded as text.
        message: String,
    },

    /// The local completion promise was dropped before a result arrived.
    #[error("completion channel closed for task {task_id}")]
    Closed {
        /// The task whose promise was dropped.
        task_id: TaskId,
    },

    /// Shared result cache failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Distributed lock failure.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Message broker failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Invalid coordinator configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A message could not be encoded.
    #[error("failed to encode message: {0}")]
    Codec(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` for infrastructure failures where retrying the same
    /// call may succeed.
    ///
    /// Task outcomes (`Cancelled`, `Failed`), timeouts and invalid input
    /// are not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Cache(_) | Self::Lock(_) | Self::Broker(_))
    }
}

/// Result type alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
