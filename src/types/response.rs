//! Task response and status types.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::request::{TaskEnvelope, TaskId};

/// Task lifecycle status.
///
/// `QUEUED`, `RUNNING` and `CANCELLING` are transient and may be replaced by
/// any later message for the same task. `SUCCESS`, `FAILED` and `CANCELLED`
/// are terminal: once reached, the status does not change again.
///
/// ```text
/// QUEUED -> RUNNING -> SUCCESS | FAILED
///      \        \
///       `--------`--> CANCELLING -> CANCELLED
/// ```
///
/// # Examples
///
/// ```
/// use taskrelay::TaskStatus;
///
/// assert!(TaskStatus::Success.is_terminal());
/// assert!(!TaskStatus::Cancelling.is_terminal());
/// assert!(TaskStatus::Cancelling.requires_redispatch());
/// assert_eq!(serde_json::to_string(&TaskStatus::Queued).unwrap(), "\"QUEUED\"");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Published to the request queue, not yet picked up.
    Queued,
    /// A worker is executing the task.
    Running,
    /// A cancellation was requested and the worker is winding down.
    Cancelling,
    /// The task was cancelled (terminal).
    Cancelled,
    /// The task completed successfully (terminal).
    Success,
    /// The task failed (terminal).
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Cancelling => write!(f, "CANCELLING"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl TaskStatus {
    /// Returns `true` for `SUCCESS`, `FAILED` and `CANCELLED`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` when a cached task in this state must not absorb a
    /// duplicate submission: the duplicate is dispatched again under a new id.
    pub fn requires_redispatch(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Cancelling)
    }
}

/// A status update for a task, produced by a worker (or by the coordinator
/// for the initial `QUEUED` state).
///
/// # Examples
///
/// ```
/// use taskrelay::{TaskEnvelope, TaskRequest, TaskResponse, TaskStatus};
///
/// let envelope = TaskEnvelope::new(TaskRequest::new("GOLLM", "model_card"));
/// let queued = TaskResponse::queued(&envelope);
/// assert_eq!(queued.status, TaskStatus::Queued);
///
/// let failed = queued.into_failed("worker exploded");
/// assert_eq!(failed.status, TaskStatus::Failed);
/// assert_eq!(failed.output_text(), "worker exploded");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    /// Id of the originating request.
    pub id: TaskId,

    /// Current status.
    pub status: TaskStatus,

    /// Script of the originating request.
    pub script: String,

    /// Opaque output payload.
    #[serde(with = "super::base64_bytes", default)]
    pub output: Bytes,

    /// Metadata echoed back from the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<Value>,

    /// Identity of the caller on whose behalf the task runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

impl TaskResponse {
    /// The `QUEUED` response written to the cache when a request is published.
    pub fn queued(envelope: &TaskEnvelope) -> Self {
        Self {
            id: envelope.id,
            status: TaskStatus::Queued,
            script: envelope.request.script.clone(),
            output: Bytes::new(),
            additional_properties: envelope.request.additional_properties.clone(),
            owner_id: envelope.request.owner_id.clone(),
        }
    }

    /// Returns a copy with a different status, keeping everything else.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns a copy with a different output payload.
    pub fn with_output(mut self, output: impl Into<Bytes>) -> Self {
        self.output = output.into();
        self
    }

    /// Converts this response into a `FAILED` one carrying `message` as
    /// output.
    pub fn into_failed(self, message: impl Into<String>) -> Self {
        let message: String = message.into();
        self.with_status(TaskStatus::Failed)
            .with_output(Bytes::from(message))
    }

    /// The output decoded as UTF-8, with invalid sequences replaced.
    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}
