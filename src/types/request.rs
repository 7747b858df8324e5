//! Task request types.
//!
//! Callers build a [`TaskRequest`]. The coordinator validates it, assigns a
//! [`TaskId`] and publishes it to workers wrapped in a [`TaskEnvelope`].
//! A `TaskRequest` has no id field at all, so a caller cannot pick or guess
//! the id of an in-flight task.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;

/// Identifier of a dispatched task. Generated by the coordinator, never reused.
///
/// # Examples
///
/// ```
/// use taskrelay::TaskId;
///
/// let id = TaskId::new();
/// let parsed: TaskId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random (`UUIDv4`) task id.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A unit of work to run on a task-runner worker.
///
/// `task_type` selects the worker pool (and thus the request queue);
/// `script` names the logical operation inside that pool. Both are required.
/// `additional_properties` is opaque metadata that workers echo back
/// verbatim on every response.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskrelay::TaskRequest;
/// use serde_json::json;
///
/// let request = TaskRequest::new("GOLLM", "model_card")
///     .with_input(&b"{\"document\": 42}"[..])
///     .with_timeout(Duration::from_secs(120))
///     .with_additional_properties(json!({"projectId": "p-1"}));
///
/// assert!(request.validate().is_ok());
/// let json = serde_json::to_value(&request).unwrap();
/// assert_eq!(json["type"], "GOLLM");
/// assert_eq!(json["timeoutMs"], 120_000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Worker pool category (e.g. `GOLLM`).
    #[serde(rename = "type")]
    pub task_type: String,

    /// Logical operation name (e.g. `model_card`).
    pub script: String,

    /// Opaque input payload.
    #[serde(with = "super::base64_bytes", default)]
    pub input: Bytes,

    /// Worker-side execution timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Opaque metadata echoed back on every response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<Value>,

    /// Identity of the caller on whose behalf the task runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

impl TaskRequest {
    /// Creates a request with an empty input payload.
    pub fn new(task_type: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            script: script.into(),
            input: Bytes::new(),
            timeout_ms: None,
            additional_properties: None,
            owner_id: None,
        }
    }

    /// Sets the opaque input payload.
    pub fn with_input(mut self, input: impl Into<Bytes>) -> Self {
        self.input = input.into();
        self
    }

    /// Sets the worker-side execution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the opaque metadata echoed back by workers.
    pub fn with_additional_properties(mut self, properties: Value) -> Self {
        self.additional_properties = Some(properties);
        self
    }

    /// Sets the caller identity.
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Returns the worker-side timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Rejects requests without a `task_type` or `script`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] naming the missing field.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskrelay::{Error, TaskRequest};
    ///
    /// let err = TaskRequest::new("GOLLM", "  ").validate().unwrap_err();
    /// assert!(matches!(err, Error::InvalidRequest(_)));
    /// ```
    pub fn validate(&self) -> Result<(), Error> {
        if self.task_type.trim().is_empty() {
            return Err(Error::InvalidRequest("missing task type".to_string()));
        }
        if self.script.trim().is_empty() {
            return Err(Error::InvalidRequest("missing script".to_string()));
        }
        Ok(())
    }
}

/// A request as published to workers: the caller's request plus the
/// coordinator-assigned id.
///
/// Serializes flat, with `id` next to the request fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// The coordinator-assigned task id.
    pub id: TaskId,

    /// The request content.
    #[serde(flatten)]
    pub request: TaskRequest,
}

impl TaskEnvelope {
    /// Wraps a request with a freshly generated id.
    pub fn new(request: TaskRequest) -> Self {
        Self {
            id: TaskId::new(),
            request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(TaskRequest::new("", "model_card").validate().is_err());
        assert!(TaskRequest::new("GOLLM", "").validate().is_err());
        assert!(TaskRequest::new("GOLLM", "model_card").validate().is_ok());

        let err = TaskRequest::new("", "x").validate().unwrap_err();
        assert!(err.to_string().contains("task type"));
    }

    #[test]
    fn envelope_serializes_flat() {
        let request = TaskRequest::new("MIRA", "amr_to_mmt")
            .with_input(&b"abc"[..])
            .with_owner("user-7");
        let envelope = TaskEnvelope::new(request);
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["id"], json!(envelope.id.to_string()));
        assert_eq!(json["type"], "MIRA");
        assert_eq!(json["script"], "amr_to_mmt");
        assert_eq!(json["input"], "YWJj");
        assert_eq!(json["ownerId"], "user-7");
        assert!(json.get("timeoutMs").is_none());

        let decoded: TaskEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn missing_input_defaults_to_empty() {
        let request: TaskRequest =
            serde_json::from_value(json!({"type": "GOLLM", "script": "ping"})).unwrap();
        assert!(request.input.is_empty());
        assert!(request.additional_properties.is_none());
    }

    #[test]
    fn task_id_parse_rejects_garbage() {
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }

    #[test]
    fn timeout_round_trips_through_millis() {
        let request = TaskRequest::new("GOLLM", "x").with_timeout(Duration::from_secs(3));
        assert_eq!(request.timeout_ms, Some(3000));
        assert_eq!(request.timeout(), Some(Duration::from_secs(3)));
    }
}
