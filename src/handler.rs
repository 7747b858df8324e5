//! Per-script response handlers.
//!
//! A [`ResponseHandler`] post-processes worker responses for one script
//! before they are cached and broadcast: parsing model output, persisting
//! side effects, enriching the payload. It runs on exactly one instance per
//! message (the one that won the shared results queue).
//!
//! The default [`ResponseHandler::handle`] dispatches to a hook per status,
//! so most handlers only override `on_success` and maybe `on_failure`.
//!
//! A handler that returns an error or panics turns the response into a
//! `FAILED` response whose output is the error text.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;

use crate::types::{TaskResponse, TaskStatus};

/// Post-processing for responses of one script.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use taskrelay::{ResponseHandler, TaskResponse};
///
/// struct ModelCard;
///
/// #[async_trait]
/// impl ResponseHandler for ModelCard {
///     fn script(&self) -> &str {
///         "model_card"
///     }
///
///     async fn on_success(&self, response: &mut TaskResponse) -> anyhow::Result<()> {
///         let card: serde_json::Value = serde_json::from_slice(&response.output)?;
///         response.output = serde_json::to_vec(&card["card"])?.into();
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    /// The script whose responses this handler processes.
    fn script(&self) -> &str;

    /// Processes one response. Dispatches to the status hooks by default.
    ///
    /// # Errors
    ///
    /// Any error marks the response `FAILED`.
    async fn handle(&self, mut response: TaskResponse) -> anyhow::Result<TaskResponse> {
        match response.status {
            TaskStatus::Queued => self.on_queued(&mut response).await?,
            TaskStatus::Running => self.on_running(&mut response).await?,
            TaskStatus::Cancelling => self.on_cancelling(&mut response).await?,
            TaskStatus::Cancelled => self.on_cancelled(&mut response).await?,
            TaskStatus::Success => self.on_success(&mut response).await?,
            TaskStatus::Failed => self.on_failure(&mut response).await?,
        }
        Ok(response)
    }

    /// Called for `QUEUED` responses.
    async fn on_queued(&self, _response: &mut TaskResponse) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called for `RUNNING` responses.
    async fn on_running(&self, _response: &mut TaskResponse) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called for `CANCELLING` responses.
    async fn on_cancelling(&self, _response: &mut TaskResponse) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called for `CANCELLED` responses.
    async fn on_cancelled(&self, _response: &mut TaskResponse) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called for `SUCCESS` responses.
    async fn on_success(&self, _response: &mut TaskResponse) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called for `FAILED` responses.
    async fn on_failure(&self, _response: &mut TaskResponse) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handlers indexed by script name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn ResponseHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scripts: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("HandlerRegistry")
            .field("scripts", &scripts)
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for its script, replacing any previous one.
    pub fn register(&self, handler: Arc<dyn ResponseHandler>) {
        let script = handler.script().to_string();
        if self.handlers.insert(script.clone(), handler).is_some() {
            tracing::warn!(script = %script, "replaced existing response handler");
        }
    }

    /// The handler for `script`, if any.
    pub fn get(&self, script: &str) -> Option<Arc<dyn ResponseHandler>> {
        self.handlers.get(script).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler registered for `response.script`.
    ///
    /// Responses for scripts without a handler pass through unchanged.
    /// Handler errors and panics yield a `FAILED` response carrying the
    /// error text. The task id is always preserved.
    pub async fn apply(&self, response: TaskResponse) -> TaskResponse {
        let Some(handler) = self.get(&response.script) else {
            return response;
        };
        let original = response.clone();

        match AssertUnwindSafe(handler.handle(response)).catch_unwind().await {
            Ok(Ok(mut handled)) => {
                handled.id = original.id;
                handled
            },
            Ok(Err(e)) => {
                tracing::warn!(
                    task_id = %original.id,
                    script = %original.script,
                    status = %original.status,
                    error = %e,
                    "response handler failed"
                );
                original.into_failed(format!("{e:#}"))
            },
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    task_id = %original.id,
                    script = %original.script,
                    status = %original.status,
                    panic = %message,
                    "response handler panicked"
                );
                original.into_failed(format!("handler panicked: {message}"))
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
