//! Per-instance registry of local waiters.
//!
//! Two kinds of waiters are tracked, both keyed by [`TaskId`] and never
//! shared with other instances:
//!
//! - **Completion promises** for synchronous callers. One promise per task
//!   id; every caller on this instance waiting for the same task receives a
//!   handle to the same underlying channel. Resolving removes the promise,
//!   so a repeated resolve (duplicate broadcast) is a no-op.
//! - **Live connections** for streaming subscribers. Several per task id.
//!   Every pushed status event goes to every open connection; closed ones
//!   are dropped on the next push, and all of them are removed after a
//!   terminal event.
//!
//! ```text
//! broadcast ──► resolve(response) ──► promise ──► run_sync / TaskFuture
//!          └──► push(response) ─────► [conn, conn, ...] ──► TaskEventStream
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{Error, Result};
use crate::types::{TaskId, TaskResponse};

/// A handle on the eventual terminal response of a task.
///
/// Cheap to clone; all clones observe the same value.
///
/// # Examples
///
/// ```
/// use taskrelay::{CompletionPromise, TaskEnvelope, TaskRequest, TaskResponse, TaskStatus};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let envelope = TaskEnvelope::new(TaskRequest::new("GOLLM", "model_card"));
/// let done = TaskResponse::queued(&envelope).with_status(TaskStatus::Success);
///
/// let promise = CompletionPromise::resolved(done.clone());
/// assert_eq!(promise.wait().await.unwrap(), done);
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CompletionPromise {
    task_id: TaskId,
    rx: watch::Receiver<Option<TaskResponse>>,
}

impl CompletionPromise {
    /// A promise that is already resolved with `response`.
    pub fn resolved(response: TaskResponse) -> Self {
        let task_id = response.id;
        let (_tx, rx) = watch::channel(Some(response));
        Self { task_id, rx }
    }

    /// The task this promise belongs to.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The response, if it has already arrived.
    pub fn try_get(&self) -> Option<TaskResponse> {
        self.rx.borrow().clone()
    }

    /// Waits for the response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the promise was discarded without a
    /// response.
    pub async fn wait(&self) -> Result<TaskResponse> {
        let mut rx = self.rx.clone();
        loop {
            if let Some(response) = rx.borrow_and_update().clone() {
                return Ok(response);
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone().ok_or(Error::Closed {
                    task_id: self.task_id,
                });
            }
        }
    }
}

/// Whether a streaming subscriber is still listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The subscriber holds its stream.
    Open,
    /// The subscriber dropped its stream.
    Closed,
}

#[derive(Debug)]
struct Connection {
    tx: mpsc::UnboundedSender<TaskResponse>,
}

impl Connection {
    fn state(&self) -> ConnectionState {
        if self.tx.is_closed() {
            ConnectionState::Closed
        } else {
            ConnectionState::Open
        }
    }
}

/// Stream of status events for one task, handed to a streaming subscriber.
///
/// Ends after a terminal event has been delivered.
#[derive(Debug)]
pub struct TaskEventStream {
    task_id: TaskId,
    inner: UnboundedReceiverStream<TaskResponse>,
}

impl TaskEventStream {
    /// The task this stream follows.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Stream for TaskEventStream {
    type Item = TaskResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Local promises and connections of one coordinator instance.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    promises: DashMap<TaskId, watch::Sender<Option<TaskResponse>>>,
    connections: DashMap<TaskId, Vec<Connection>>,
}

impl WaiterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pending promise for `task_id`, creating it if needed.
    pub fn register_promise(&self, task_id: TaskId) -> CompletionPromise {
        let rx = self
            .promises
            .entry(task_id)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        CompletionPromise { task_id, rx }
    }

    /// Resolves and removes the pending promise for `response.id`.
    ///
    /// Returns `false` if there was none (never registered here, or already
    /// resolved).
    pub fn resolve(&self, response: &TaskResponse) -> bool {
        match self.promises.remove(&response.id) {
            Some((_, tx)) => {
                tx.send_replace(Some(response.clone()));
                true
            },
            None => false,
        }
    }

    /// Drops the pending promise for `task_id` without a value. Waiters see
    /// [`Error::Closed`].
    pub fn discard_promise(&self, task_id: TaskId) -> bool {
        self.promises.remove(&task_id).is_some()
    }

    /// Adds a streaming connection for `task_id`.
    pub fn register_connection(&self, task_id: TaskId) -> TaskEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .entry(task_id)
            .or_default()
            .push(Connection { tx });
        TaskEventStream {
            task_id,
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Sends `response` to every open connection for its task and returns
    /// how many received it.
    ///
    /// Closed connections are dropped. After a terminal response all
    /// connections for the task are removed, which ends their streams.
    pub fn push(&self, response: &TaskResponse) -> usize {
        let mut delivered = 0;
        if let Some(mut connections) = self.connections.get_mut(&response.id) {
            connections.retain(|connection| {
                if connection.state() == ConnectionState::Closed {
                    tracing::debug!(task_id = %response.id, "dropping closed connection");
                    return false;
                }
                if connection.tx.send(response.clone()).is_ok() {
                    delivered += 1;
                    true
                } else {
                    false
                }
            });
        }

        if response.status.is_terminal() {
            self.connections.remove(&response.id);
        } else {
            self.connections
                .remove_if(&response.id, |_, connections| connections.is_empty());
        }
        delivered
    }

    /// Ids of every task with a pending promise or an open connection.
    pub fn tracked_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.promises.iter().map(|entry| *entry.key()).collect();
        ids.extend(
            self.connections
                .iter()
                .map(|entry| *entry.key())
                .filter(|id| !self.promises.contains_key(id)),
        );
        ids
    }

    /// Drops every waiter for `task_id` without a response. Promise holders
    /// see [`Error::Closed`] and event streams end.
    ///
    /// Returns `true` if anything was registered.
    pub fn forget(&self, task_id: TaskId) -> bool {
        let promise = self.promises.remove(&task_id).is_some();
        let connections = self.connections.remove(&task_id).is_some();
        promise || connections
    }

    /// Number of unresolved promises.
    pub fn pending_promises(&self) -> usize {
        self.promises.len()
    }

    /// Returns `true` if a promise for `task_id` is pending.
    pub fn has_promise(&self, task_id: TaskId) -> bool {
        self.promises.contains_key(&task_id)
    }

    /// Number of registered connections for `task_id`.
    pub fn connection_count(&self, task_id: TaskId) -> usize {
        self.connections
            .get(&task_id)
            .map_or(0, |connections| connections.len())
    }
}
