//! Queue and exchange layout used by the coordinator.
//!
//! ```text
//!                    "" (default) --------> {prefix}.{type}.requests ---> workers
//!
//! workers ---> {prefix}.results (fanout) --> {prefix}.results.shared ---> one instance
//!
//! instance --> {prefix}.broadcast (fanout) -+-> {prefix}.broadcast.{instance A}
//!                                           `-> {prefix}.broadcast.{instance B}
//!
//! caller ----> {prefix}.cancellation (direct, key = task id)
//!                                      `--> {prefix}.cancellation.{task id} ---> worker
//! ```
//!
//! Every declaration is idempotent. Request queues are remembered once
//! declared so the dispatch path does not redeclare them per task.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashSet;

use super::{Broker, BrokerError, ExchangeSpec, QueueSpec};
use crate::error::Result;
use crate::types::{TaskEnvelope, TaskId, TaskResponse};

/// Names and lifetimes of every broker entity the coordinator uses.
///
/// # Examples
///
/// ```
/// use taskrelay::broker::Topology;
///
/// let topology = Topology::new("terarium");
/// assert_eq!(topology.request_queue("GOLLM"), "terarium.gollm.requests");
/// assert_eq!(topology.results_exchange, "terarium.results");
/// assert_eq!(topology.instance_queue("a1"), "terarium.broadcast.a1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Prefix for request queue names.
    pub prefix: String,
    /// Fanout exchange workers publish responses to.
    pub results_exchange: String,
    /// Competing queue bound to the results exchange.
    pub shared_results_queue: String,
    /// Fanout exchange for cross-instance delivery.
    pub broadcast_exchange: String,
    /// Direct exchange for cancellation messages.
    pub cancellation_exchange: String,
    /// Unused-queue expiry for per-task cancellation queues.
    pub cancellation_expiry: Duration,
}

impl Topology {
    /// Layout derived from `prefix` with a five minute cancellation expiry.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            results_exchange: format!("{prefix}.results"),
            shared_results_queue: format!("{prefix}.results.shared"),
            broadcast_exchange: format!("{prefix}.broadcast"),
            cancellation_exchange: format!("{prefix}.cancellation"),
            cancellation_expiry: Duration::from_secs(300),
            prefix,
        }
    }

    /// Queue workers of `task_type` consume requests from.
    pub fn request_queue(&self, task_type: &str) -> String {
        format!("{}.{}.requests", self.prefix, task_type.to_lowercase())
    }

    /// Per-task cancellation queue.
    pub fn cancellation_queue(&self, task_id: TaskId) -> String {
        format!("{}.{}", self.cancellation_exchange, task_id)
    }

    /// Private broadcast queue of one coordinator instance.
    pub fn instance_queue(&self, instance_id: &str) -> String {
        format!("{}.{}", self.broadcast_exchange, instance_id)
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new("terarium")
    }
}

/// Declares the [`Topology`] on a [`Broker`] and publishes coordinator
/// messages through it.
#[derive(Clone)]
pub struct TopologyManager {
    broker: Arc<dyn Broker>,
    topology: Topology,
    declared: Arc<DashSet<String>>,
}

impl std::fmt::Debug for TopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyManager")
            .field("topology", &self.topology)
            .field("declared", &self.declared.len())
            .finish_non_exhaustive()
    }
}

impl TopologyManager {
    /// Creates a manager; nothing is declared until asked.
    pub fn new(broker: Arc<dyn Broker>, topology: Topology) -> Self {
        Self {
            broker,
            topology,
            declared: Arc::new(DashSet::new()),
        }
    }

    /// The layout being managed.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The underlying broker.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Declares the exchanges and the shared results queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if any declaration fails.
    pub async fn declare_shared(&self) -> Result<(), BrokerError> {
        let t = &self.topology;
        self.broker
            .declare_exchange(&ExchangeSpec::fanout(&t.results_exchange))
            .await?;
        self.broker
            .declare_queue(&QueueSpec::durable(&t.shared_results_queue))
            .await?;
        self.broker
            .bind_queue(&t.shared_results_queue, &t.results_exchange, "")
            .await?;
        self.broker
            .declare_exchange(&ExchangeSpec::fanout(&t.broadcast_exchange))
            .await?;
        self.broker
            .declare_exchange(&ExchangeSpec::direct(&t.cancellation_exchange))
            .await?;
        tracing::debug!(
            results = %t.results_exchange,
            broadcast = %t.broadcast_exchange,
            cancellation = %t.cancellation_exchange,
            "declared shared topology"
        );
        Ok(())
    }

    /// Declares the shared topology once per manager.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if any declaration fails.
    pub async fn ensure_shared(&self) -> Result<(), BrokerError> {
        if !self.declared.contains(&self.topology.shared_results_queue) {
            self.declare_shared().await?;
            self.declared
                .insert(self.topology.shared_results_queue.clone());
        }
        Ok(())
    }

    /// Declares this instance's private, auto-deleting broadcast queue and
    /// binds it to the broadcast exchange. Returns the queue name.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the declaration or binding fails.
    pub async fn declare_instance_queue(&self, instance_id: &str) -> Result<String, BrokerError> {
        let name = self.topology.instance_queue(instance_id);
        self.broker
            .declare_queue(&QueueSpec::transient(&name).with_auto_delete().with_exclusive())
            .await?;
        self.broker
            .bind_queue(&name, &self.topology.broadcast_exchange, "")
            .await?;
        Ok(name)
    }

    /// Declares the request queue for `task_type` once per manager.
    /// Returns the queue name.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the declaration fails.
    pub async fn ensure_request_queue(&self, task_type: &str) -> Result<String, BrokerError> {
        let name = self.topology.request_queue(task_type);
        if !self.declared.contains(&name) {
            self.broker.declare_queue(&QueueSpec::durable(&name)).await?;
            tracing::debug!(queue = %name, "declared request queue");
            self.declared.insert(name.clone());
        }
        Ok(name)
    }

    /// Declares the cancellation queue for `task_id`, bound to the
    /// cancellation exchange with the task id as routing key.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the declaration or binding fails.
    pub async fn declare_cancellation_queue(&self, task_id: TaskId) -> Result<String, BrokerError> {
        let name = self.topology.cancellation_queue(task_id);
        self.broker
            .declare_queue(
                &QueueSpec::transient(&name).with_expires(self.topology.cancellation_expiry),
            )
            .await?;
        self.broker
            .bind_queue(
                &name,
                &self.topology.cancellation_exchange,
                &task_id.to_string(),
            )
            .await?;
        Ok(name)
    }

    /// Deletes the cancellation queue for `task_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] on transport failures.
    pub async fn delete_cancellation_queue(&self, task_id: TaskId) -> Result<bool, BrokerError> {
        self.broker
            .delete_queue(&self.topology.cancellation_queue(task_id))
            .await
    }

    /// Publishes a request envelope to its type's request queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Broker`](crate::Error::Broker) if the message could
    /// not be routed to the request queue.
    pub async fn publish_request(&self, envelope: &TaskEnvelope) -> Result<()> {
        let queue = self.topology.request_queue(&envelope.request.task_type);
        let payload = Bytes::from(serde_json::to_vec(envelope)?);
        let routed = self.broker.publish("", &queue, payload).await?;
        if routed == 0 {
            self.declared.remove(&queue);
            return Err(BrokerError::QueueNotFound { queue }.into());
        }
        Ok(())
    }

    /// Publishes a worker response to the results exchange.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or publishing fails.
    pub async fn publish_result(&self, response: &TaskResponse) -> Result<usize> {
        let payload = Bytes::from(serde_json::to_vec(response)?);
        Ok(self
            .broker
            .publish(&self.topology.results_exchange, "", payload)
            .await?)
    }

    /// Publishes a processed response to every instance.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or publishing fails.
    pub async fn publish_broadcast(&self, response: &TaskResponse) -> Result<usize> {
        let payload = Bytes::from(serde_json::to_vec(response)?);
        Ok(self
            .broker
            .publish(&self.topology.broadcast_exchange, "", payload)
            .await?)
    }

    /// Publishes an empty cancellation message routed by `task_id`.
    /// Returns how many queues received it.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if publishing fails.
    pub async fn publish_cancellation(&self, task_id: TaskId) -> Result<usize, BrokerError> {
        self.broker
            .publish(
                &self.topology.cancellation_exchange,
                &task_id.to_string(),
                Bytes::new(),
            )
            .await
    }
}
