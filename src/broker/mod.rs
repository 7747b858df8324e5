//! Message broker abstraction.
//!
//! The coordinator speaks to the broker through the [`Broker`] trait, an
//! AMQP-shaped surface: named exchanges (direct or fanout), named queues,
//! bindings with routing keys, publish and consume. The empty exchange name
//! `""` is the default exchange, which routes to the queue whose name equals
//! the routing key.
//!
//! Delivery is at-least-once from the coordinator's point of view: every
//! consumer in this crate tolerates duplicates.
//!
//! [`InMemoryBroker`] implements the trait in-process; [`topology`] holds
//! the queue and exchange layout the coordinator declares on top of it.

pub mod memory;
pub mod topology;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

pub use memory::InMemoryBroker;
pub use topology::{Topology, TopologyManager};

/// Exchange routing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes to queues bound with a routing key equal to the message's.
    Direct,
    /// Routes to every bound queue, ignoring routing keys.
    Fanout,
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange name.
    pub name: String,
    /// Routing behavior.
    pub kind: ExchangeKind,
}

impl ExchangeSpec {
    /// A fanout exchange.
    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
        }
    }

    /// A direct exchange.
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
        }
    }
}

/// Queue declaration.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskrelay::broker::QueueSpec;
///
/// let spec = QueueSpec::durable("terarium.gollm.requests");
/// assert!(spec.durable && !spec.auto_delete);
///
/// let spec = QueueSpec::transient("terarium.cancellation.42")
///     .with_expires(Duration::from_secs(300));
/// assert_eq!(spec.expires, Some(Duration::from_secs(300)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Survives broker restarts.
    pub durable: bool,
    /// Deleted when its last consumer goes away.
    pub auto_delete: bool,
    /// At most one consumer at a time.
    pub exclusive: bool,
    /// Deleted after being unused (no consumers, no redeclaration) this long.
    pub expires: Option<Duration>,
}

impl QueueSpec {
    /// A durable, shared queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            expires: None,
        }
    }

    /// A non-durable queue.
    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            auto_delete: false,
            exclusive: false,
            expires: None,
        }
    }

    /// Marks the queue auto-deleting.
    pub fn with_auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Marks the queue exclusive to one consumer.
    pub fn with_exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the unused-queue expiry.
    pub fn with_expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }
}

/// Errors raised by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The named queue does not exist.
    #[error("queue not found: {queue}")]
    QueueNotFound {
        /// Queue name.
        queue: String,
    },

    /// The named exchange does not exist.
    #[error("exchange not found: {exchange}")]
    ExchangeNotFound {
        /// Exchange name.
        exchange: String,
    },

    /// A declaration conflicts with an existing entity, or an exclusive
    /// queue already has a consumer.
    #[error("precondition failed: {message}")]
    Precondition {
        /// Human-readable description.
        message: String,
    },

    /// Transport or broker-specific failure.
    #[error("broker error: {message}")]
    Backend {
        /// Human-readable description.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Stream of message bodies delivered to one consumer.
///
/// Ends when the queue is deleted.
pub type Deliveries = BoxStream<'static, Bytes>;

/// AMQP-shaped message broker.
///
/// All declarations are idempotent: redeclaring an identical exchange,
/// queue or binding succeeds and changes nothing.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares an exchange.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Precondition`] if it exists with a different kind.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Declares a queue.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Precondition`] if it exists with different flags.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    /// Binds `queue` to `exchange` with `routing_key`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::QueueNotFound`] or [`BrokerError::ExchangeNotFound`].
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Deletes a queue and its bindings. Active consumers see their stream
    /// end. Returns `false` if the queue did not exist.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Backend`] on transport failures.
    async fn delete_queue(&self, queue: &str) -> Result<bool, BrokerError>;

    /// Publishes `payload` and returns how many queues it was routed to.
    ///
    /// Unroutable messages are dropped and yield `0`.
    ///
    /// # Errors
    ///
    /// [`BrokerError::ExchangeNotFound`] for an undeclared non-default
    /// exchange.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<usize, BrokerError>;

    /// Starts consuming from `queue`. Several consumers on one queue compete:
    /// each message goes to exactly one of them.
    ///
    /// # Errors
    ///
    /// [`BrokerError::QueueNotFound`], or [`BrokerError::Precondition`] for a
    /// second consumer on an exclusive queue.
    async fn consume(&self, queue: &str) -> Result<Deliveries, BrokerError>;
}
