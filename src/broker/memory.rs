//! In-process broker.
//!
//! [`InMemoryBroker`] implements [`Broker`] with one unbounded channel per
//! queue. Cloning the broker shares its state, so several coordinators and
//! test workers in one process can talk to each other through it.
//!
//! Queue semantics follow AMQP closely enough for the coordinator:
//!
//! - consumers of one queue compete, each message is delivered once;
//! - `auto_delete` queues vanish when their last consumer is dropped;
//! - queues with `expires` vanish after being unused for that long, checked
//!   lazily whenever the broker is touched;
//! - deleting a queue ends every consumer stream on it and discards
//!   undelivered messages.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Broker, BrokerError, Deliveries, ExchangeKind, ExchangeSpec, QueueSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    depth: AtomicUsize,
    consumers: AtomicUsize,
    closed: CancellationToken,
    last_used: Mutex<Instant>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            spec,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            depth: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
            closed: CancellationToken::new(),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn is_expired(&self, now: Instant) -> bool {
        match self.spec.expires {
            Some(expires) => {
                self.consumers.load(Ordering::SeqCst) == 0 && now >= *self.last_used.lock() + expires
            },
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    exchanges: DashMap<String, ExchangeState>,
    queues: DashMap<String, Arc<QueueState>>,
    published: AtomicU64,
}

impl Inner {
    /// Closes a queue that was already removed from the map and drops its
    /// bindings.
    fn detach(&self, name: &str, queue: &QueueState) {
        queue.closed.cancel();
        for mut exchange in self.exchanges.iter_mut() {
            exchange.bindings.retain(|binding| binding.queue != name);
        }
    }

    fn remove_queue(&self, name: &str) -> bool {
        match self.queues.remove(name) {
            Some((_, queue)) => {
                self.detach(name, &queue);
                true
            },
            None => false,
        }
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .queues
            .iter()
            .filter(|queue| queue.is_expired(now))
            .map(|queue| queue.key().clone())
            .collect();
        for name in expired {
            if let Some((_, queue)) = self.queues.remove_if(&name, |_, q| q.is_expired(now)) {
                tracing::debug!(queue = %name, "deleting expired queue");
                self.detach(&name, &queue);
            }
        }
    }
}

/// Drops consumer bookkeeping when a delivery stream is dropped.
struct ConsumerGuard {
    inner: Arc<Inner>,
    name: String,
    queue: Arc<QueueState>,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let previous = self.queue.consumers.fetch_sub(1, Ordering::SeqCst);
        self.queue.touch();
        if previous == 1 && self.queue.spec.auto_delete {
            let queue = &self.queue;
            let removed = self
                .inner
                .queues
                .remove_if(&self.name, |_, current| Arc::ptr_eq(current, queue));
            if removed.is_some() {
                tracing::debug!(queue = %self.name, "deleting auto-delete queue");
                self.inner.detach(&self.name, queue);
            }
        }
    }
}

/// In-process [`Broker`].
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use futures::StreamExt;
/// use taskrelay::broker::{Broker, InMemoryBroker, QueueSpec};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let broker = InMemoryBroker::new();
/// broker.declare_queue(&QueueSpec::durable("jobs")).await.unwrap();
/// let mut deliveries = broker.consume("jobs").await.unwrap();
///
/// let routed = broker.publish("", "jobs", Bytes::from_static(b"hello")).await.unwrap();
/// assert_eq!(routed, 1);
/// assert_eq!(deliveries.next().await.unwrap(), Bytes::from_static(b"hello"));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `name` exists (after sweeping expired queues).
    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.sweep_expired();
        self.inner.queues.contains_key(name)
    }

    /// Returns `true` if the exchange `name` exists.
    pub fn has_exchange(&self, name: &str) -> bool {
        self.inner.exchanges.contains_key(name)
    }

    /// Number of undelivered messages in `name`.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.inner
            .queues
            .get(name)
            .map(|queue| queue.depth.load(Ordering::SeqCst))
    }

    /// Number of active consumers on `name`.
    pub fn consumer_count(&self, name: &str) -> Option<usize> {
        self.inner
            .queues
            .get(name)
            .map(|queue| queue.consumers.load(Ordering::SeqCst))
    }

    /// Total number of publish calls, routed or not.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        if spec.name.is_empty() {
            return Err(BrokerError::Precondition {
                message: "the default exchange cannot be declared".to_string(),
            });
        }
        match self.inner.exchanges.entry(spec.name.clone()) {
            Entry::Occupied(existing) if existing.get().kind != spec.kind => {
                Err(BrokerError::Precondition {
                    message: format!(
                        "exchange {} exists as {:?}, not {:?}",
                        spec.name,
                        existing.get().kind,
                        spec.kind
                    ),
                })
            },
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(vacant) => {
                vacant.insert(ExchangeState {
                    kind: spec.kind,
                    bindings: Vec::new(),
                });
                Ok(())
            },
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.inner.sweep_expired();
        match self.inner.queues.entry(spec.name.clone()) {
            Entry::Occupied(existing) => {
                let queue = existing.get();
                if queue.spec != *spec {
                    return Err(BrokerError::Precondition {
                        message: format!("queue {} exists with different flags", spec.name),
                    });
                }
                queue.touch();
                Ok(())
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(QueueState::new(spec.clone())));
                Ok(())
            },
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        if !self.inner.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound {
                queue: queue.to_string(),
            });
        }
        let mut state =
            self.inner
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound {
                    exchange: exchange.to_string(),
                })?;
        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<bool, BrokerError> {
        Ok(self.inner.remove_queue(queue))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<usize, BrokerError> {
        self.inner.sweep_expired();
        self.inner.published.fetch_add(1, Ordering::SeqCst);

        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let state =
                self.inner
                    .exchanges
                    .get(exchange)
                    .ok_or_else(|| BrokerError::ExchangeNotFound {
                        exchange: exchange.to_string(),
                    })?;
            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| state.kind == ExchangeKind::Fanout || b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        let mut routed = 0;
        for name in targets {
            let Some(queue) = self.inner.queues.get(&name).map(|q| Arc::clone(q.value())) else {
                continue;
            };
            queue.depth.fetch_add(1, Ordering::SeqCst);
            if queue.tx.send(payload.clone()).is_ok() {
                routed += 1;
            } else {
                queue.depth.fetch_sub(1, Ordering::SeqCst);
            }
        }
        if routed == 0 {
            tracing::debug!(exchange, routing_key, "dropping unroutable message");
        }
        Ok(routed)
    }

    async fn consume(&self, queue: &str) -> Result<Deliveries, BrokerError> {
        let state = self
            .inner
            .queues
            .get(queue)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| BrokerError::QueueNotFound {
                queue: queue.to_string(),
            })?;

        if state.spec.exclusive {
            if state
                .consumers
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(BrokerError::Precondition {
                    message: format!("exclusive queue {queue} already has a consumer"),
                });
            }
        } else {
            state.consumers.fetch_add(1, Ordering::SeqCst);
        }
        state.touch();

        let guard = ConsumerGuard {
            inner: Arc::clone(&self.inner),
            name: queue.to_string(),
            queue: state,
        };
        let deliveries = futures::stream::unfold(guard, |guard| async move {
            let next = {
                let mut rx = guard.queue.rx.lock().await;
                tokio::select! {
                    biased;
                    () = guard.queue.closed.cancelled() => None,
                    message = rx.recv() => message,
                }
            };
            let message = next?;
            guard.queue.depth.fetch_sub(1, Ordering::SeqCst);
            Some((message, guard))
        });
        Ok(deliveries.boxed())
    }
}
