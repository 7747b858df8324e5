//! Response ingestion.
//!
//! Worker responses reach the fleet through two consumers:
//!
//! ```text
//! results exchange ──► shared queue ──► handle_result (one instance)
//!                                         │ 1. decode
//!                                         │ 2. skip if cache is terminal
//!                                         │ 3. run handler
//!                                         │ 4. write cache (locked)
//!                                         ▼ 5. publish broadcast
//! broadcast exchange ──► instance queue ──► handle_broadcast (every instance)
//!                                         │ resolve local promise (locked, terminal only)
//!                                         ▼ push to local connections
//! ```
//!
//! The cache write always precedes the broadcast, so an instance receiving
//! a broadcast can trust the cache is at least as new.
//!
//! Both paths are idempotent. Once a terminal response is cached, a
//! redelivered result is dropped before its handler runs. A redelivered
//! broadcast resolves nothing because the promise is gone, and the
//! connections were removed after the terminal event.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::broker::{Deliveries, TopologyManager};
use crate::cache::{RecordOutcome, ResultCache};
use crate::error::{Error, Result};
use crate::handler::HandlerRegistry;
use crate::registry::WaiterRegistry;
use crate::types::{TaskResponse, TaskStatus};

/// What [`ResponsePipeline::handle_result`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    /// The message could not be decoded and was discarded.
    Dropped,
    /// A terminal response was already cached; nothing was written or
    /// broadcast.
    Stale {
        /// Status of the cached terminal response.
        cached: TaskStatus,
    },
    /// The handled response was broadcast.
    Recorded {
        /// Status after the handler ran.
        status: TaskStatus,
        /// Whether the cache write succeeded.
        cached: bool,
    },
}

/// What [`ResponsePipeline::handle_broadcast`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// The message could not be decoded and was discarded.
    Dropped,
    /// The response was delivered to local waiters.
    Delivered {
        /// A pending promise was resolved.
        resolved: bool,
        /// Number of connections that received the event.
        pushed: usize,
    },
}

/// Processes worker responses for one coordinator instance.
#[derive(Debug, Clone)]
pub struct ResponsePipeline {
    cache: ResultCache,
    topology: TopologyManager,
    handlers: Arc<HandlerRegistry>,
    waiters: Arc<WaiterRegistry>,
}

impl ResponsePipeline {
    /// Creates a pipeline over shared components.
    pub fn new(
        cache: ResultCache,
        topology: TopologyManager,
        handlers: Arc<HandlerRegistry>,
        waiters: Arc<WaiterRegistry>,
    ) -> Self {
        Self {
            cache,
            topology,
            handlers,
            waiters,
        }
    }

    /// Single-winner path: run the handler, update the cache, broadcast.
    ///
    /// Nothing happens once the cached response is terminal: the handler
    /// is not run again and nothing is broadcast. A failed cache write is logged and the response is broadcast anyway,
    /// so local waiters are not left hanging on a cache outage.
    ///
    /// # Errors
    ///
    /// Returns an error only if the broadcast publish fails.
    pub async fn handle_result(&self, payload: &[u8]) -> Result<ResultOutcome> {
        let response: TaskResponse = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, bytes = payload.len(), "dropping undecodable result message");
                return Ok(ResultOutcome::Dropped);
            },
        };
        tracing::debug!(
            task_id = %response.id,
            script = %response.script,
            status = %response.status,
            "received task result"
        );

        match self.cache.response(response.id).await {
            Ok(Some(cached)) if cached.status.is_terminal() => {
                tracing::debug!(
                    task_id = %response.id,
                    status = %response.status,
                    cached = %cached.status,
                    "ignoring result for finished task"
                );
                return Ok(ResultOutcome::Stale {
                    cached: cached.status,
                });
            },
            Ok(_) => {},
            Err(e) => {
                tracing::warn!(
                    task_id = %response.id,
                    error = %e,
                    "could not read cached response before handling result"
                );
            },
        }

        let handled = self.handlers.apply(response).await;

        let cache = &self.cache;
        let recorded = cache
            .with_lock(|| async { cache.record_response(&handled).await.map_err(Error::from) })
            .await;
        let cached = match recorded {
            Ok(RecordOutcome::Written) => true,
            Ok(RecordOutcome::Stale { cached }) => {
                tracing::debug!(
                    task_id = %handled.id,
                    status = %handled.status,
                    cached = %cached,
                    "ignoring status update after terminal state"
                );
                return Ok(ResultOutcome::Stale { cached });
            },
            Err(e) => {
                tracing::error!(
                    task_id = %handled.id,
                    status = %handled.status,
                    error = %e,
                    "failed to cache task response, broadcasting anyway"
                );
                false
            },
        };

        self.topology.publish_broadcast(&handled).await?;
        Ok(ResultOutcome::Recorded {
            status: handled.status,
            cached,
        })
    }

    /// Broadcast path: resolve the local promise on terminal responses and
    /// push the event to local connections.
    pub async fn handle_broadcast(&self, payload: &[u8]) -> BroadcastOutcome {
        let response: TaskResponse = match serde_json::from_slice(payload) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, bytes = payload.len(), "dropping undecodable broadcast message");
                return BroadcastOutcome::Dropped;
            },
        };

        let mut resolved = false;
        if response.status.is_terminal() && self.waiters.has_promise(response.id) {
            let waiters = &self.waiters;
            let response = &response;
            resolved = match self
                .cache
                .with_lock(|| async move { Ok(waiters.resolve(response)) })
                .await
            {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::warn!(
                        task_id = %response.id,
                        error = %e,
                        "resolving promise without lock"
                    );
                    self.waiters.resolve(response)
                },
            };
        }

        let pushed = self.waiters.push(&response);
        tracing::debug!(
            task_id = %response.id,
            status = %response.status,
            resolved,
            pushed,
            "delivered broadcast"
        );
        BroadcastOutcome::Delivered { resolved, pushed }
    }

    /// Consumes the shared results queue until `shutdown` fires, handling up
    /// to `concurrency` messages at once.
    pub async fn run_result_consumer(
        self,
        deliveries: Deliveries,
        shutdown: CancellationToken,
        concurrency: usize,
    ) {
        let stop = shutdown.clone();
        deliveries
            .take_until(async move { stop.cancelled().await })
            .for_each_concurrent(concurrency, |payload| {
                let pipeline = self.clone();
                async move {
                    if let Err(e) = pipeline.handle_result(&payload).await {
                        tracing::error!(error = %e, "failed to process task result");
                    }
                }
            })
            .await;
        tracing::debug!("result consumer stopped");
    }

    /// Consumes this instance's broadcast queue until `shutdown` fires.
    /// Messages are handled in arrival order.
    pub async fn run_broadcast_consumer(self, deliveries: Deliveries, shutdown: CancellationToken) {
        let stop = shutdown.clone();
        deliveries
            .take_until(async move { stop.cancelled().await })
            .for_each(|payload| {
                let pipeline = self.clone();
                async move {
                    pipeline.handle_broadcast(&payload).await;
                }
            })
            .await;
        tracing::debug!("broadcast consumer stopped");
    }
}
