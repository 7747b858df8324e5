//! The task coordinator: dispatch, synchronous wait, streaming subscribe and
//! cancellation.
//!
//! # Dispatch
//!
//! ```text
//! dispatch(request)
//!   validate ─► assign id ─► fingerprint
//!   ┌──────────────── distributed lock ────────────────┐
//!   │ claim fingerprint ──► already bound?             │
//!   │   yes, cached QUEUED/RUNNING/SUCCESS ─► coalesce │
//!   │   yes, cached FAILED/CANCELLED/CANCELLING        │
//!   │        or evicted ─► rebind to new id ─┐         │
//!   │   no ──────────────────────────────────┤         │
//!   │     register promise                   │         │
//!   │     cache QUEUED                       │         │
//!   │     ensure request queue               │         │
//!   │     declare cancellation queue         │         │
//!   │     publish request ── fails? ─► roll back       │
//!   └──────────────────────────────────────────────────┘
//! ```
//!
//! The cancellation queue is declared before the request is published, so a
//! `cancel` issued before any worker picks the request up is retained.
//!
//! # Cleanup
//!
//! While started, the coordinator sweeps every `cleanup_interval_ms`. The
//! sweep removes expired cache entries, then checks each local waiter
//! against the cache: waiters of tasks that left the cache are closed, and
//! waiters of tasks with a cached terminal response are resolved from it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, InMemoryBroker, TopologyManager};
use crate::cache::{CacheBackend, InMemoryCacheBackend, ResultCache};
use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::handler::{HandlerRegistry, ResponseHandler};
use crate::ingest::ResponsePipeline;
use crate::lock::{DistributedLock, InMemoryLock};
use crate::registry::{CompletionPromise, TaskEventStream, WaiterRegistry};
use crate::stats::{DispatchStats, DispatchStatsSnapshot};
use crate::types::{TaskEnvelope, TaskId, TaskRequest, TaskResponse, TaskStatus};

/// Handle on a dispatched (or coalesced) task.
#[derive(Debug, Clone)]
pub struct TaskFuture {
    id: TaskId,
    latest: TaskResponse,
    completion: CompletionPromise,
    coalesced: bool,
}

impl TaskFuture {
    /// Id of the task doing the work. For a coalesced request this is the
    /// id of the earlier, identical request.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The cached response at dispatch time.
    pub fn latest_response(&self) -> &TaskResponse {
        &self.latest
    }

    /// `true` if no new work was published for this request.
    pub fn is_coalesced(&self) -> bool {
        self.coalesced
    }

    /// The completion promise.
    pub fn completion(&self) -> &CompletionPromise {
        &self.completion
    }

    /// Waits for the terminal response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the promise was discarded.
    pub async fn wait(&self) -> Result<TaskResponse> {
        self.completion.wait().await
    }

    /// Waits for the terminal response for at most `timeout`.
    ///
    /// Timing out leaves the task running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] when the wait elapses.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<TaskResponse> {
        match tokio::time::timeout(timeout, self.completion.wait()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                task_id: self.id,
                timeout,
            }),
        }
    }
}

/// Builder for [`TaskCoordinator`].
///
/// Every backend defaults to its in-memory implementation.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use taskrelay::broker::InMemoryBroker;
/// use taskrelay::{CoordinatorConfig, TaskCoordinator};
///
/// let broker = Arc::new(InMemoryBroker::new());
/// let coordinator = TaskCoordinator::builder()
///     .config(CoordinatorConfig::default())
///     .broker(broker)
///     .instance_id("api-1")
///     .build()
///     .unwrap();
/// assert_eq!(coordinator.instance_id(), "api-1");
/// ```
#[derive(Default)]
pub struct TaskCoordinatorBuilder {
    config: CoordinatorConfig,
    broker: Option<Arc<dyn Broker>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    lock: Option<Arc<dyn DistributedLock>>,
    instance_id: Option<String>,
    handlers: Vec<Arc<dyn ResponseHandler>>,
}

impl std::fmt::Debug for TaskCoordinatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCoordinatorBuilder")
            .field("config", &self.config)
            .field("instance_id", &self.instance_id)
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl TaskCoordinatorBuilder {
    /// Sets the configuration.
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the message broker.
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Sets the shared cache backend.
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    /// Sets the distributed lock.
    pub fn lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Sets the instance id, overriding the configuration.
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Registers a response handler.
    pub fn handler(mut self, handler: Arc<dyn ResponseHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Builds the coordinator. Nothing is consumed until
    /// [`TaskCoordinator::start`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn build(self) -> Result<TaskCoordinator> {
        self.config.validate()?;

        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(InMemoryBroker::new()));
        let backend = self
            .cache_backend
            .unwrap_or_else(|| Arc::new(InMemoryCacheBackend::new()));
        let lock = self.lock.unwrap_or_else(|| Arc::new(InMemoryLock::new()));
        let instance_id = self
            .instance_id
            .or_else(|| self.config.instance_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let cache = ResultCache::new(backend, lock)
            .with_settings(self.config.cache_settings())
            .with_lock_options(self.config.lock_options());
        let topology = TopologyManager::new(broker, self.config.topology());

        let handlers = Arc::new(HandlerRegistry::new());
        for handler in self.handlers {
            handlers.register(handler);
        }
        let waiters = Arc::new(WaiterRegistry::new());
        let pipeline = ResponsePipeline::new(
            cache.clone(),
            topology.clone(),
            handlers.clone(),
            waiters.clone(),
        );

        Ok(TaskCoordinator {
            instance_id,
            config: self.config,
            cache,
            topology,
            handlers,
            waiters,
            pipeline,
            stats: DispatchStats::default(),
            shutdown: Mutex::new(CancellationToken::new()),
            consumers: tokio::sync::Mutex::new(Vec::new()),
        })
    }
}

/// One coordinator instance.
///
/// Instances sharing a broker, cache backend and lock form a cluster:
/// duplicates are coalesced across all of them and every instance sees every
/// completion.
#[derive(Debug)]
pub struct TaskCoordinator {
    instance_id: String,
    config: CoordinatorConfig,
    cache: ResultCache,
    topology: TopologyManager,
    handlers: Arc<HandlerRegistry>,
    waiters: Arc<WaiterRegistry>,
    pipeline: ResponsePipeline,
    stats: DispatchStats,
    shutdown: Mutex<CancellationToken>,
    consumers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskCoordinator {
    /// Starts building a coordinator.
    pub fn builder() -> TaskCoordinatorBuilder {
        TaskCoordinatorBuilder::default()
    }

    /// Declares the shared topology and this instance's broadcast queue,
    /// then spawns the result and broadcast consumers and the cleanup sweep
    /// (see [`cleanup_expired`](Self::cleanup_expired)). Calling it again
    /// while running does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Broker`] if a declaration or subscription fails.
    pub async fn start(&self) -> Result<()> {
        let mut consumers = self.consumers.lock().await;
        if !consumers.is_empty() {
            return Ok(());
        }

        self.topology.declare_shared().await?;
        let instance_queue = self
            .topology
            .declare_instance_queue(&self.instance_id)
            .await?;
        let broker = self.topology.broker();
        let results = broker
            .consume(&self.topology.topology().shared_results_queue)
            .await?;
        let broadcasts = broker.consume(&instance_queue).await?;

        let token = self.shutdown.lock().clone();
        consumers.push(tokio::spawn(self.pipeline.clone().run_result_consumer(
            results,
            token.clone(),
            self.config.consumer_concurrency,
        )));
        consumers.push(tokio::spawn(
            self.pipeline
                .clone()
                .run_broadcast_consumer(broadcasts, token.clone()),
        ));
        consumers.push(tokio::spawn(run_cleanup_loop(
            self.cache.clone(),
            self.waiters.clone(),
            self.config.cleanup_interval(),
            token,
        )));

        tracing::info!(
            instance_id = %self.instance_id,
            queue = %instance_queue,
            "task coordinator started"
        );
        Ok(())
    }

    /// Stops the background tasks and waits for them to finish. The coordinator
    /// can be started again afterwards.
    pub async fn shutdown(&self) {
        let mut consumers = self.consumers.lock().await;
        let token = std::mem::replace(&mut *self.shutdown.lock(), CancellationToken::new());
        token.cancel();
        for handle in consumers.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(instance_id = %self.instance_id, error = %e, "consumer task failed");
            }
        }
        self.stats.snapshot().log();
        tracing::info!(instance_id = %self.instance_id, "task coordinator stopped");
    }

    /// Dispatches `request`, or attaches to an identical task that is still
    /// running or already succeeded.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] if `type` or `script` is missing.
    /// - [`Error::Lock`] if the cluster lock could not be acquired.
    /// - [`Error::Cache`] or [`Error::Broker`] on infrastructure failures;
    ///   a failed publish is rolled back first.
    pub async fn dispatch(&self, request: TaskRequest) -> Result<TaskFuture> {
        request.validate()?;
        let envelope = TaskEnvelope::new(request);
        let fingerprint = Fingerprint::of(&envelope.request)?;

        self.cache
            .with_lock(|| self.dispatch_locked(&envelope, &fingerprint))
            .await
    }

    async fn dispatch_locked(
        &self,
        envelope: &TaskEnvelope,
        fingerprint: &Fingerprint,
    ) -> Result<TaskFuture> {
        let mut redispatch = false;

        if let Some(existing) = self.cache.claim_fingerprint(fingerprint, envelope.id).await? {
            match self.cache.response(existing).await? {
                Some(cached) if !cached.status.requires_redispatch() => {
                    self.stats.record_coalesced();
                    tracing::debug!(
                        task_id = %existing,
                        fingerprint = %fingerprint,
                        status = %cached.status,
                        "coalesced duplicate request"
                    );
                    let completion = if cached.status.is_terminal() {
                        CompletionPromise::resolved(cached.clone())
                    } else {
                        self.waiters.register_promise(existing)
                    };
                    return Ok(TaskFuture {
                        id: existing,
                        latest: cached,
                        completion,
                        coalesced: true,
                    });
                },
                cached => {
                    tracing::info!(
                        previous = %existing,
                        task_id = %envelope.id,
                        fingerprint = %fingerprint,
                        status = ?cached.map(|c| c.status),
                        "redispatching request"
                    );
                    self.cache.bind_fingerprint(fingerprint, envelope.id).await?;
                    redispatch = true;
                },
            }
        }

        match self.publish_fresh(envelope).await {
            Ok(future) => {
                self.stats.record_dispatched();
                if redispatch {
                    self.stats.record_redispatched();
                }
                Ok(future)
            },
            Err(e) => {
                tracing::warn!(
                    task_id = %envelope.id,
                    script = %envelope.request.script,
                    error = %e,
                    "dispatch failed, rolling back"
                );
                self.rollback(envelope.id, fingerprint).await;
                self.stats.record_rolled_back();
                Err(e)
            },
        }
    }

    async fn publish_fresh(&self, envelope: &TaskEnvelope) -> Result<TaskFuture> {
        let completion = self.waiters.register_promise(envelope.id);
        let latest = TaskResponse::queued(envelope);
        self.cache.record_response(&latest).await?;

        self.topology.ensure_shared().await?;
        let queue = self
            .topology
            .ensure_request_queue(&envelope.request.task_type)
            .await?;
        self.topology.declare_cancellation_queue(envelope.id).await?;
        self.topology.publish_request(envelope).await?;

        tracing::info!(
            task_id = %envelope.id,
            script = %envelope.request.script,
            queue = %queue,
            "dispatched task"
        );
        Ok(TaskFuture {
            id: envelope.id,
            latest,
            completion,
            coalesced: false,
        })
    }

    async fn rollback(&self, task_id: TaskId, fingerprint: &Fingerprint) {
        self.waiters.discard_promise(task_id);
        if let Err(e) = self.topology.delete_cancellation_queue(task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to delete cancellation queue");
        }
        if let Err(e) = self.cache.release_fingerprint(fingerprint, task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to release fingerprint");
        }
        if let Err(e) = self.cache.forget_response(task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to remove cached response");
        }
    }

    /// Dispatches `request` and waits up to `timeout` for it to finish.
    ///
    /// A cached `SUCCESS` for an identical request is returned at once.
    /// On timeout the task keeps running and its result lands in the cache.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no terminal response arrived in time.
    /// - [`Error::Failed`] or [`Error::Cancelled`] for those outcomes.
    /// - Any error from [`dispatch`](Self::dispatch).
    pub async fn run_sync(&self, request: TaskRequest, timeout: Duration) -> Result<TaskResponse> {
        let future = self.dispatch(request).await?;
        if future.latest.status == TaskStatus::Success {
            self.stats.record_sync_fast_path();
            return Ok(future.latest);
        }

        let response = future.wait_timeout(timeout).await?;
        match response.status {
            TaskStatus::Cancelled => Err(Error::Cancelled {
                task_id: response.id,
            }),
            TaskStatus::Failed => Err(Error::Failed {
                task_id: response.id,
                message: response.output_text(),
            }),
            _ => Ok(response),
        }
    }

    /// [`run_sync`](Self::run_sync) with the configured default timeout.
    ///
    /// # Errors
    ///
    /// Same as [`run_sync`](Self::run_sync).
    pub async fn run_sync_default(&self, request: TaskRequest) -> Result<TaskResponse> {
        self.run_sync(request, self.config.run_sync_timeout()).await
    }

    /// Opens a status event stream for `task_id` on this instance.
    ///
    /// If the task already finished, the terminal response is delivered
    /// right away and the stream ends after it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the cache lookup fails.
    pub async fn subscribe(&self, task_id: TaskId) -> Result<TaskEventStream> {
        let stream = self.waiters.register_connection(task_id);
        if let Some(cached) = self.cache.response(task_id).await? {
            if cached.status.is_terminal() {
                self.waiters.push(&cached);
            }
        }
        Ok(stream)
    }

    /// Asks the worker running `task_id` to cancel. Advisory: returns once
    /// the message is published.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Broker`] if publishing fails.
    pub async fn cancel(&self, task_id: TaskId) -> Result<()> {
        let routed = self.topology.publish_cancellation(task_id).await?;
        if routed == 0 {
            tracing::debug!(task_id = %task_id, "no cancellation queue for task");
        } else {
            tracing::info!(task_id = %task_id, "requested cancellation");
        }
        Ok(())
    }

    /// The latest cached response for `task_id`. Does not take the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the lookup fails.
    pub async fn latest_response(&self, task_id: TaskId) -> Result<Option<TaskResponse>> {
        Ok(self.cache.response(task_id).await?)
    }

    /// Registers a response handler, replacing any for the same script.
    pub fn register_handler(&self, handler: Arc<dyn ResponseHandler>) {
        self.handlers.register(handler);
    }

    /// Sweeps expired cache entries and settles local waiters whose task
    /// left the cache or already finished. Runs periodically once started.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cache`] if the expiry sweep fails, or
    /// [`Error::Lock`] if the cluster lock could not be acquired.
    pub async fn cleanup_expired(&self) -> Result<CleanupReport> {
        cleanup(&self.cache, &self.waiters).await
    }

    /// Dispatch counters.
    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// This instance's id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Effective configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The broker topology.
    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    /// The ingestion pipeline.
    pub fn pipeline(&self) -> &ResponsePipeline {
        &self.pipeline
    }

    /// Local promises and connections.
    pub fn waiters(&self) -> &Arc<WaiterRegistry> {
        &self.waiters
    }
}

/// What one cleanup sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Cache entries removed by the expiry sweep.
    pub expired_entries: usize,
    /// Tasks whose local waiters were closed because the task left the cache.
    pub evicted_tasks: usize,
    /// Tasks whose local waiters were resolved from a cached terminal response.
    pub resolved_tasks: usize,
}

async fn cleanup(cache: &ResultCache, waiters: &WaiterRegistry) -> Result<CleanupReport> {
    let mut report = CleanupReport {
        expired_entries: cache.cleanup_expired().await?,
        ..CleanupReport::default()
    };
    let tracked = waiters.tracked_tasks();
    if tracked.is_empty() {
        return Ok(report);
    }

    // Dispatch registers promises under the same lock.
    cache
        .with_lock(|| async {
            for task_id in tracked {
                match cache.response(task_id).await {
                    Ok(None) => {
                        if waiters.forget(task_id) {
                            tracing::debug!(task_id = %task_id, "closed waiters of evicted task");
                            report.evicted_tasks += 1;
                        }
                    },
                    Ok(Some(cached)) if cached.status.is_terminal() => {
                        let resolved = waiters.resolve(&cached);
                        let pushed = waiters.push(&cached);
                        if resolved || pushed > 0 {
                            tracing::debug!(
                                task_id = %task_id,
                                status = %cached.status,
                                "resolved waiters from cache"
                            );
                            report.resolved_tasks += 1;
                        }
                    },
                    Ok(Some(_)) => {},
                    Err(e) => {
                        tracing::warn!(
                            task_id = %task_id,
                            error = %e,
                            "keeping waiters after cache error"
                        );
                    },
                }
            }
            Ok(())
        })
        .await?;

    if report.evicted_tasks > 0 || report.resolved_tasks > 0 {
        tracing::info!(
            evicted = report.evicted_tasks,
            resolved = report.resolved_tasks,
            "settled orphaned waiters"
        );
    }
    Ok(report)
}

async fn run_cleanup_loop(
    cache: ResultCache,
    waiters: Arc<WaiterRegistry>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = cleanup(&cache, &waiters).await {
                    tracing::warn!(error = %e, "cleanup sweep failed");
                }
            },
        }
    }
    tracing::debug!("cleanup loop stopped");
}

impl Drop for TaskCoordinator {
    fn drop(&mut self) {
        self.shutdown.lock().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, Deliveries, ExchangeSpec, QueueSpec};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    /// Fails every publish to the default exchange (request publishes).
    struct RejectingRequests(InMemoryBroker);

    #[async_trait]
    impl Broker for RejectingRequests {
        async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
            self.0.declare_exchange(spec).await
        }

        async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
            self.0.declare_queue(spec).await
        }

        async fn bind_queue(&self, q: &str, x: &str, key: &str) -> Result<(), BrokerError> {
            self.0.bind_queue(q, x, key).await
        }

        async fn delete_queue(&self, queue: &str) -> Result<bool, BrokerError> {
            self.0.delete_queue(queue).await
        }

        async fn publish(&self, x: &str, key: &str, payload: Bytes) -> Result<usize, BrokerError> {
            if x.is_empty() {
                return Err(BrokerError::Backend {
                    message: "connection reset".to_string(),
                    source: None,
                });
            }
            self.0.publish(x, key, payload).await
        }

        async fn consume(&self, queue: &str) -> Result<Deliveries, BrokerError> {
            self.0.consume(queue).await
        }
    }

    fn request() -> TaskRequest {
        TaskRequest::new("GOLLM", "model_card").with_input(&b"{\"doc\":1}"[..])
    }

    #[tokio::test]
    async fn invalid_request_is_rejected() {
        let coordinator = TaskCoordinator::builder().build().unwrap();
        let err = coordinator
            .dispatch(TaskRequest::new("GOLLM", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(coordinator.stats(), DispatchStatsSnapshot::default());
    }

    #[tokio::test]
    async fn dispatch_publishes_and_caches_queued() {
        let broker = InMemoryBroker::new();
        let coordinator = TaskCoordinator::builder()
            .broker(Arc::new(broker.clone()))
            .build()
            .unwrap();

        let future = coordinator.dispatch(request()).await.unwrap();
        assert!(!future.is_coalesced());
        assert_eq!(future.latest_response().status, TaskStatus::Queued);
        assert_eq!(broker.queue_depth("terarium.gollm.requests"), Some(1));
        assert!(broker.has_queue(&format!("terarium.cancellation.{}", future.id())));
        assert_eq!(
            coordinator.latest_response(future.id()).await.unwrap(),
            Some(future.latest_response().clone())
        );
        assert!(coordinator.waiters().has_promise(future.id()));
    }

    #[tokio::test]
    async fn identical_requests_coalesce() {
        let broker = InMemoryBroker::new();
        let coordinator = TaskCoordinator::builder()
            .broker(Arc::new(broker.clone()))
            .build()
            .unwrap();

        let first = coordinator.dispatch(request()).await.unwrap();
        let second = coordinator.dispatch(request()).await.unwrap();
        let other = coordinator
            .dispatch(request().with_owner("someone-else"))
            .await
            .unwrap();

        assert_eq!(second.id(), first.id());
        assert!(second.is_coalesced());
        assert_ne!(other.id(), first.id());
        assert_eq!(broker.queue_depth("terarium.gollm.requests"), Some(2));

        let stats = coordinator.stats();
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.coalesced, 1);
    }

    #[tokio::test]
    async fn failed_publish_rolls_back() {
        let inner = InMemoryBroker::new();
        let coordinator = TaskCoordinator::builder()
            .broker(Arc::new(RejectingRequests(inner.clone())))
            .build()
            .unwrap();

        let err = coordinator.dispatch(request()).await.unwrap_err();
        assert!(matches!(err, Error::Broker(BrokerError::Backend { .. })));
        assert!(err.is_retryable());
        assert_eq!(coordinator.waiters().pending_promises(), 0);
        assert_eq!(coordinator.stats().rolled_back, 1);

        let fingerprint = Fingerprint::of(&request()).unwrap();
        assert_eq!(coordinator.cache.fingerprint_owner(&fingerprint).await.unwrap(), None);
        assert_eq!(inner.queue_depth("terarium.gollm.requests"), Some(0));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_restartable() {
        let broker = InMemoryBroker::new();
        let coordinator = TaskCoordinator::builder()
            .broker(Arc::new(broker.clone()))
            .instance_id("i-1")
            .build()
            .unwrap();

        coordinator.start().await.unwrap();
        coordinator.start().await.unwrap();
        assert_eq!(broker.consumer_count("terarium.broadcast.i-1"), Some(1));
        assert_eq!(broker.consumer_count("terarium.results.shared"), Some(1));

        coordinator.shutdown().await;
        assert!(!broker.has_queue("terarium.broadcast.i-1"));
        assert_eq!(broker.consumer_count("terarium.results.shared"), Some(0));

        coordinator.start().await.unwrap();
        assert!(broker.has_queue("terarium.broadcast.i-1"));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_without_queue_is_noop() {
        let coordinator = TaskCoordinator::builder().build().unwrap();
        coordinator.start().await.unwrap();
        coordinator.cancel(TaskId::new()).await.unwrap();
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_fails_build() {
        let mut config = CoordinatorConfig::default();
        config.lock.wait_ms = 0;
        let err = TaskCoordinator::builder().config(config).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_reports_task() {
        let coordinator = TaskCoordinator::builder().build().unwrap();
        let future = coordinator.dispatch(request()).await.unwrap();
        let err = future
            .wait_timeout(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { task_id, .. } if task_id == future.id()));
        assert!(coordinator.waiters().has_promise(future.id()), "timeout does not clean up");
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_closes_waiters_of_expired_tasks() {
        let coordinator = TaskCoordinator::builder().build().unwrap();
        let future = coordinator.dispatch(request()).await.unwrap();
        assert_eq!(coordinator.cleanup_expired().await.unwrap(), CleanupReport::default());
        assert!(coordinator.waiters().has_promise(future.id()));

        let mut events = coordinator.subscribe(TaskId::new()).await.unwrap();

        tokio::time::advance(Duration::from_secs(3601)).await;
        let report = coordinator.cleanup_expired().await.unwrap();
        assert_eq!(report.evicted_tasks, 2);
        assert!(report.expired_entries >= 2);

        assert!(matches!(future.wait().await, Err(Error::Closed { task_id }) if task_id == future.id()));
        assert!(!coordinator.waiters().has_promise(future.id()));
        assert_eq!(events.next().await, None);
        assert!(coordinator.waiters().tracked_tasks().is_empty());
    }

    #[tokio::test]
    async fn cleanup_resolves_waiters_from_cached_result() {
        let coordinator = TaskCoordinator::builder().build().unwrap();
        let future = coordinator.dispatch(request()).await.unwrap();
        let done = future
            .latest_response()
            .clone()
            .with_status(TaskStatus::Success);
        coordinator.cache.record_response(&done).await.unwrap();

        let report = coordinator.cleanup_expired().await.unwrap();
        assert_eq!(report.resolved_tasks, 1);
        assert_eq!(report.evicted_tasks, 0);
        assert_eq!(future.wait().await.unwrap(), done);
        assert!(!coordinator.waiters().has_promise(future.id()));
    }
}
