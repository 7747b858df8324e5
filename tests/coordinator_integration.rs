//! End-to-end tests for a cluster of coordinators.
//!
//! Every test wires one or more `TaskCoordinator`s to a shared in-memory
//! broker, cache backend and lock, and plays the worker side by hand:
//! consuming the request queue and publishing responses to the results
//! exchange.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;

use taskrelay::broker::{
    Broker, BrokerError, Deliveries, ExchangeSpec, InMemoryBroker, QueueSpec, Topology,
    TopologyManager,
};
use taskrelay::cache::InMemoryCacheBackend;
use taskrelay::lock::InMemoryLock;
use taskrelay::{
    CoordinatorConfig, Error, ResponseHandler, TaskCoordinator, TaskEnvelope, TaskRequest,
    TaskResponse, TaskStatus,
};

const REQUEST_QUEUE: &str = "terarium.gollm.requests";
const WAIT: Duration = Duration::from_secs(5);

/// Instances sharing one broker, cache backend and lock.
struct Cluster {
    broker: InMemoryBroker,
    instances: Vec<TaskCoordinator>,
}

impl Cluster {
    async fn start(size: usize) -> Self {
        Self::start_with(size, CoordinatorConfig::default(), Vec::new()).await
    }

    async fn start_with(
        size: usize,
        config: CoordinatorConfig,
        handlers: Vec<Arc<dyn ResponseHandler>>,
    ) -> Self {
        let broker = InMemoryBroker::new();
        let backend = Arc::new(InMemoryCacheBackend::new());
        let lock = Arc::new(InMemoryLock::new());

        let mut instances = Vec::with_capacity(size);
        for i in 0..size {
            let mut builder = TaskCoordinator::builder()
                .config(config.clone())
                .broker(Arc::new(broker.clone()))
                .cache_backend(backend.clone())
                .lock(lock.clone())
                .instance_id(format!("instance-{i}"));
            for handler in &handlers {
                builder = builder.handler(handler.clone());
            }
            let coordinator = builder.build().unwrap();
            coordinator.start().await.unwrap();
            instances.push(coordinator);
        }
        Self { broker, instances }
    }

    fn get(&self, i: usize) -> &TaskCoordinator {
        &self.instances[i]
    }

    async fn worker(&self) -> Worker {
        Worker::attach(&self.broker).await
    }

    async fn shutdown(self) {
        for instance in &self.instances {
            instance.shutdown().await;
        }
    }
}

/// Plays a task-runner worker for the `GOLLM` pool.
struct Worker {
    topology: TopologyManager,
    requests: Deliveries,
}

impl Worker {
    async fn attach(broker: &InMemoryBroker) -> Self {
        let topology = TopologyManager::new(Arc::new(broker.clone()), Topology::default());
        let queue = topology.ensure_request_queue("GOLLM").await.unwrap();
        let requests = broker.consume(&queue).await.unwrap();
        Self { topology, requests }
    }

    async fn next(&mut self) -> TaskEnvelope {
        let payload = tokio::time::timeout(WAIT, self.requests.next())
            .await
            .expect("no request published")
            .expect("request stream ended");
        serde_json::from_slice(&payload).unwrap()
    }

    async fn respond(&self, envelope: &TaskEnvelope, status: TaskStatus, output: &'static str) {
        let response = TaskResponse::queued(envelope)
            .with_status(status)
            .with_output(Bytes::from_static(output.as_bytes()));
        self.topology.publish_result(&response).await.unwrap();
    }
}

fn model_card() -> TaskRequest {
    TaskRequest::new("GOLLM", "model_card").with_input(&b"{\"document\":\"X\"}"[..])
}

/// Polls the cache until `task_id` reaches `status`.
async fn await_cached(coordinator: &TaskCoordinator, task_id: taskrelay::TaskId, status: TaskStatus) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(cached) = coordinator.latest_response(task_id).await.unwrap() {
                if cached.status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cache never reached expected status");
}

mod coalescing {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn identical_requests_on_two_instances_share_one_task() {
        let cluster = Cluster::start(2).await;
        let mut worker = cluster.worker().await;

        let worker_side = async {
            let envelope = worker.next().await;
            worker.respond(&envelope, TaskStatus::Success, "Y").await;
            envelope
        };
        let (first, second, envelope) = tokio::join!(
            cluster.get(0).run_sync(model_card(), WAIT),
            cluster.get(1).run_sync(model_card(), WAIT),
            worker_side,
        );

        let first = first.unwrap();
        let second = second.unwrap();
        assert_eq!(first.id, envelope.id);
        assert_eq!(second.id, envelope.id);
        assert_eq!(first.output_text(), "Y");
        assert_eq!(second.output_text(), "Y");
        assert_eq!(cluster.broker.queue_depth(REQUEST_QUEUE), Some(0));

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn different_owner_is_a_different_task() {
        let cluster = Cluster::start(1).await;

        let first = cluster.get(0).dispatch(model_card()).await.unwrap();
        let second = cluster
            .get(0)
            .dispatch(model_card().with_owner("user-2"))
            .await
            .unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(cluster.broker.queue_depth(REQUEST_QUEUE), Some(2));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn cached_success_is_served_without_publishing() {
        let cluster = Cluster::start(2).await;
        let mut worker = cluster.worker().await;

        let future = cluster.get(0).dispatch(model_card()).await.unwrap();
        let envelope = worker.next().await;
        worker.respond(&envelope, TaskStatus::Success, "Y").await;
        tokio::time::timeout(WAIT, future.wait()).await.unwrap().unwrap();
        await_cached(cluster.get(1), future.id(), TaskStatus::Success).await;

        let published = cluster.broker.published_count();
        let response = cluster.get(1).run_sync(model_card(), WAIT).await.unwrap();

        assert_eq!(response.id, future.id());
        assert_eq!(response.output_text(), "Y");
        assert_eq!(cluster.broker.published_count(), published);
        assert_eq!(cluster.get(1).stats().sync_fast_path, 1);
        assert_eq!(cluster.get(1).stats().coalesced, 1);
        cluster.shutdown().await;
    }
}

mod redispatch {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn failed_result_is_not_reused() {
        let cluster = Cluster::start(1).await;
        let coordinator = cluster.get(0);
        let mut worker = cluster.worker().await;

        let (outcome, envelope) = tokio::join!(coordinator.run_sync(model_card(), WAIT), async {
            let envelope = worker.next().await;
            worker.respond(&envelope, TaskStatus::Failed, "model unavailable").await;
            envelope
        });
        match outcome {
            Err(Error::Failed { task_id, message }) => {
                assert_eq!(task_id, envelope.id);
                assert_eq!(message, "model unavailable");
            },
            other => panic!("expected failure, got {other:?}"),
        }

        let retry = coordinator.dispatch(model_card()).await.unwrap();
        assert_ne!(retry.id(), envelope.id);
        assert!(!retry.is_coalesced());
        assert_eq!(worker.next().await.id, retry.id());
        assert_eq!(coordinator.stats().redispatched, 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_result_is_not_reused() {
        let cluster = Cluster::start(1).await;
        let coordinator = cluster.get(0);
        let mut worker = cluster.worker().await;

        let (outcome, envelope) = tokio::join!(coordinator.run_sync(model_card(), WAIT), async {
            let envelope = worker.next().await;
            worker.respond(&envelope, TaskStatus::Cancelled, "").await;
            envelope
        });
        assert!(matches!(outcome, Err(Error::Cancelled { task_id }) if task_id == envelope.id));

        let retry = coordinator.dispatch(model_card()).await.unwrap();
        assert_ne!(retry.id(), envelope.id);
        cluster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn expired_result_gets_a_new_task() {
        let cluster = Cluster::start(1).await;
        let coordinator = cluster.get(0);
        let mut worker = cluster.worker().await;

        let first = coordinator.dispatch(model_card()).await.unwrap();
        let envelope = worker.next().await;
        worker.respond(&envelope, TaskStatus::Success, "Y").await;
        first.wait().await.unwrap();

        let again = coordinator.dispatch(model_card()).await.unwrap();
        assert_eq!(again.id(), first.id());

        tokio::time::advance(Duration::from_secs(3601)).await;

        let later = coordinator.dispatch(model_card()).await.unwrap();
        assert_ne!(later.id(), first.id());
        assert!(!later.is_coalesced());
        assert_eq!(worker.next().await.id, later.id());
        cluster.shutdown().await;
    }
}

mod cancellation {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Records the order of queue declarations and publishes.
    struct RecordingBroker {
        inner: InMemoryBroker,
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Broker for RecordingBroker {
        async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
            self.inner.declare_exchange(spec).await
        }

        async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
            self.log.lock().push(format!("declare {}", spec.name));
            self.inner.declare_queue(spec).await
        }

        async fn bind_queue(&self, q: &str, x: &str, key: &str) -> Result<(), BrokerError> {
            self.inner.bind_queue(q, x, key).await
        }

        async fn delete_queue(&self, queue: &str) -> Result<bool, BrokerError> {
            self.inner.delete_queue(queue).await
        }

        async fn publish(&self, x: &str, key: &str, payload: Bytes) -> Result<usize, BrokerError> {
            self.log.lock().push(format!("publish {x}/{key}"));
            self.inner.publish(x, key, payload).await
        }

        async fn consume(&self, queue: &str) -> Result<Deliveries, BrokerError> {
            self.inner.consume(queue).await
        }
    }

    #[tokio::test]
    async fn cancellation_queue_is_declared_before_publish() {
        let broker = Arc::new(RecordingBroker {
            inner: InMemoryBroker::new(),
            log: Mutex::new(Vec::new()),
        });
        let coordinator = TaskCoordinator::builder()
            .broker(broker.clone())
            .build()
            .unwrap();

        let future = coordinator.dispatch(model_card()).await.unwrap();

        let log = broker.log.lock().clone();
        let declared = log
            .iter()
            .position(|e| *e == format!("declare terarium.cancellation.{}", future.id()))
            .expect("cancellation queue declared");
        let published = log
            .iter()
            .position(|e| *e == format!("publish /{REQUEST_QUEUE}"))
            .expect("request published");
        assert!(declared < published, "{log:?}");
    }

    #[tokio::test]
    async fn cancel_before_pickup_is_retained() {
        let cluster = Cluster::start(1).await;
        let coordinator = cluster.get(0);

        let future = coordinator.dispatch(model_card()).await.unwrap();
        coordinator.cancel(future.id()).await.unwrap();

        // The worker only now picks the request up and checks for a cancel.
        let mut worker = cluster.worker().await;
        let envelope = worker.next().await;
        let queue = Topology::default().cancellation_queue(envelope.id);
        assert_eq!(cluster.broker.queue_depth(&queue), Some(1));

        let mut cancellations = cluster.broker.consume(&queue).await.unwrap();
        let message = tokio::time::timeout(WAIT, cancellations.next()).await.unwrap();
        assert_eq!(message, Some(Bytes::new()));
        cluster.shutdown().await;
    }
}

mod delivery {
    use super::*;
    use pretty_assertions::assert_eq;

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ResponseHandler for CountingHandler {
        fn script(&self) -> &str {
            "model_card"
        }

        async fn on_success(&self, response: &mut TaskResponse) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            response.output = Bytes::from(format!("card:{}", response.output_text()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_runs_once_across_the_cluster() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler: Arc<dyn ResponseHandler> = Arc::new(CountingHandler {
            calls: calls.clone(),
        });
        let cluster = Cluster::start_with(3, CoordinatorConfig::default(), vec![handler]).await;
        let mut worker = cluster.worker().await;

        let futures = [
            cluster.get(0).dispatch(model_card()).await.unwrap(),
            cluster.get(1).dispatch(model_card()).await.unwrap(),
            cluster.get(2).dispatch(model_card()).await.unwrap(),
        ];
        let envelope = worker.next().await;
        worker.respond(&envelope, TaskStatus::Success, "Y").await;

        for future in &futures {
            let response = tokio::time::timeout(WAIT, future.wait()).await.unwrap().unwrap();
            assert_eq!(response.output_text(), "card:Y");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn subscriber_on_another_instance_sees_every_status() {
        let cluster = Cluster::start(2).await;
        let mut worker = cluster.worker().await;

        let future = cluster.get(0).dispatch(model_card()).await.unwrap();
        let mut events = cluster.get(1).subscribe(future.id()).await.unwrap();
        let envelope = worker.next().await;

        worker.respond(&envelope, TaskStatus::Running, "").await;
        let running = tokio::time::timeout(WAIT, events.next()).await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Running);

        worker.respond(&envelope, TaskStatus::Success, "Y").await;
        let done = tokio::time::timeout(WAIT, events.next()).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.output_text(), "Y");

        assert!(events.next().await.is_none());
        assert_eq!(cluster.get(1).waiters().connection_count(future.id()), 0);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_terminal_delivery_is_harmless() {
        let cluster = Cluster::start(2).await;
        let mut worker = cluster.worker().await;

        let future = cluster.get(0).dispatch(model_card()).await.unwrap();
        let envelope = worker.next().await;
        worker.respond(&envelope, TaskStatus::Success, "Y").await;
        worker.respond(&envelope, TaskStatus::Success, "Y").await;

        let response = tokio::time::timeout(WAIT, future.wait()).await.unwrap().unwrap();
        assert_eq!(response.status, TaskStatus::Success);
        assert!(!cluster.get(0).waiters().has_promise(future.id()));

        let replay = serde_json::to_vec(&response).unwrap();
        let outcome = cluster.get(0).pipeline().handle_broadcast(&replay).await;
        assert_eq!(
            outcome,
            taskrelay::ingest::BroadcastOutcome::Delivered {
                resolved: false,
                pushed: 0
            }
        );
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn late_running_does_not_regress_cache() {
        let cluster = Cluster::start(1).await;
        let mut worker = cluster.worker().await;

        let future = cluster.get(0).dispatch(model_card()).await.unwrap();
        let envelope = worker.next().await;
        worker.respond(&envelope, TaskStatus::Success, "Y").await;
        tokio::time::timeout(WAIT, future.wait()).await.unwrap().unwrap();
        worker.respond(&envelope, TaskStatus::Running, "").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let cached = cluster.get(0).latest_response(future.id()).await.unwrap().unwrap();
        assert_eq!(cached.status, TaskStatus::Success);
        cluster.shutdown().await;
    }
}

mod timeouts {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn timed_out_wait_does_not_hide_the_result() {
        let cluster = Cluster::start(1).await;
        let coordinator = cluster.get(0);
        let mut worker = cluster.worker().await;

        let slow_worker = async {
            let envelope = worker.next().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            worker.respond(&envelope, TaskStatus::Success, "Y").await;
            envelope
        };
        let (outcome, envelope) = tokio::join!(
            coordinator.run_sync(model_card(), Duration::from_secs(1)),
            slow_worker,
        );
        assert!(matches!(outcome, Err(Error::Timeout { task_id, .. }) if task_id == envelope.id));

        await_cached(coordinator, envelope.id, TaskStatus::Success).await;

        let events = coordinator.subscribe(envelope.id).await.unwrap();
        let delivered: Vec<TaskResponse> = events.collect().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].output_text(), "Y");
        cluster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn default_timeout_comes_from_config() {
        let config = CoordinatorConfig {
            run_sync_timeout_ms: 250,
            ..CoordinatorConfig::default()
        };
        let cluster = Cluster::start_with(1, config, Vec::new()).await;

        let err = cluster
            .get(0)
            .run_sync_default(model_card())
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Timeout { timeout, .. } if timeout == Duration::from_millis(250))
        );
        cluster.shutdown().await;
    }
}
