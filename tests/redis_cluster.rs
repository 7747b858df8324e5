//! Two coordinators sharing a Redis cache and lock.
//!
//! Requires a running Redis (default `redis://127.0.0.1:6379`, override with
//! `REDIS_URL`). Run with:
//!
//! ```bash
//! cargo test --features redis-tests --test redis_cluster
//! ```

#![cfg(feature = "redis-tests")]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use pretty_assertions::assert_eq;

use taskrelay::broker::{Broker, InMemoryBroker, Topology, TopologyManager};
use taskrelay::cache::RedisCacheBackend;
use taskrelay::lock::RedisLock;
use taskrelay::{TaskCoordinator, TaskEnvelope, TaskRequest, TaskResponse, TaskStatus};

const WAIT: Duration = Duration::from_secs(10);

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn instance(broker: &InMemoryBroker, prefix: &str, id: &str) -> TaskCoordinator {
    let backend = RedisCacheBackend::new(&redis_url())
        .await
        .expect("Redis connection failed -- is Redis running?")
        .with_prefix(prefix);
    let lock = RedisLock::new(&redis_url())
        .await
        .expect("Redis connection failed -- is Redis running?")
        .with_prefix(prefix);

    let coordinator = TaskCoordinator::builder()
        .broker(Arc::new(broker.clone()))
        .cache_backend(Arc::new(backend))
        .lock(Arc::new(lock))
        .instance_id(id)
        .build()
        .unwrap();
    coordinator.start().await.unwrap();
    coordinator
}

#[tokio::test]
async fn redis_duplicates_coalesce_across_instances() {
    let prefix = format!("test-{}", uuid::Uuid::new_v4());
    let broker = InMemoryBroker::new();
    let a = instance(&broker, &prefix, "a").await;
    let b = instance(&broker, &prefix, "b").await;

    let topology = TopologyManager::new(Arc::new(broker.clone()), Topology::default());
    let queue = topology.ensure_request_queue("GOLLM").await.unwrap();
    let mut requests = broker.consume(&queue).await.unwrap();

    let request = TaskRequest::new("GOLLM", "model_card").with_input(&b"X"[..]);
    let first = a.dispatch(request.clone()).await.unwrap();
    let second = b.dispatch(request.clone()).await.unwrap();
    assert_eq!(first.id(), second.id());
    assert!(second.is_coalesced());

    let payload = tokio::time::timeout(WAIT, requests.next())
        .await
        .unwrap()
        .unwrap();
    let envelope: TaskEnvelope = serde_json::from_slice(&payload).unwrap();
    let done = TaskResponse::queued(&envelope)
        .with_status(TaskStatus::Success)
        .with_output(Bytes::from_static(b"Y"));
    topology.publish_result(&done).await.unwrap();

    for future in [&first, &second] {
        let response = tokio::time::timeout(WAIT, future.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.output_text(), "Y");
    }

    let cached = b.run_sync(request, WAIT).await.unwrap();
    assert_eq!(cached.id, first.id());
    assert_eq!(broker.queue_depth(&queue), Some(0));

    a.shutdown().await;
    b.shutdown().await;
}
