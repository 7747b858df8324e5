//! Distributed task-execution coordinator.
//!
//! `taskrelay` dispatches long-running work to an external pool of task-runner
//! workers over a message broker, coalesces identical concurrent requests into
//! one in-flight task, caches terminal results across a fleet of stateless
//! instances, and delivers completion events to whichever instance holds the
//! caller's promise or live event stream.
//!
//! # Overview
//!
//! ```text
//! caller ─► TaskCoordinator::dispatch ─► broker ─► worker
//!                                                    │
//!   every instance ◄─ broadcast ◄─ single winner ◄───┘
//!   (promises, streams)            (handler, cache write)
//! ```
//!
//! A dispatched task is identified by a [`TaskId`] the coordinator assigns.
//! Its status moves from `QUEUED`/`RUNNING` to one of the terminal states
//! `SUCCESS`, `FAILED` or `CANCELLED`.
//!
//! # Module Organization
//!
//! - [`types`] - Request, response and status wire types
//! - [`fingerprint`] - Deterministic content hash used for coalescing
//! - [`cache`] - Shared TTL'd result cache and its backends
//! - [`lock`] - Lease-bounded distributed mutual exclusion
//! - [`broker`] - Broker abstraction and queue/exchange topology
//! - [`registry`] - Per-instance promises and live event streams
//! - [`handler`] - Per-script response handlers
//! - [`ingest`] - Single-winner and broadcast consumers
//! - [`coordinator`] - `dispatch`, `run_sync`, `subscribe`, `cancel`
//! - [`config`] - TOML/environment configuration
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use taskrelay::{TaskCoordinator, TaskRequest};
//!
//! # async fn example() -> taskrelay::Result<()> {
//! let coordinator = TaskCoordinator::builder().build()?;
//! coordinator.start().await?;
//!
//! let request = TaskRequest::new("GOLLM", "model_card").with_input(&b"{}"[..]);
//! let response = coordinator
//!     .run_sync(request, Duration::from_secs(30))
//!     .await?;
//! println!("{}", response.output_text());
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod handler;
pub mod ingest;
pub mod lock;
#[cfg(feature = "logging")]
pub mod logging;
pub mod registry;
pub mod stats;
pub mod types;

// Re-exports for ergonomic access
pub use config::CoordinatorConfig;
pub use coordinator::{CleanupReport, TaskCoordinator, TaskCoordinatorBuilder, TaskFuture};
pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use handler::{HandlerRegistry, ResponseHandler};
pub use registry::{CompletionPromise, TaskEventStream};
pub use types::*;
