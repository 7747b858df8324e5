//! Named distributed lock with leases.
//!
//! Every coordinator instance serializes its fingerprint check-and-publish
//! and its promise resolution behind one named lock. A holder gets a
//! [`Lease`] that expires on its own after the lease time, so a crashed
//! holder cannot block the cluster forever.
//!
//! [`DistributedLock`] is the backend seam: a non-blocking
//! [`try_acquire`](DistributedLock::try_acquire) and a token-checked
//! [`release`](DistributedLock::release). Waiting with retries lives in
//! [`acquire`], shared by every backend.
//!
//! # Backends
//!
//! - [`InMemoryLock`]: single process, for tests and single-instance
//!   deployments.
//! - `RedisLock` (feature `redis`): `SET NX PX` with compare-and-delete
//!   release.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

pub use memory::InMemoryLock;
#[cfg(feature = "redis")]
pub use redis::RedisLock;

/// Errors raised while acquiring or releasing a lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock was held by someone else for the whole wait window.
    #[error("timed out after {waited:?} waiting for lock {name}")]
    Timeout {
        /// Lock name.
        name: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The lock backend failed.
    #[error("lock backend error: {message}")]
    Backend {
        /// Human-readable description.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Proof of holding a named lock.
///
/// The `token` is unique per acquisition; releasing with a stale token
/// (after the lease expired and someone else took the lock) is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Lock name.
    pub name: String,
    /// Unique acquisition token.
    pub token: String,
    /// Lease time granted at acquisition.
    pub lease: Duration,
    /// Local acquisition time, used to detect overrun holders.
    pub acquired_at: Instant,
}

impl Lease {
    /// Creates a lease acquired now with a fresh random token.
    pub fn new(name: impl Into<String>, lease: Duration) -> Self {
        Self {
            name: name.into(),
            token: uuid::Uuid::new_v4().to_string(),
            lease,
            acquired_at: Instant::now(),
        }
    }

    /// Returns `true` once the lease time has passed locally.
    ///
    /// A holder past its lease may no longer be exclusive.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.lease
    }
}

/// Backend for a named, leased, mutually exclusive lock.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Tries once to take `name` for `lease`.
    ///
    /// Returns `None` if another holder has a live lease.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] on backend failures.
    async fn try_acquire(&self, name: &str, lease: Duration) -> Result<Option<Lease>, LockError>;

    /// Releases `lease` if its token still owns the lock.
    ///
    /// Returns `false` if the lease had already expired or been taken over.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] on backend failures.
    async fn release(&self, lease: &Lease) -> Result<bool, LockError>;
}

/// How to acquire a lock: name, lease time, wait window and retry pacing.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskrelay::lock::LockOptions;
///
/// let options = LockOptions::new("terarium.lock")
///     .with_lease(Duration::from_secs(5))
///     .with_wait(Duration::from_secs(10));
/// assert_eq!(options.retry_interval, Duration::from_millis(25));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Lock name.
    pub name: String,
    /// Lease granted on acquisition.
    pub lease: Duration,
    /// Maximum time to wait before giving up.
    pub wait: Duration,
    /// Pause between attempts.
    pub retry_interval: Duration,
}

impl LockOptions {
    /// Options with a 10s lease, 30s wait and 25ms retry interval.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lease: Duration::from_secs(10),
            wait: Duration::from_secs(30),
            retry_interval: Duration::from_millis(25),
        }
    }

    /// Sets the lease time.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Sets the wait window.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Sets the pause between attempts.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }
}

/// Acquires the lock described by `options`, retrying until the wait
/// window closes.
///
/// # Errors
///
/// Returns [`LockError::Timeout`] if the lock stayed held for the whole
/// window, or any backend error from an attempt.
pub async fn acquire(lock: &dyn DistributedLock, options: &LockOptions) -> Result<Lease, LockError> {
    let started = Instant::now();
    loop {
        if let Some(lease) = lock.try_acquire(&options.name, options.lease).await? {
            return Ok(lease);
        }
        let waited = started.elapsed();
        if waited >= options.wait {
            return Err(LockError::Timeout {
                name: options.name.clone(),
                waited,
            });
        }
        let remaining = options.wait - waited;
        tokio::time::sleep(options.retry_interval.min(remaining)).await;
    }
}
