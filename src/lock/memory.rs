//! In-process lock implementation.
//!
//! [`InMemoryLock`] keeps leases in a mutex-guarded map. It provides mutual
//! exclusion between coordinators that share the same instance inside one
//! process; it does not coordinate across processes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{DistributedLock, Lease, LockError};

#[derive(Debug)]
struct Held {
    token: String,
    expires_at: Instant,
}

/// In-memory [`DistributedLock`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskrelay::lock::{DistributedLock, InMemoryLock};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let lock = InMemoryLock::new();
/// let lease = lock.try_acquire("jobs", Duration::from_secs(5)).await.unwrap().unwrap();
/// assert!(lock.try_acquire("jobs", Duration::from_secs(5)).await.unwrap().is_none());
/// assert!(lock.release(&lease).await.unwrap());
/// # }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryLock {
    held: Mutex<HashMap<String, Held>>,
}

impl InMemoryLock {
    /// Creates a lock table with nothing held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `name` is currently held by a live lease.
    pub fn is_held(&self, name: &str) -> bool {
        let now = Instant::now();
        self.held
            .lock()
            .get(name)
            .is_some_and(|held| held.expires_at > now)
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, name: &str, lease: Duration) -> Result<Option<Lease>, LockError> {
        let now = Instant::now();
        let mut held = self.held.lock();

        if let Some(current) = held.get(name) {
            if current.expires_at > now {
                return Ok(None);
            }
            // Expired lease: fall through and take over.
        }

        let granted = Lease::new(name, lease);
        held.insert(
            name.to_string(),
            Held {
                token: granted.token.clone(),
                expires_at: now + lease,
            },
        );
        Ok(Some(granted))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut held = self.held.lock();

        let Some(current) = held.get(&lease.name) else {
            return Ok(false);
        };
        if current.token != lease.token {
            return Ok(false);
        }
        let live = current.expires_at > now;
        held.remove(&lease.name);
        Ok(live)
    }
}
