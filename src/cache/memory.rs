//! In-memory cache backend.
//!
//! [`InMemoryCacheBackend`] stores entries in a [`DashMap`] and enforces
//! expiry lazily on access, plus eagerly through
//! [`cleanup_expired`](CacheBackend::cleanup_expired). Time is read from
//! [`tokio::time::Instant`], so tests can drive expiry with a paused clock.
//!
//! Sharing one `Arc<InMemoryCacheBackend>` between several coordinators in
//! the same process gives them a common cache, which is how the integration
//! tests simulate multiple instances.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::backend::{CacheBackend, CacheError, ExpiryPolicy};

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Bytes,
    expires_at: Instant,
    max_idle: Option<Duration>,
    idle_deadline: Option<Instant>,
}

impl CacheEntry {
    fn new(data: &[u8], policy: ExpiryPolicy, now: Instant) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
            expires_at: now + policy.ttl,
            max_idle: policy.max_idle,
            idle_deadline: policy.max_idle.map(|idle| now + idle),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at && self.idle_deadline.map_or(true, |deadline| now < deadline)
    }

    fn touch(&mut self, now: Instant) {
        if let Some(idle) = self.max_idle {
            self.idle_deadline = Some(now + idle);
        }
    }
}

/// Thread-safe in-memory [`CacheBackend`] built on [`DashMap`].
///
/// # Examples
///
/// ```
/// use taskrelay::cache::InMemoryCacheBackend;
///
/// let backend = InMemoryCacheBackend::new();
/// assert!(backend.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    data: DashMap<String, CacheEntry>,
}

impl InMemoryCacheBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let now = Instant::now();
        if let Some(mut entry) = self.data.get_mut(key) {
            if entry.is_live(now) {
                entry.touch(now);
                return Ok(Some(entry.data.clone()));
            }
        }
        self.data.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    async fn put(&self, key: &str, data: &[u8], policy: ExpiryPolicy) -> Result<(), CacheError> {
        let now = Instant::now();
        self.data
            .insert(key.to_string(), CacheEntry::new(data, policy, now));
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        data: &[u8],
        policy: ExpiryPolicy,
    ) -> Result<Option<Bytes>, CacheError> {
        let now = Instant::now();
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    let entry = occupied.get_mut();
                    entry.touch(now);
                    return Ok(Some(entry.data.clone()));
                }
                occupied.insert(CacheEntry::new(data, policy, now));
                Ok(None)
            },
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(data, policy, now));
                Ok(None)
            },
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn cleanup_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let mut removed = 0;
        self.data.retain(|_, entry| {
            let live = entry.is_live(now);
            if !live {
                removed += 1;
            }
            live
        });
        Ok(removed)
    }
}
