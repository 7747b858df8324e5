//! Result cache: fingerprint bindings and latest responses on top of a
//! [`CacheBackend`], guarded by a [`DistributedLock`].
//!
//! Two kinds of entries live in the backend:
//!
//! | Key | Value |
//! |-----|-------|
//! | `{namespace}:fingerprint:{fingerprint}` | JSON task id |
//! | `{namespace}:response:{task_id}` | JSON [`TaskResponse`] |
//!
//! Both are written with the same expiry policy (one hour TTL, thirty
//! minutes max idle by default). Multi-step sequences that must not
//! interleave across instances run inside [`ResultCache::with_lock`].
//!
//! Response writes are monotonic: once a terminal response is cached, any
//! later message for the same task is refused (see
//! [`RecordOutcome::Stale`]).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::backend::{CacheBackend, CacheError, ExpiryPolicy};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::lock::{self, DistributedLock, LockOptions};
use crate::types::{TaskId, TaskResponse, TaskStatus};

/// Namespacing and expiry settings for a [`ResultCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Key namespace, shared by every instance of one deployment.
    pub namespace: String,
    /// Expiry applied to fingerprint bindings.
    pub fingerprint_expiry: ExpiryPolicy,
    /// Expiry applied to cached responses.
    pub response_expiry: ExpiryPolicy,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let expiry =
            ExpiryPolicy::new(Duration::from_secs(3600)).with_max_idle(Duration::from_secs(1800));
        Self {
            namespace: "terarium".to_string(),
            fingerprint_expiry: expiry,
            response_expiry: expiry,
        }
    }
}

/// Outcome of [`ResultCache::record_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The response is now the cached latest response.
    Written,
    /// A terminal response was already cached; nothing was written.
    Stale {
        /// Status of the cached terminal response.
        cached: TaskStatus,
    },
}

/// Domain layer over the shared cache.
#[derive(Clone)]
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    lock: Arc<dyn DistributedLock>,
    lock_options: LockOptions,
    settings: CacheSettings,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("lock_options", &self.lock_options)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ResultCache {
    /// Creates a result cache with default settings.
    pub fn new(backend: Arc<dyn CacheBackend>, lock: Arc<dyn DistributedLock>) -> Self {
        let settings = CacheSettings::default();
        let lock_options = LockOptions::new(format!("{}.lock", settings.namespace));
        Self {
            backend,
            lock,
            lock_options,
            settings,
        }
    }

    /// Replaces the namespace and expiry settings.
    pub fn with_settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the lock options.
    pub fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }

    /// Current settings.
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Runs `f` while holding the cluster-wide lock.
    ///
    /// The lock is released after `f` completes, whatever its result. A
    /// failed release is logged, not returned; the lease expires on its own.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lock`](crate::Error::Lock) if the lock could not be
    /// acquired within the wait window, otherwise whatever `f` returns.
    pub async fn with_lock<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = lock::acquire(self.lock.as_ref(), &self.lock_options).await?;
        let result = f().await;

        if lease.is_expired() {
            tracing::warn!(
                lock = %lease.name,
                lease_ms = lease.lease.as_millis() as u64,
                "critical section outlived its lock lease"
            );
        }
        match self.lock.release(&lease).await {
            Ok(true) => {},
            Ok(false) => {
                tracing::warn!(lock = %lease.name, "lock was no longer held at release");
            },
            Err(e) => {
                tracing::warn!(lock = %lease.name, error = %e, "failed to release lock");
            },
        }
        result
    }

    // ---- fingerprints ----

    /// Binds `fingerprint` to `task_id` unless it is already bound.
    ///
    /// Returns the existing binding when there is one. Call inside
    /// [`with_lock`](Self::with_lock).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on backend or decode failures.
    pub async fn claim_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        task_id: TaskId,
    ) -> Result<Option<TaskId>, CacheError> {
        let key = self.fingerprint_key(fingerprint);
        let data = encode(&key, &task_id)?;
        let existing = self
            .backend
            .put_if_absent(&key, &data, self.settings.fingerprint_expiry)
            .await?;
        existing.map(|bytes| decode(&key, &bytes)).transpose()
    }

    /// Binds `fingerprint` to `task_id`, replacing any existing binding.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on backend failures.
    pub async fn bind_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        task_id: TaskId,
    ) -> Result<(), CacheError> {
        let key = self.fingerprint_key(fingerprint);
        let data = encode(&key, &task_id)?;
        self.backend
            .put(&key, &data, self.settings.fingerprint_expiry)
            .await
    }

    /// The task currently bound to `fingerprint`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on backend or decode failures.
    pub async fn fingerprint_owner(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<TaskId>, CacheError> {
        let key = self.fingerprint_key(fingerprint);
        self.backend
            .get(&key)
            .await?
            .map(|bytes| decode(&key, &bytes))
            .transpose()
    }

    /// Removes the binding for `fingerprint` if it still points at
    /// `task_id`. Returns `true` if a binding was removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on backend failures.
    pub async fn release_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        task_id: TaskId,
    ) -> Result<bool, CacheError> {
        match self.fingerprint_owner(fingerprint).await? {
            Some(owner) if owner == task_id => {
                self.backend.delete(&self.fingerprint_key(fingerprint)).await
            },
            _ => Ok(false),
        }
    }

    // ---- responses ----

    /// The latest cached response for `task_id`.
    ///
    /// Does not take the lock.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on backend or decode failures.
    pub async fn response(&self, task_id: TaskId) -> Result<Option<TaskResponse>, CacheError> {
        let key = self.response_key(task_id);
        self.backend
            .get(&key)
            .await?
            .map(|bytes| decode(&key, &bytes))
            .transpose()
    }

    /// Stores `response` as the latest for its task, unless a terminal
    /// response is already cached. Terminal responses are final, so a
    /// redelivered or conflicting terminal message is refused as well.
    ///
    /// Call inside [`with_lock`](Self::with_lock).
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on backend failures.
    pub async fn record_response(
        &self,
        response: &TaskResponse,
    ) -> Result<RecordOutcome, CacheError> {
        match self.response(response.id).await {
            Ok(Some(cached)) if cached.status.is_terminal() => {
                return Ok(RecordOutcome::Stale {
                    cached: cached.status,
                });
            },
            Ok(_) => {},
            Err(CacheError::Decode { key, source }) => {
                tracing::warn!(key = %key, error = %source, "overwriting undecodable cached response");
            },
            Err(e) => return Err(e),
        }

        let key = self.response_key(response.id);
        let data = encode(&key, response)?;
        self.backend
            .put(&key, &data, self.settings.response_expiry)
            .await?;
        Ok(RecordOutcome::Written)
    }

    /// Removes the cached response for `task_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on backend failures.
    pub async fn forget_response(&self, task_id: TaskId) -> Result<bool, CacheError> {
        self.backend.delete(&self.response_key(task_id)).await
    }

    /// Sweeps expired entries from the backend.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on backend failures.
    pub async fn cleanup_expired(&self) -> Result<usize, CacheError> {
        let removed = self.backend.cleanup_expired().await?;
        if removed > 0 {
            tracing::debug!(removed, "swept expired cache entries");
        }
        Ok(removed)
    }

    fn fingerprint_key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}:fingerprint:{}", self.settings.namespace, fingerprint)
    }

    fn response_key(&self, task_id: TaskId) -> String {
        format!("{}:response:{}", self.settings.namespace, task_id)
    }
}

fn encode<T: serde::Serialize>(key: &str, value: &T) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(value).map_err(|source| CacheError::Encode {
        key: key.to_string(),
        source,
    })
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, data: &[u8]) -> Result<T, CacheError> {
    serde_json::from_slice(data).map_err(|source| CacheError::Decode {
        key: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheBackend;
    use crate::lock::InMemoryLock;
    use crate::types::{TaskEnvelope, TaskRequest};
    use pretty_assertions::assert_eq;

    fn test_cache() -> (ResultCache, Arc<InMemoryCacheBackend>) {
        let backend = Arc::new(InMemoryCacheBackend::new());
        let cache = ResultCache::new(backend.clone(), Arc::new(InMemoryLock::new()));
        (cache, backend)
    }

    fn queued() -> TaskResponse {
        TaskResponse::queued(&TaskEnvelope::new(TaskRequest::new("GOLLM", "model_card")))
    }

    fn fingerprint() -> Fingerprint {
        Fingerprint::of(&TaskRequest::new("GOLLM", "model_card")).unwrap()
    }

    #[tokio::test]
    async fn claim_returns_existing_owner() {
        let (cache, _) = test_cache();
        let first = TaskId::new();
        let second = TaskId::new();

        assert_eq!(cache.claim_fingerprint(&fingerprint(), first).await.unwrap(), None);
        assert_eq!(
            cache.claim_fingerprint(&fingerprint(), second).await.unwrap(),
            Some(first)
        );
        assert_eq!(cache.fingerprint_owner(&fingerprint()).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn release_only_removes_own_binding() {
        let (cache, _) = test_cache();
        let owner = TaskId::new();
        cache.bind_fingerprint(&fingerprint(), owner).await.unwrap();

        assert!(!cache.release_fingerprint(&fingerprint(), TaskId::new()).await.unwrap());
        assert!(cache.release_fingerprint(&fingerprint(), owner).await.unwrap());
        assert_eq!(cache.fingerprint_owner(&fingerprint()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn terminal_response_is_not_downgraded() {
        let (cache, _) = test_cache();
        let response = queued();
        let done = response.clone().with_status(TaskStatus::Success);

        assert_eq!(cache.record_response(&response).await.unwrap(), RecordOutcome::Written);
        assert_eq!(cache.record_response(&done).await.unwrap(), RecordOutcome::Written);

        let late = response.clone().with_status(TaskStatus::Running);
        assert_eq!(
            cache.record_response(&late).await.unwrap(),
            RecordOutcome::Stale {
                cached: TaskStatus::Success
            }
        );
        assert_eq!(cache.response(response.id).await.unwrap(), Some(done));
    }

    #[tokio::test]
    async fn terminal_response_is_final() {
        let (cache, _) = test_cache();
        let response = queued();
        let done = response.clone().with_status(TaskStatus::Success);
        assert_eq!(cache.record_response(&done).await.unwrap(), RecordOutcome::Written);

        for status in [TaskStatus::Cancelled, TaskStatus::Failed, TaskStatus::Success] {
            let late = response.clone().with_status(status);
            assert_eq!(
                cache.record_response(&late).await.unwrap(),
                RecordOutcome::Stale {
                    cached: TaskStatus::Success
                }
            );
        }
        assert_eq!(cache.response(response.id).await.unwrap(), Some(done));
    }

    #[tokio::test]
    async fn undecodable_response_is_replaced() {
        let (cache, backend) = test_cache();
        let response = queued();
        let key = format!("terarium:response:{}", response.id);
        backend
            .put(&key, b"not json", cache.settings().response_expiry)
            .await
            .unwrap();

        assert!(matches!(
            cache.response(response.id).await,
            Err(CacheError::Decode { .. })
        ));
        assert_eq!(cache.record_response(&response).await.unwrap(), RecordOutcome::Written);
        assert_eq!(cache.response(response.id).await.unwrap(), Some(response));
    }

    #[tokio::test]
    async fn with_lock_releases_after_error() {
        let lock = Arc::new(InMemoryLock::new());
        let cache = ResultCache::new(Arc::new(InMemoryCacheBackend::new()), lock.clone());

        let result: Result<()> = cache
            .with_lock(|| async { Err(crate::Error::InvalidRequest("x".to_string())) })
            .await;
        assert!(result.is_err());
        assert!(!lock.is_held("terarium.lock"));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let (cache, _) = test_cache();
        let response = queued();
        cache.record_response(&response).await.unwrap();
        cache.bind_fingerprint(&fingerprint(), response.id).await.unwrap();

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(cache.response(response.id).await.unwrap(), None);
        assert_eq!(cache.fingerprint_owner(&fingerprint()).await.unwrap(), None);
    }
}
