//! Low-level key-value backend trait for the shared result cache.
//!
//! The [`CacheBackend`] trait is the contract every cache engine implements:
//! [`get`](CacheBackend::get), [`put`](CacheBackend::put),
//! [`put_if_absent`](CacheBackend::put_if_absent),
//! [`delete`](CacheBackend::delete) and
//! [`cleanup_expired`](CacheBackend::cleanup_expired).
//!
//! Backends are dumb byte stores with expiry. They know nothing about
//! fingerprints, task statuses or locking; that lives in
//! [`ResultCache`](crate::cache::ResultCache).
//!
//! # Expiry
//!
//! Every write carries an [`ExpiryPolicy`]: an absolute time-to-live
//! measured from the write, and an optional max-idle window that is
//! refreshed by every successful [`get`](CacheBackend::get). An entry is
//! gone as soon as either limit passes.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// Expiry limits attached to a cache write.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskrelay::cache::ExpiryPolicy;
///
/// let policy = ExpiryPolicy::new(Duration::from_secs(3600))
///     .with_max_idle(Duration::from_secs(1800));
/// assert_eq!(policy.max_idle, Some(Duration::from_secs(1800)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// Lifetime measured from the write.
    pub ttl: Duration,

    /// Maximum time between reads before the entry expires.
    pub max_idle: Option<Duration>,
}

impl ExpiryPolicy {
    /// Creates a policy with only an absolute TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            max_idle: None,
        }
    }

    /// Adds a max-idle window (builder pattern).
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = Some(max_idle);
        self
    }
}

/// Errors raised by cache backends and the result cache.
///
/// # Examples
///
/// ```
/// use taskrelay::cache::CacheError;
///
/// let err = CacheError::Backend { message: "connection reset".to_string(), source: None };
/// assert_eq!(err.to_string(), "cache backend error: connection reset");
/// ```
#[derive(Debug)]
pub enum CacheError {
    /// An I/O or backend-specific failure.
    Backend {
        /// Human-readable description.
        message: String,
        /// The underlying error, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A stored value could not be decoded.
    Decode {
        /// The key holding the bad value.
        key: String,
        /// The decode failure.
        source: serde_json::Error,
    },

    /// A value could not be encoded for storage.
    Encode {
        /// The key being written.
        key: String,
        /// The encode failure.
        source: serde_json::Error,
    },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { message, .. } => write!(f, "cache backend error: {message}"),
            Self::Decode { key, source } => {
                write!(f, "failed to decode cached value at {key}: {source}")
            },
            Self::Encode { key, source } => {
                write!(f, "failed to encode value for {key}: {source}")
            },
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            Self::Decode { source, .. } | Self::Encode { source, .. } => Some(source),
            Self::Backend { source: None, .. } => None,
        }
    }
}

/// Expiring key-value store shared by every coordinator instance.
///
/// Implementations must be `Send + Sync`; the coordinator shares one
/// backend between its dispatch path and its consumer loops.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Reads a value and refreshes its idle deadline.
    ///
    /// Returns `Ok(None)` if the key is absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] on I/O failures.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Writes a value unconditionally, replacing any previous value and
    /// resetting its expiry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] on I/O failures.
    async fn put(&self, key: &str, data: &[u8], policy: ExpiryPolicy) -> Result<(), CacheError>;

    /// Writes a value only if the key is absent (or expired).
    ///
    /// Returns `None` when the write happened, or the live value that
    /// prevented it. A returned value counts as a read and refreshes its
    /// idle deadline.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] on I/O failures.
    async fn put_if_absent(
        &self,
        key: &str,
        data: &[u8],
        policy: ExpiryPolicy,
    ) -> Result<Option<Bytes>, CacheError>;

    /// Removes a key. Returns `true` if a live value was removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] on I/O failures.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Eagerly drops expired entries. Returns how many were removed.
    ///
    /// Backends with native expiry may return `Ok(0)`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] on I/O failures.
    async fn cleanup_expired(&self) -> Result<usize, CacheError>;
}
