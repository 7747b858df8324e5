//! Redis lock backend.
//!
//! Acquisition is a single `SET {prefix}:{name} {token} NX PX {lease}`.
//! Release runs a Lua compare-and-delete so that a holder whose lease ran
//! out cannot delete a lock that someone else has since taken.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::Script;
use async_trait::async_trait;

use super::{DistributedLock, Lease, LockError};

/// Delete only if the stored token matches.
///
/// KEYS[1] = lock key. ARGV[1] = token.
/// Returns: 1 if deleted, 0 otherwise.
const LUA_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed [`DistributedLock`].
#[derive(Debug, Clone)]
pub struct RedisLock {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisLock {
    /// Connects to Redis at `url` using the default key prefix `"taskrelay"`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] if the connection cannot be established.
    pub async fn new(url: &str) -> Result<Self, LockError> {
        let client = ::redis::Client::open(url).map_err(|e| LockError::Backend {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockError::Backend {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self::with_connection(conn))
    }

    /// Wraps an existing multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "taskrelay".to_string(),
        }
    }

    /// Sets the key prefix (builder pattern).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}:{}", self.key_prefix, name)
    }
}

fn map_redis_error(err: ::redis::RedisError, name: &str) -> LockError {
    LockError::Backend {
        message: format!("Redis error for lock {name}: {err}"),
        source: Some(Box::new(err)),
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, name: &str, lease: Duration) -> Result<Option<Lease>, LockError> {
        let granted = Lease::new(name, lease);
        let lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(self.lock_key(name))
            .arg(&granted.token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, name))?;
        Ok(reply.map(|_| granted))
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LockError> {
        let deleted: i64 = Script::new(LUA_RELEASE)
            .key(self.lock_key(&lease.name))
            .arg(&lease.token)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, &lease.name))?;
        Ok(deleted == 1)
    }
}

#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;

    async fn test_lock() -> RedisLock {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisLock::new(&url)
            .await
            .expect("Redis connection failed -- is Redis running?")
            .with_prefix(format!("test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn redis_lock_is_exclusive() {
        let lock = test_lock().await;
        let lease = lock
            .try_acquire("l", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(lock.try_acquire("l", Duration::from_secs(5)).await.unwrap().is_none());
        assert!(lock.release(&lease).await.unwrap());
        assert!(lock.try_acquire("l", Duration::from_secs(5)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn redis_release_with_stale_token_is_noop() {
        let lock = test_lock().await;
        let stale = lock
            .try_acquire("l", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let fresh = lock
            .try_acquire("l", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(!lock.release(&stale).await.unwrap());
        assert!(lock.release(&fresh).await.unwrap());
    }
}
