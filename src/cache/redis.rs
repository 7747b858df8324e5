//! Redis cache backend.
//!
//! [`RedisCacheBackend`] implements [`CacheBackend`] on top of Redis. Each
//! entry is a hash holding the payload and its expiry limits; reads and
//! conditional writes run as Lua scripts (`redis::Script`) so that the
//! liveness check and the idle refresh happen in one atomic round-trip.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{prefix}:{key}` | Hash | Cached value |
//!
//! | Field | Description |
//! |-------|-------------|
//! | `data` | Raw payload bytes |
//! | `deadline` | Absolute expiry, Unix epoch milliseconds |
//! | `max_idle` | Idle window in milliseconds, `0` when unset |
//!
//! Redis' own key expiry is set to `min(deadline, last_read + max_idle)` on
//! every write and read, so expired entries disappear without a sweeper.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskrelay::cache::RedisCacheBackend;
//!
//! # async fn example() {
//! let backend = RedisCacheBackend::new("redis://127.0.0.1:6379")
//!     .await
//!     .unwrap()
//!     .with_prefix("terarium");
//! let backend = Arc::new(backend);
//! # }
//! ```

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use bytes::Bytes;

use super::backend::{CacheBackend, CacheError, ExpiryPolicy};

// ---------------------------------------------------------------------------
// Lua script constants
// ---------------------------------------------------------------------------

/// Read and refresh idle expiry.
///
/// KEYS[1] = entry hash key. ARGV[1] = now (epoch ms).
/// Returns: payload, or false when absent or expired.
const LUA_GET: &str = r#"
local fields = redis.call('HMGET', KEYS[1], 'data', 'deadline', 'max_idle')
if not fields[1] then
    return false
end
local now = tonumber(ARGV[1])
local deadline = tonumber(fields[2]) or 0
if deadline <= now then
    redis.call('DEL', KEYS[1])
    return false
end
local idle = tonumber(fields[3]) or 0
if idle > 0 then
    redis.call('PEXPIREAT', KEYS[1], math.min(deadline, now + idle))
end
return fields[1]
"#;

/// Unconditional write.
///
/// KEYS[1] = entry hash key. ARGV[1] = payload, ARGV[2] = deadline (epoch
/// ms), ARGV[3] = max idle ms (0 for none), ARGV[4] = now (epoch ms).
/// Returns: 1.
const LUA_PUT: &str = r#"
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'deadline', ARGV[2], 'max_idle', ARGV[3])
local expire_at = tonumber(ARGV[2])
local idle = tonumber(ARGV[3])
if idle > 0 then
    expire_at = math.min(expire_at, tonumber(ARGV[4]) + idle)
end
redis.call('PEXPIREAT', KEYS[1], expire_at)
return 1
"#;

/// Write unless a live value exists.
///
/// Same KEYS/ARGV layout as [`LUA_PUT`].
/// Returns: the existing payload, or false when the write happened.
const LUA_PUT_IF_ABSENT: &str = r#"
local now = tonumber(ARGV[4])
local fields = redis.call('HMGET', KEYS[1], 'data', 'deadline', 'max_idle')
if fields[1] then
    local deadline = tonumber(fields[2]) or 0
    if deadline > now then
        local idle = tonumber(fields[3]) or 0
        if idle > 0 then
            redis.call('PEXPIREAT', KEYS[1], math.min(deadline, now + idle))
        end
        return fields[1]
    end
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'deadline', ARGV[2], 'max_idle', ARGV[3])
local expire_at = tonumber(ARGV[2])
local idle = tonumber(ARGV[3])
if idle > 0 then
    expire_at = math.min(expire_at, now + idle)
end
redis.call('PEXPIREAT', KEYS[1], expire_at)
return false
"#;

// ---------------------------------------------------------------------------
// RedisCacheBackend struct
// ---------------------------------------------------------------------------

/// Redis-backed [`CacheBackend`].
///
/// Holds a [`MultiplexedConnection`]; each call clones it, and all clones
/// share one TCP connection.
#[derive(Debug, Clone)]
pub struct RedisCacheBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisCacheBackend {
    /// Connects to Redis at `url` using the default key prefix `"taskrelay"`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Backend`] if the client cannot be created or the
    /// connection cannot be established.
    pub async fn new(url: &str) -> Result<Self, CacheError> {
        let client = ::redis::Client::open(url).map_err(|e| CacheError::Backend {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Backend {
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

    fn entry_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

fn map_redis_error(err: ::redis::RedisError, key: &str) -> CacheError {
    CacheError::Backend {
        message: format!("Redis error for key {key}: {err}"),
        source: Some(Box::new(err)),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_ms(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Builds the shared ARGV tail: deadline, max idle and now.
fn expiry_args(policy: ExpiryPolicy) -> (i64, i64, i64) {
    let now = now_ms();
    let deadline = now.saturating_add(duration_ms(policy.ttl));
    let idle = policy.max_idle.map_or(0, duration_ms);
    (deadline, idle, now)
}

// ---------------------------------------------------------------------------
// CacheBackend implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let data: Option<Vec<u8>> = Script::new(LUA_GET)
            .key(self.entry_key(key))
            .arg(now_ms())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(data.map(Bytes::from))
    }

    async fn put(&self, key: &str, data: &[u8], policy: ExpiryPolicy) -> Result<(), CacheError> {
        let (deadline, idle, now) = expiry_args(policy);
        let _: i64 = Script::new(LUA_PUT)
            .key(self.entry_key(key))
            .arg(data)
            .arg(deadline)
            .arg(idle)
            .arg(now)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        data: &[u8],
        policy: ExpiryPolicy,
    ) -> Result<Option<Bytes>, CacheError> {
        let (deadline, idle, now) = expiry_args(policy);
        let existing: Option<Vec<u8>> = Script::new(LUA_PUT_IF_ABSENT)
            .key(self.entry_key(key))
            .arg(data)
            .arg(deadline)
            .arg(idle)
            .arg(now)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(existing.map(Bytes::from))
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(self.entry_key(key))
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(removed > 0)
    }

    /// Redis expires keys natively; nothing to sweep.
    async fn cleanup_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}
