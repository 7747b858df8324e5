//! Shared result cache.
//!
//! - [`backend`]: the [`CacheBackend`] KV trait and [`ExpiryPolicy`].
//! - [`memory`]: [`InMemoryCacheBackend`].
//! - `redis` (feature `redis`): `RedisCacheBackend`.
//! - [`store`]: [`ResultCache`], the fingerprint and response layer.

pub mod backend;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

pub use backend::{CacheBackend, CacheError, ExpiryPolicy};
pub use memory::InMemoryCacheBackend;
#[cfg(feature = "redis")]
pub use redis::RedisCacheBackend;
pub use store::{CacheSettings, RecordOutcome, ResultCache};
