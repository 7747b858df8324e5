//! Coordinator configuration.
//!
//! Configuration can be loaded from:
//! 1. TOML file (`taskrelay.toml`, section `[coordinator]`)
//! 2. Environment variables (with `TASKRELAY_` prefix)
//!
//! Environment variables override TOML configuration.
//!
//! # Example TOML Configuration
//!
//! ```toml
//! [coordinator]
//! run_sync_timeout_ms = 60000
//! consumer_concurrency = 16
//! cleanup_interval_ms = 60000
//!
//! [coordinator.broker]
//! prefix = "terarium"
//! cancellation_expiry_ms = 300000
//!
//! [coordinator.cache]
//! response_ttl_ms = 3600000
//! response_max_idle_ms = 1800000
//!
//! [coordinator.lock]
//! lease_ms = 10000
//! wait_ms = 30000
//! ```
//!
//! Exchange, queue, namespace and lock names left unset are derived from
//! `broker.prefix`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::Topology;
use crate::cache::{CacheSettings, ExpiryPolicy};
use crate::lock::LockOptions;

/// Default configuration file read by [`CoordinatorConfig::load`].
pub const DEFAULT_CONFIG_FILE: &str = "taskrelay.toml";

/// Main coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Identity of this instance; a random UUID when unset.
    pub instance_id: Option<String>,

    /// Default wait for `run_sync` callers that do not pass their own.
    pub run_sync_timeout_ms: u64,

    /// Messages processed concurrently by each consumer loop.
    pub consumer_concurrency: usize,

    /// Period of the background sweep that removes expired cache entries
    /// and waiters of tasks no longer in the cache.
    pub cleanup_interval_ms: u64,

    /// Broker naming.
    pub broker: BrokerConfig,

    /// Result cache settings.
    pub cache: CacheConfig,

    /// Distributed lock settings.
    pub lock: LockConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            run_sync_timeout_ms: 60_000,
            consumer_concurrency: 16,
            cleanup_interval_ms: 60_000,
            broker: BrokerConfig::default(),
            cache: CacheConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

/// Broker naming configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Prefix for every derived name.
    pub prefix: String,
    /// Results exchange; `{prefix}.results` when unset.
    pub results_exchange: Option<String>,
    /// Shared results queue; `{prefix}.results.shared` when unset.
    pub shared_results_queue: Option<String>,
    /// Broadcast exchange; `{prefix}.broadcast` when unset.
    pub broadcast_exchange: Option<String>,
    /// Cancellation exchange; `{prefix}.cancellation` when unset.
    pub cancellation_exchange: Option<String>,
    /// Unused-queue expiry of per-task cancellation queues.
    pub cancellation_expiry_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            prefix: "terarium".to_string(),
            results_exchange: None,
            shared_results_queue: None,
            broadcast_exchange: None,
            cancellation_exchange: None,
            cancellation_expiry_ms: 300_000,
        }
    }
}

/// Result cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Key namespace; the broker prefix when unset.
    pub namespace: Option<String>,
    /// Lifetime of fingerprint bindings.
    pub fingerprint_ttl_ms: u64,
    /// Idle window of fingerprint bindings.
    pub fingerprint_max_idle_ms: u64,
    /// Lifetime of cached responses.
    pub response_ttl_ms: u64,
    /// Idle window of cached responses.
    pub response_max_idle_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            fingerprint_ttl_ms: 3_600_000,
            fingerprint_max_idle_ms: 1_800_000,
            response_ttl_ms: 3_600_000,
            response_max_idle_ms: 1_800_000,
        }
    }
}

/// Distributed lock configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock name; `{prefix}.lock` when unset.
    pub name: Option<String>,
    /// Lease granted to a holder.
    pub lease_ms: u64,
    /// Maximum wait to acquire.
    pub wait_ms: u64,
    /// Pause between acquisition attempts.
    pub retry_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: None,
            lease_ms: 10_000,
            wait_ms: 30_000,
            retry_ms: 25,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. `taskrelay.toml` in the working directory, if present
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be parsed or the result
    /// is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = if let Ok(contents) = std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
            Self::from_toml(&contents)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or the
    /// result is invalid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse the `[coordinator]` section of TOML content. A missing section
    /// yields defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML or bad field types.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct FullConfig {
            #[serde(default)]
            coordinator: CoordinatorConfig,
        }

        let full: FullConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(full.coordinator)
    }

    /// Apply `TASKRELAY_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    /// Values that fail to parse are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring unparsable config override");
                    None
                },
            }
        }

        if let Some(v) = lookup("TASKRELAY_INSTANCE_ID") {
            self.instance_id = Some(v);
        }
        if let Some(v) = parsed(&lookup, "TASKRELAY_RUN_SYNC_TIMEOUT_MS") {
            self.run_sync_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "TASKRELAY_CONSUMER_CONCURRENCY") {
            self.consumer_concurrency = v;
        }
        if let Some(v) = parsed(&lookup, "TASKRELAY_CLEANUP_INTERVAL_MS") {
            self.cleanup_interval_ms = v;
        }

        // Broker
        if let Some(v) = lookup("TASKRELAY_QUEUE_PREFIX") {
            self.broker.prefix = v;
        }
        if let Some(v) = parsed(&lookup, "TASKRELAY_CANCELLATION_EXPIRY_MS") {
            self.broker.cancellation_expiry_ms = v;
        }

        // Cache
        if let Some(v) = lookup("TASKRELAY_CACHE_NAMESPACE") {
            self.cache.namespace = Some(v);
        }
        if let Some(v) = parsed(&lookup, "TASKRELAY_FINGERPRINT_TTL_MS") {
            self.cache.fingerprint_ttl_ms = v;
        }
        if let Some(v) = parsed(&lookup, "TASKRELAY_RESPONSE_TTL_MS") {
            self.cache.response_ttl_ms = v;
        }

        // Lock
        if let Some(v) = lookup("TASKRELAY_LOCK_NAME") {
            self.lock.name = Some(v);
        }
        if let Some(v) = parsed(&lookup, "TASKRELAY_LOCK_LEASE_MS") {
            self.lock.lease_ms = v;
        }
        if let Some(v) = parsed(&lookup, "TASKRELAY_LOCK_WAIT_MS") {
            self.lock.wait_ms = v;
        }
    }

    /// Rejects empty names and zero durations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{field} must not be empty")));
            }
            Ok(())
        }
        fn positive(field: &str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
            }
            Ok(())
        }

        non_empty("broker.prefix", &self.broker.prefix)?;
        for (field, value) in [
            ("broker.results_exchange", &self.broker.results_exchange),
            ("broker.shared_results_queue", &self.broker.shared_results_queue),
            ("broker.broadcast_exchange", &self.broker.broadcast_exchange),
            ("broker.cancellation_exchange", &self.broker.cancellation_exchange),
            ("cache.namespace", &self.cache.namespace),
            ("lock.name", &self.lock.name),
            ("instance_id", &self.instance_id),
        ] {
            if let Some(value) = value {
                non_empty(field, value)?;
            }
        }

        positive("run_sync_timeout_ms", self.run_sync_timeout_ms)?;
        positive("cleanup_interval_ms", self.cleanup_interval_ms)?;
        positive("broker.cancellation_expiry_ms", self.broker.cancellation_expiry_ms)?;
        positive("cache.fingerprint_ttl_ms", self.cache.fingerprint_ttl_ms)?;
        positive("cache.response_ttl_ms", self.cache.response_ttl_ms)?;
        positive("lock.lease_ms", self.lock.lease_ms)?;
        positive("lock.wait_ms", self.lock.wait_ms)?;
        positive("lock.retry_ms", self.lock.retry_ms)?;
        if self.consumer_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "consumer_concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Default `run_sync` wait.
    pub fn run_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.run_sync_timeout_ms)
    }

    /// Period of the background cleanup sweep.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Resolved broker layout.
    pub fn topology(&self) -> Topology {
        let b = &self.broker;
        let mut topology = Topology::new(b.prefix.clone());
        if let Some(name) = &b.results_exchange {
            topology.results_exchange = name.clone();
        }
        if let Some(name) = &b.shared_results_queue {
            topology.shared_results_queue = name.clone();
        }
        if let Some(name) = &b.broadcast_exchange {
            topology.broadcast_exchange = name.clone();
        }
        if let Some(name) = &b.cancellation_exchange {
            topology.cancellation_exchange = name.clone();
        }
        topology.cancellation_expiry = Duration::from_millis(b.cancellation_expiry_ms);
        topology
    }

    /// Resolved cache namespace and expiry.
    pub fn cache_settings(&self) -> CacheSettings {
        let c = &self.cache;
        CacheSettings {
            namespace: c
                .namespace
                .clone()
                .unwrap_or_else(|| self.broker.prefix.clone()),
            fingerprint_expiry: expiry(c.fingerprint_ttl_ms, c.fingerprint_max_idle_ms),
            response_expiry: expiry(c.response_ttl_ms, c.response_max_idle_ms),
        }
    }

    /// Resolved lock options.
    pub fn lock_options(&self) -> LockOptions {
        let l = &self.lock;
        let name = l
            .name
            .clone()
            .unwrap_or_else(|| format!("{}.lock", self.broker.prefix));
        LockOptions::new(name)
            .with_lease(Duration::from_millis(l.lease_ms))
            .with_wait(Duration::from_millis(l.wait_ms))
            .with_retry_interval(Duration::from_millis(l.retry_ms))
    }
}

/// A zero idle window means no idle expiry.
fn expiry(ttl_ms: u64, max_idle_ms: u64) -> ExpiryPolicy {
    let policy = ExpiryPolicy::new(Duration::from_millis(ttl_ms));
    if max_idle_ms == 0 {
        policy
    } else {
        policy.with_max_idle(Duration::from_millis(max_idle_ms))
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading configuration file.
    Io {
        /// Path to the configuration file.
        path: String,
        /// Error message.
        error: String,
    },
    /// Parse error in configuration.
    Parse(String),
    /// A value is out of range.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, error } => {
                write!(f, "Failed to read config file '{path}': {error}")
            },
            Self::Parse(e) => write!(f, "Failed to parse config: {e}"),
            Self::Invalid(e) => write!(f, "Invalid config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
