//! Runtime configuration shared by every scene of a process.
//!
//! Durations are (de)serialized as integer milliseconds so a configuration
//! file reads naturally:
//!
//! ```json
//! { "rpc_timeout": 30000, "lock_timeout": 30000, "tick_interval": 10 }
//! ```
//!
//! Missing fields fall back to [`RuntimeConfig::default`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables for scenes, pools, locks and the addressable client.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use scenenet::RuntimeConfig;
///
/// let config = RuntimeConfig::builder()
///     .rpc_timeout(Duration::from_secs(5))
///     .task_pool_capacity(128)
///     .build()
///     .unwrap();
/// assert_eq!(config.rpc_timeout(), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    #[serde(with = "duration_ms")]
    rpc_timeout: Duration,
    #[serde(with = "duration_ms")]
    lock_timeout: Duration,
    task_pool_capacity: usize,
    #[serde(with = "duration_ms")]
    tick_interval: Duration,
    #[serde(with = "duration_ms")]
    pending_sweep_interval: Duration,
    addressable_retry_limit: u32,
    #[serde(with = "duration_ms")]
    addressable_retry_delay: Duration,
    random_rpc_seed: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_millis(30_000),
            task_pool_capacity: 2000,
            tick_interval: Duration::from_millis(10),
            pending_sweep_interval: Duration::from_secs(1),
            addressable_retry_limit: 20,
            addressable_retry_delay: Duration::from_millis(500),
            random_rpc_seed: false,
        }
    }
}

impl RuntimeConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |field| ConfigError::Invalid {
            field,
            reason: "must be greater than zero",
        };
        if self.rpc_timeout.is_zero() {
            return Err(zero("rpc_timeout"));
        }
        if self.lock_timeout.is_zero() {
            return Err(zero("lock_timeout"));
        }
        if self.task_pool_capacity == 0 {
            return Err(zero("task_pool_capacity"));
        }
        if self.tick_interval.is_zero() {
            return Err(zero("tick_interval"));
        }
        if self.pending_sweep_interval.is_zero() {
            return Err(zero("pending_sweep_interval"));
        }
        Ok(())
    }

    /// Deadline for a pending call before it fails with a timeout.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Wait time after which a queued lock ticket is reported.
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Maximum number of recycled tasks kept per result type.
    pub fn task_pool_capacity(&self) -> usize {
        self.task_pool_capacity
    }

    /// Upper bound on the idle time between two shard cycles.
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn pending_sweep_interval(&self) -> Duration {
        self.pending_sweep_interval
    }

    pub fn addressable_retry_limit(&self) -> u32 {
        self.addressable_retry_limit
    }

    pub fn addressable_retry_delay(&self) -> Duration {
        self.addressable_retry_delay
    }

    /// Start rpc ids at a random value instead of 1.
    pub fn random_rpc_seed(&self) -> bool {
        self.random_rpc_seed
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn task_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.task_pool_capacity = capacity;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    pub fn pending_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.pending_sweep_interval = interval;
        self
    }

    pub fn addressable_retry_limit(mut self, limit: u32) -> Self {
        self.config.addressable_retry_limit = limit;
        self
    }

    pub fn addressable_retry_delay(mut self, delay: Duration) -> Self {
        self.config.addressable_retry_delay = delay;
        self
    }

    pub fn random_rpc_seed(mut self, random: bool) -> Self {
        self.config.random_rpc_seed = random;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
