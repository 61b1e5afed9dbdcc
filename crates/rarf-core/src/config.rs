//! Typed, in-process configuration contracts (§6.1, §10.3). These are plain
//! Rust structs with `Default` impls encoding the documented defaults; no
//! file or env parsing happens here — that remains the embedding
//! application's responsibility.

use std::time::Duration;

use crate::error::RarfError;

/// Predicate consulted by `RetryPolicy::execute` before falling back to
/// `RarfError::is_retryable()`; lets a caller widen or narrow what gets
/// retried for a given policy (§6.1).
pub type RetryableKinds = std::sync::Arc<dyn Fn(&RarfError) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub name: String,
    pub min_size: u32,
    pub max_size: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub health_check_interval: Duration,
    pub leak_threshold: Duration,
    pub leak_force_release: Duration,
    pub wait_queue_max: u32,
    pub grow_step: u32,
    pub shrink_threshold: u32,
    pub shrink_dwell: Duration,
}

impl PoolOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default_unnamed()
        }
    }

    fn default_unnamed() -> Self {
        Self {
            name: String::new(),
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(30),
            leak_threshold: Duration::from_secs(60),
            leak_force_release: Duration::from_secs(300),
            wait_queue_max: 64,
            grow_step: 2,
            shrink_threshold: 4,
            shrink_dwell: Duration::from_secs(60),
        }
    }

    pub fn validate(&self) -> Result<(), RarfError> {
        if self.max_size == 0 {
            return Err(RarfError::ConfigInvalid {
                option: "max_size",
                reason: "must be greater than zero".into(),
            });
        }
        if self.min_size > self.max_size {
            return Err(RarfError::ConfigInvalid {
                option: "min_size",
                reason: "must not exceed max_size".into(),
            });
        }
        Ok(())
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::default_unnamed()
    }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub shard_count: usize,
    pub l1_max_entries: usize,
    pub l1_max_bytes: usize,
    pub default_ttl: Duration,
    pub enable_l2: bool,
    pub l2_path: Option<std::path::PathBuf>,
    pub write_through: bool,
    pub enable_demotion: bool,
    pub sweep_interval: Duration,
}

impl CacheOptions {
    pub fn validate(&self) -> Result<(), RarfError> {
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(RarfError::ConfigInvalid {
                option: "shard_count",
                reason: "must be a nonzero power of two".into(),
            });
        }
        if self.enable_l2 && self.l2_path.is_none() {
            return Err(RarfError::ConfigMissing { option: "l2_path" });
        }
        Ok(())
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            shard_count: 16,
            l1_max_entries: 100_000,
            l1_max_bytes: 64 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            enable_l2: false,
            l2_path: None,
            write_through: false,
            enable_demotion: false,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyOptions {
    pub default_ttl: Duration,
    pub pending_timeout: Duration,
    pub sweep_interval: Duration,
    pub stripe_count: usize,
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(600),
            pending_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(15),
            stripe_count: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerOptions {
    pub failure_threshold: u32,
    pub rolling_window: Duration,
    pub cool_down: Duration,
    pub cool_down_max: Duration,
    pub backoff_factor: f64,
    pub success_threshold: u32,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            rolling_window: Duration::from_secs(30),
            cool_down: Duration::from_millis(500),
            cool_down_max: Duration::from_secs(30),
            backoff_factor: 2.0,
            success_threshold: 2,
        }
    }
}

#[derive(Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter_fraction: f64,
    pub per_attempt_timeout: Option<Duration>,
    /// Overrides `RarfError::is_retryable()` when set. `None` keeps the
    /// fixed default.
    pub retryable_kinds: Option<RetryableKinds>,
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("factor", &self.factor)
            .field("jitter_fraction", &self.jitter_fraction)
            .field("per_attempt_timeout", &self.per_attempt_timeout)
            .field("retryable_kinds", &self.retryable_kinds.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl RetryOptions {
    pub fn with_retryable_kinds(mut self, predicate: RetryableKinds) -> Self {
        self.retryable_kinds = Some(predicate);
        self
    }

    pub(crate) fn is_retryable(&self, err: &RarfError) -> bool {
        match &self.retryable_kinds {
            Some(predicate) => predicate(err),
            None => err.is_retryable(),
        }
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
            jitter_fraction: 0.1,
            per_attempt_timeout: None,
            retryable_kinds: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheckerOptions {
    pub name: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub degraded_threshold: u32,
    pub failing_threshold: u32,
    pub max_recoveries_per_window: u32,
    pub recovery_window: Duration,
}

impl HealthCheckerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            degraded_threshold: 2,
            failing_threshold: 4,
            max_recoveries_per_window: 3,
            recovery_window: Duration::from_secs(300),
        }
    }
}
