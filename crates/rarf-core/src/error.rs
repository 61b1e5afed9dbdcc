/// The closed error taxonomy every RARF component surfaces (§4.9). Each
/// variant carries a stable code via [`RarfError::code`] and, where a lower
/// layer produced the failure, the original cause through `#[source]`.
///
/// Components never wrap a deadline or cancellation into `Internal` — those
/// two always surface directly, per the propagation policy in §7.
#[derive(Debug, thiserror::Error)]
pub enum RarfError {
    #[error("configuration option '{option}' is required but was not supplied")]
    ConfigMissing { option: &'static str },

    #[error("configuration option '{option}' is invalid: {reason}")]
    ConfigInvalid { option: &'static str, reason: String },

    #[error("pool '{pool}' is closed")]
    PoolClosed { pool: String },

    #[error("acquire on pool '{pool}' timed out after {waited_ms}ms")]
    PoolTimeout { pool: String, waited_ms: u64 },

    #[error("pool '{pool}' wait queue is full ({wait_queue_max} waiters)")]
    PoolExhausted { pool: String, wait_queue_max: u32 },

    #[error("pool '{pool}' is unavailable (circuit breaker open)")]
    PoolUnavailable { pool: String },

    #[error("failed to create a resource for pool '{pool}'")]
    ResourceCreationFailed {
        pool: String,
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("resource validation failed for pool '{pool}'")]
    ResourceValidationFailed {
        pool: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("cache miss")]
    CacheMiss,

    #[error("cache shard capacity exceeded (would need {needed_bytes} of {budget_bytes} bytes)")]
    CacheCapacityExceeded { needed_bytes: usize, budget_bytes: usize },

    #[error("cache transaction aborted: {reason}")]
    CacheTransactionAborted { reason: String },

    #[error("idempotency key already has a {state} record")]
    IdempotencyConflict { state: &'static str },

    #[error("idempotency key timed out while pending")]
    IdempotencyTimeout,

    #[error("circuit breaker '{breaker}' is open until next probe")]
    BreakerOpen { breaker: String },

    #[error("health check '{checker}' timed out after {timeout_ms}ms")]
    CheckTimeout { checker: String, timeout_ms: u64 },

    #[error("health check '{checker}' failed: {detail}")]
    CheckFailed { checker: String, detail: String },

    #[error("operation cancelled")]
    ContextCancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl RarfError {
    /// Stable machine-readable code, suitable for metrics labels and API responses.
    pub const fn code(&self) -> &'static str {
        match self {
            RarfError::ConfigMissing { .. } => "config_missing",
            RarfError::ConfigInvalid { .. } => "config_invalid",
            RarfError::PoolClosed { .. } => "pool_closed",
            RarfError::PoolTimeout { .. } => "pool_timeout",
            RarfError::PoolExhausted { .. } => "pool_exhausted",
            RarfError::PoolUnavailable { .. } => "pool_unavailable",
            RarfError::ResourceCreationFailed { .. } => "resource_creation_failed",
            RarfError::ResourceValidationFailed { .. } => "resource_validation_failed",
            RarfError::CacheMiss => "cache_miss",
            RarfError::CacheCapacityExceeded { .. } => "cache_capacity_exceeded",
            RarfError::CacheTransactionAborted { .. } => "cache_transaction_aborted",
            RarfError::IdempotencyConflict { .. } => "idempotency_conflict",
            RarfError::IdempotencyTimeout => "idempotency_timeout",
            RarfError::BreakerOpen { .. } => "breaker_open",
            RarfError::CheckTimeout { .. } => "check_timeout",
            RarfError::CheckFailed { .. } => "check_failed",
            RarfError::ContextCancelled => "context_cancelled",
            RarfError::DeadlineExceeded => "deadline_exceeded",
            RarfError::Internal(_) => "internal",
        }
    }

    /// Per §4.9/§7: only this subset is retried by default.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            RarfError::PoolUnavailable { .. }
                | RarfError::BreakerOpen { .. }
                | RarfError::DeadlineExceeded
                | RarfError::ResourceValidationFailed { .. }
                | RarfError::Internal(_)
        )
    }

    pub fn internal(cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        RarfError::Internal(Box::new(cause))
    }
}

pub type RarfResult<T> = std::result::Result<T, RarfError>;
