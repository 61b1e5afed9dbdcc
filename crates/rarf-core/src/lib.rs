//! Resilient Async Resource Fabric: the shared runtime substrate every other
//! service in this platform builds on — a generic connection pool, a
//! hierarchical cache, an idempotency store, a health & recovery
//! coordinator, and the cross-cutting primitives (correlation context,
//! circuit breaker, retry policy, lifecycle registry, structured errors)
//! they all share.
//!
//! Nothing in this crate talks to a concrete backend. Pools are generic over
//! a [`pool::ResourceFactory`]; the cache's L2 tier is generic over
//! [`cache::L2Backend`]; metrics and logging are generic over
//! [`metrics::MetricsSink`] and [`logsink::LogSink`]. Concrete adapters and
//! sinks live in sibling crates.

pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod idempotency;
pub mod lifecycle;
pub mod logsink;
pub mod metrics;
pub mod pool;
pub mod retry;

pub use breaker::{Admission, BreakerState, CircuitBreaker, ProceedToken};
pub use cache::{Cache, CacheStats, HitLayer, L2Backend, Transaction};
pub use clock::{Clock, FakeClock, SharedClock, SystemClock};
pub use context::Context;
pub use error::{RarfError, RarfResult};
pub use health::{Checker, HealthCoordinator, HealthState, RecoveryAction, RecoveryHandler, TransitionHook};
pub use idempotency::{IdempotencyRecord, IdempotencyStore, Lease, RecordState};
pub use lifecycle::{Component, LifecycleRegistry};
pub use logsink::{LogEvent, LogLevel, LogSink, SharedLogSink};
pub use metrics::{Labels, MetricsSink, SharedMetricsSink};
pub use pool::{Pool, PoolManager, PoolStats, ResourceFactory};
pub use retry::RetryPolicy;
