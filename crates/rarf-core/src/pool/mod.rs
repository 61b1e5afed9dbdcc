//! Generic asynchronous resource pool (§4.1). Mirrors the dial-state pattern
//! used for gRPC channel reuse elsewhere in this codebase: metadata (who is
//! idle, who is in-use, who is waiting) lives behind one synchronous mutex
//! that is never held across an `.await`; the factory call that actually
//! creates or destroys a resource always happens outside that lock.

mod manager;
mod sweep;

pub use manager::PoolManager;
pub use sweep::SweepHandle;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::oneshot;

use crate::clock::SharedClock;
use crate::config::PoolOptions;
use crate::context::Context;
use crate::error::RarfError;
use crate::metrics::{self, SharedMetricsSink};

/// The capability set a concrete backend (Postgres, Redis, HTTP) must provide
/// for `Pool<T>` to manage it. Adapters in `rarf-adapters` implement this;
/// the pool itself never knows what `T` actually is.
#[async_trait::async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    async fn create(&self, ctx: &Context) -> Result<Self::Resource, RarfError>;

    async fn validate(&self, resource: &mut Self::Resource, ctx: &Context) -> bool;

    async fn destroy(&self, resource: Self::Resource);
}

struct Slot<T> {
    id: u64,
    resource: T,
    created_at: Instant,
    idle_since: Instant,
}

struct InUseSlot {
    created_at: Instant,
    acquired_at: Instant,
    leak_logged: bool,
}

struct PoolState<T> {
    idle: VecDeque<Slot<T>>,
    in_use: HashMap<u64, InUseSlot>,
    waiters: VecDeque<oneshot::Sender<()>>,
    creating: u32,
    /// Idle slots pulled out of `idle` for health/age probing; counted
    /// toward `total()` so a concurrent `acquire()` can't create past
    /// `max_size` while a probe is in flight (§8 Property 1).
    probing: u32,
    closing: bool,
    total_created: u64,
    total_destroyed: u64,
    recent_wait_ms: VecDeque<u64>,
}

impl<T> PoolState<T> {
    fn total(&self) -> u32 {
        (self.idle.len() + self.in_use.len()) as u32 + self.creating + self.probing
    }

    /// Pop one waiter and wake it; skips senders whose receiver already
    /// dropped (e.g. the waiter cancelled while we held the lock).
    fn wake_one(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub active: u32,
    pub idle: u32,
    pub waiting: u32,
    pub total_created: u64,
    pub total_destroyed: u64,
}

/// Borrowed handle returned by `acquire`. Dropping it without calling
/// `release` explicitly returns the resource as healthy, the same as most
/// pool-guard types in this ecosystem.
pub struct Acquired<T: Send + 'static, F: ResourceFactory<Resource = T>> {
    pool: Pool<T, F>,
    id: u64,
    resource: Option<T>,
    released: bool,
}

impl<T: Send + 'static, F: ResourceFactory<Resource = T>> std::fmt::Debug for Acquired<T, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquired").field("id", &self.id).field("released", &self.released).finish()
    }
}

impl<T: Send + 'static, F: ResourceFactory<Resource = T>> Acquired<T, F> {
    pub fn get(&self) -> &T {
        self.resource.as_ref().expect("resource taken after release")
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("resource taken after release")
    }

    /// Explicit release with a health verdict; idempotent (a second call is a
    /// warned-on no-op per §4.1).
    pub async fn release(mut self, healthy: bool) {
        self.release_inner(healthy).await;
    }

    async fn release_inner(&mut self, healthy: bool) {
        if self.released {
            self.pool.inner.metrics.counter("rarf_pool_double_release", &[("pool", &self.pool.inner.name)], 1);
            tracing::warn!(pool = %self.pool.inner.name, id = self.id, "double release of pool resource");
            return;
        }
        self.released = true;
        let resource = self.resource.take().expect("resource present until release");
        self.pool.finish_release(self.id, resource, healthy).await;
    }
}

impl<T: Send + 'static, F: ResourceFactory<Resource = T>> Drop for Acquired<T, F> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(resource) = self.resource.take() {
            self.released = true;
            let pool = self.pool.clone();
            let id = self.id;
            tokio::spawn(async move {
                pool.finish_release(id, resource, true).await;
            });
        }
    }
}

struct Inner<T, F> {
    name: String,
    options: PoolOptions,
    factory: F,
    state: Mutex<PoolState<T>>,
    next_id: AtomicU64,
    metrics: SharedMetricsSink,
    clock: SharedClock,
}

/// A pool of up to `max_size` resources of type `T`, created by `F`.
pub struct Pool<T: Send + 'static, F: ResourceFactory<Resource = T>> {
    inner: Arc<Inner<T, F>>,
}

impl<T: Send + 'static, F: ResourceFactory<Resource = T>> Clone for Pool<T, F> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

enum FastPath {
    Closed,
    Idle(u64),
    MustCreate,
    MustWait(oneshot::Receiver<()>),
}

impl<T: Send + 'static, F: ResourceFactory<Resource = T>> Pool<T, F> {
    pub fn new(options: PoolOptions, factory: F, clock: SharedClock) -> Result<Self, RarfError> {
        Self::with_metrics(options, factory, clock, metrics::noop())
    }

    pub fn with_metrics(options: PoolOptions, factory: F, clock: SharedClock, metrics: SharedMetricsSink) -> Result<Self, RarfError> {
        options.validate()?;
        let name = options.name.clone();
        Ok(Self {
            inner: Arc::new(Inner {
                name,
                options,
                factory,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    in_use: HashMap::new(),
                    waiters: VecDeque::new(),
                    creating: 0,
                    probing: 0,
                    closing: false,
                    total_created: 0,
                    total_destroyed: 0,
                    recent_wait_ms: VecDeque::with_capacity(32),
                }),
                next_id: AtomicU64::new(1),
                metrics,
                clock,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().expect("pool mutex poisoned");
        PoolStats {
            active: state.in_use.len() as u32,
            idle: state.idle.len() as u32,
            waiting: state.waiters.len() as u32,
            total_created: state.total_created,
            total_destroyed: state.total_destroyed,
        }
    }

    /// §4.1 acquire algorithm: pop idle, else create under `max_size`, else
    /// enqueue and wait; on every wake (slot freed, or a failed creation
    /// freed a reservation) the state is re-checked from the top.
    pub async fn acquire(&self, ctx: &Context) -> Result<Acquired<T, F>, RarfError> {
        let start = self.inner.clock.now();
        // The deadline feeds tokio's real timer via `ctx.race` below, so it
        // has to stay anchored to the real clock even when `self.inner.clock`
        // is a `FakeClock` in tests; only bookkeeping timestamps (wait time,
        // slot ages) are clock-injected.
        let deadline = Instant::now() + self.inner.options.acquire_timeout;
        let ctx = ctx.clone().with_deadline(deadline);

        loop {
            ctx.check()?;

            let fast = {
                let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                if state.closing {
                    FastPath::Closed
                } else if let Some(slot) = state.idle.back() {
                    let id = slot.id;
                    FastPath::Idle(id)
                } else if state.total() < self.inner.options.max_size {
                    state.creating += 1;
                    FastPath::MustCreate
                } else if state.waiters.len() as u32 >= self.inner.options.wait_queue_max {
                    return Err(RarfError::PoolExhausted {
                        pool: self.inner.name.clone(),
                        wait_queue_max: self.inner.options.wait_queue_max,
                    });
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    FastPath::MustWait(rx)
                }
            };

            match fast {
                FastPath::Closed => return Err(RarfError::PoolClosed { pool: self.inner.name.clone() }),
                FastPath::Idle(_) => {
                    let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                    let Some(slot) = state.idle.pop_back() else {
                        // Lost the race to another waker between peek and pop.
                        continue;
                    };
                    state.in_use.insert(
                        slot.id,
                        InUseSlot { created_at: slot.created_at, acquired_at: self.inner.clock.now(), leak_logged: false },
                    );
                    drop(state);
                    return Ok(self.finish_acquire(start, slot.id, slot.resource));
                }
                FastPath::MustCreate => match self.create_slot(&ctx).await {
                    Ok((id, resource)) => return Ok(self.finish_acquire(start, id, resource)),
                    Err(err) => return Err(err),
                },
                FastPath::MustWait(rx) => {
                    match ctx.race(rx).await {
                        Ok(_) => continue,
                        Err(timeout_or_cancel) => {
                            if matches!(timeout_or_cancel, RarfError::DeadlineExceeded) {
                                return Err(RarfError::PoolTimeout {
                                    pool: self.inner.name.clone(),
                                    waited_ms: self.inner.clock.now().saturating_duration_since(start).as_millis() as u64,
                                });
                            }
                            return Err(timeout_or_cancel);
                        }
                    }
                }
            }
        }
    }

    fn finish_acquire(&self, start: Instant, id: u64, resource: T) -> Acquired<T, F> {
        let waited_ms = self.inner.clock.now().saturating_duration_since(start).as_millis() as u64;
        {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            if state.recent_wait_ms.len() == 32 {
                state.recent_wait_ms.pop_front();
            }
            state.recent_wait_ms.push_back(waited_ms);
        }
        self.inner.metrics.observe("rarf_pool_acquire_wait_ms", &[("pool", &self.inner.name)], waited_ms as f64);
        Acquired { pool: self.clone(), id, resource: Some(resource), released: false }
    }

    async fn create_slot(&self, ctx: &Context) -> Result<(u64, T), RarfError> {
        let result = self.inner.factory.create(ctx).await;
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        state.creating -= 1;
        match result {
            Ok(resource) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                state.total_created += 1;
                let now = self.inner.clock.now();
                state.in_use.insert(id, InUseSlot { created_at: now, acquired_at: now, leak_logged: false });
                drop(state);
                self.inner.metrics.counter("rarf_pool_created", &[("pool", &self.inner.name)], 1);
                Ok((id, resource))
            }
            Err(err) => {
                // A reservation was freed; wake a waiter so it re-enters the
                // loop and may create or wait again (not a slot handoff).
                state.wake_one();
                drop(state);
                self.inner.metrics.counter("rarf_pool_create_failed", &[("pool", &self.inner.name)], 1);
                Err(RarfError::ResourceCreationFailed {
                    pool: self.inner.name.clone(),
                    cause: Box::new(err),
                })
            }
        }
    }

    async fn finish_release(&self, id: u64, resource: T, healthy: bool) {
        if !healthy {
            self.destroy_one(id, resource).await;
            self.maybe_replenish().await;
            return;
        }

        let in_use = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            state.in_use.remove(&id)
        };
        let Some(in_use) = in_use else {
            // Already released (leak-forced or double release); drop quietly.
            self.inner.factory.destroy(resource).await;
            return;
        };
        {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            let now = self.inner.clock.now();
            state.idle.push_back(Slot { id, resource, created_at: in_use.created_at, idle_since: now });
            state.wake_one();
        }
        self.inner.metrics.counter("rarf_pool_released", &[("pool", &self.inner.name)], 1);
    }

    async fn destroy_one(&self, id: u64, resource: T) {
        {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            state.in_use.remove(&id);
            state.total_destroyed += 1;
        }
        self.inner.factory.destroy(resource).await;
        self.inner.metrics.counter("rarf_pool_destroyed", &[("pool", &self.inner.name)], 1);
    }

    async fn maybe_replenish(&self) {
        let should_create = {
            let state = self.inner.state.lock().expect("pool mutex poisoned");
            state.idle.len() < self.inner.options.min_size as usize && state.total() < self.inner.options.max_size
        };
        if should_create {
            let ctx = Context::new();
            if let Ok((id, resource)) = self.create_slot(&ctx).await {
                Box::pin(self.finish_release(id, resource, true)).await;
            }
        }
    }

    /// Background sweep: health-probe idle resources, detect leaked in-use
    /// resources, and apply the adaptive sizing policy (§4.1). Intended to be
    /// driven by a `tokio::time::interval` loop; see `SweepHandle::spawn`.
    pub async fn sweep_once(&self, ctx: &Context) {
        self.probe_idle(ctx).await;
        self.detect_leaks().await;
        self.apply_sizing_policy(ctx).await;
    }

    /// Validates (and age-evicts) idle slots one at a time rather than
    /// draining the whole `idle` deque up front: a drained-but-not-yet-
    /// reinserted batch would be invisible to `state.total()`, letting a
    /// concurrent `acquire()` create past `max_size` (§8 Property 1). Each
    /// slot pulled out is counted via `state.probing` for the duration of
    /// its check instead.
    async fn probe_idle(&self, ctx: &Context) {
        let batch_size = { self.inner.state.lock().expect("pool mutex poisoned").idle.len() };

        for _ in 0..batch_size {
            let slot = {
                let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                let Some(slot) = state.idle.pop_front() else { break };
                state.probing += 1;
                slot
            };

            let now = self.inner.clock.now();
            let too_old = now.saturating_duration_since(slot.created_at) >= self.inner.options.max_lifetime;
            let idle_too_long = now.saturating_duration_since(slot.idle_since) >= self.inner.options.idle_timeout;

            if too_old || idle_too_long {
                {
                    let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                    state.probing -= 1;
                    state.total_destroyed += 1;
                }
                self.inner.factory.destroy(slot.resource).await;
                self.inner.metrics.counter("rarf_pool_evicted_by_age", &[("pool", &self.inner.name)], 1);
                continue;
            }

            let mut slot = slot;
            if self.inner.factory.validate(&mut slot.resource, ctx).await {
                let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                state.probing -= 1;
                state.idle.push_back(slot);
            } else {
                {
                    let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                    state.probing -= 1;
                    state.total_destroyed += 1;
                }
                self.inner.factory.destroy(slot.resource).await;
                self.inner.metrics.counter("rarf_pool_failed_health_probe", &[("pool", &self.inner.name)], 1);
            }
        }

        self.maybe_replenish().await;
    }

    async fn detect_leaks(&self) {
        let (logged, forced): (Vec<u64>, Vec<u64>) = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            let now = self.inner.clock.now();
            let leak_threshold = self.inner.options.leak_threshold;
            let force_release = self.inner.options.leak_force_release;
            let mut logged = Vec::new();
            let mut forced = Vec::new();
            for (id, slot) in state.in_use.iter_mut() {
                let held_for = now.duration_since(slot.acquired_at);
                if held_for >= force_release {
                    forced.push(*id);
                } else if held_for >= leak_threshold && !slot.leak_logged {
                    slot.leak_logged = true;
                    logged.push(*id);
                }
            }
            for id in &forced {
                state.in_use.remove(id);
                state.total_destroyed += 1;
            }
            if !forced.is_empty() {
                state.wake_one();
            }
            (logged, forced)
        };

        for id in logged {
            self.inner.metrics.counter("rarf_pool_leak_suspected", &[("pool", &self.inner.name)], 1);
            tracing::warn!(pool = %self.inner.name, id, "pool resource held beyond leak_threshold");
        }
        for id in forced {
            self.inner.metrics.counter("rarf_pool_leak_force_released", &[("pool", &self.inner.name)], 1);
            tracing::error!(pool = %self.inner.name, id, "forcibly reclaiming leaked pool resource");
        }
    }

    async fn apply_sizing_policy(&self, ctx: &Context) {
        let (avg_wait, total, idle_len) = {
            let state = self.inner.state.lock().expect("pool mutex poisoned");
            let avg = if state.recent_wait_ms.is_empty() {
                0
            } else {
                state.recent_wait_ms.iter().sum::<u64>() / state.recent_wait_ms.len() as u64
            };
            (avg, state.total(), state.idle.len() as u32)
        };

        let grow_threshold_ms = (self.inner.options.acquire_timeout.as_millis() as u64 / 4).max(1);
        if avg_wait > grow_threshold_ms && total < self.inner.options.max_size {
            let room = self.inner.options.max_size - total;
            let grow_by = self.inner.options.grow_step.min(room);
            for _ in 0..grow_by {
                if let Ok((id, resource)) = self.create_slot(ctx).await {
                    self.finish_release(id, resource, true).await;
                }
            }
        } else if idle_len > self.inner.options.min_size + self.inner.options.shrink_threshold {
            let excess = idle_len - self.inner.options.min_size - self.inner.options.shrink_threshold;
            for _ in 0..excess {
                let victim = {
                    let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                    state.idle.pop_front()
                };
                match victim {
                    Some(slot) => self.destroy_one(slot.id, slot.resource).await,
                    None => break,
                }
            }
        }
    }

    /// §4.1 close: drains waiters, closes idle resources immediately and
    /// in-use resources as they are released (no new acquisitions admitted).
    pub async fn close(&self) {
        let idle: Vec<Slot<T>> = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            state.closing = true;
            state.waiters.clear(); // dropped senders: receivers see a recv error, re-check state, see `closing`.
            state.idle.drain(..).collect()
        };
        for slot in idle {
            self.inner.factory.destroy(slot.resource).await;
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            state.total_destroyed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{system_clock, FakeClock};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct CountingFactory {
        created: AtomicU32,
        destroyed: AtomicU32,
        fail_create: std::sync::atomic::AtomicBool,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self { created: AtomicU32::new(0), destroyed: AtomicU32::new(0), fail_create: std::sync::atomic::AtomicBool::new(false) }
        }
    }

    #[async_trait::async_trait]
    impl ResourceFactory for CountingFactory {
        type Resource = u32;

        async fn create(&self, _ctx: &Context) -> Result<u32, RarfError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(RarfError::internal(std::io::Error::other("create failed")));
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn validate(&self, _resource: &mut u32, _ctx: &Context) -> bool {
            true
        }

        async fn destroy(&self, _resource: u32) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn options(max_size: u32, wait_queue_max: u32) -> PoolOptions {
        PoolOptions {
            min_size: 0,
            max_size,
            acquire_timeout: Duration::from_millis(200),
            wait_queue_max,
            ..PoolOptions::new("test-pool")
        }
    }

    #[tokio::test]
    async fn released_resource_is_reused_without_recreating() {
        let factory = CountingFactory::new();
        let pool = Pool::new(options(2, 8), factory, system_clock()).unwrap();

        let acquired = pool.acquire(&Context::new()).await.unwrap();
        acquired.release(true).await;
        let _acquired2 = pool.acquire(&Context::new()).await.unwrap();

        assert_eq!(pool.inner.factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unhealthy_release_destroys_and_recreates_on_next_acquire() {
        let factory = CountingFactory::new();
        let pool = Pool::new(options(2, 8), factory, system_clock()).unwrap();

        let acquired = pool.acquire(&Context::new()).await.unwrap();
        acquired.release(false).await;
        let _acquired2 = pool.acquire(&Context::new()).await.unwrap();

        assert_eq!(pool.inner.factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.inner.factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquire_beyond_wait_queue_max_is_rejected_as_exhausted() {
        let factory = CountingFactory::new();
        let pool = Pool::new(options(1, 0), factory, system_clock()).unwrap();

        let _held = pool.acquire(&Context::new()).await.unwrap();
        let err = pool.acquire(&Context::new()).await.unwrap_err();
        assert!(matches!(err, RarfError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn a_waiter_is_woken_when_the_holder_releases() {
        let factory = CountingFactory::new();
        let pool = Pool::new(options(1, 8), factory, system_clock()).unwrap();

        let held = pool.acquire(&Context::new()).await.unwrap();
        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire(&Context::new()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release(true).await;

        let acquired = waiter.await.expect("waiter task did not panic").expect("waiter eventually acquires");
        assert_eq!(pool.stats().active, 1);
        drop(acquired);
    }

    #[tokio::test]
    async fn acquire_past_deadline_times_out() {
        let factory = CountingFactory::new();
        let pool = Pool::new(options(1, 8), factory, system_clock()).unwrap();

        let _held = pool.acquire(&Context::new()).await.unwrap();
        let err = pool.acquire(&Context::new()).await.unwrap_err();
        assert!(matches!(err, RarfError::PoolTimeout { .. }));
    }

    #[tokio::test]
    async fn failed_creation_frees_the_reservation_for_the_next_attempt() {
        let factory = CountingFactory::new();
        factory.fail_create.store(true, Ordering::SeqCst);
        let pool = Pool::new(options(1, 8), factory, system_clock()).unwrap();

        assert!(pool.acquire(&Context::new()).await.is_err());
        assert_eq!(pool.stats().active, 0);

        pool.inner.factory.fail_create.store(false, Ordering::SeqCst);
        let acquired = pool.acquire(&Context::new()).await.unwrap();
        assert_eq!(pool.stats().active, 1);
        drop(acquired);
    }

    #[tokio::test]
    async fn close_drains_idle_resources() {
        let factory = CountingFactory::new();
        let pool = Pool::new(options(2, 8), factory, system_clock()).unwrap();
        let acquired = pool.acquire(&Context::new()).await.unwrap();
        acquired.release(true).await;

        pool.close().await;
        assert_eq!(pool.inner.factory.destroyed.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.acquire(&Context::new()).await.unwrap_err(), RarfError::PoolClosed { .. }));
    }

    #[tokio::test]
    async fn probe_idle_evicts_slots_idle_past_idle_timeout() {
        let factory = CountingFactory::new();
        let clock = Arc::new(FakeClock::new());
        let opts = PoolOptions { idle_timeout: Duration::from_secs(10), ..options(2, 8) };
        let pool = Pool::new(opts, factory, clock.clone()).unwrap();

        let acquired = pool.acquire(&Context::new()).await.unwrap();
        acquired.release(true).await;
        assert_eq!(pool.stats().idle, 1);

        clock.advance(Duration::from_secs(11));
        pool.probe_idle(&Context::new()).await;

        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.inner.factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn probe_idle_evicts_slots_past_max_lifetime_even_when_just_released() {
        let factory = CountingFactory::new();
        let clock = Arc::new(FakeClock::new());
        let opts = PoolOptions { max_lifetime: Duration::from_secs(10), ..options(2, 8) };
        let pool = Pool::new(opts, factory, clock.clone()).unwrap();

        let acquired = pool.acquire(&Context::new()).await.unwrap();
        clock.advance(Duration::from_secs(11));
        acquired.release(true).await;

        pool.probe_idle(&Context::new()).await;

        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.inner.factory.destroyed.load(Ordering::SeqCst), 1);
    }

    struct SlowValidateFactory {
        created: AtomicU32,
        notify: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl ResourceFactory for SlowValidateFactory {
        type Resource = u32;

        async fn create(&self, _ctx: &Context) -> Result<u32, RarfError> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn validate(&self, _resource: &mut u32, _ctx: &Context) -> bool {
            self.notify.notified().await;
            true
        }

        async fn destroy(&self, _resource: u32) {}
    }

    #[tokio::test]
    async fn a_slot_being_probed_still_counts_toward_total_so_acquire_cannot_overcommit() {
        let factory = SlowValidateFactory { created: AtomicU32::new(0), notify: tokio::sync::Notify::new() };
        let pool = Pool::new(options(1, 8), factory, system_clock()).unwrap();

        let acquired = pool.acquire(&Context::new()).await.unwrap();
        acquired.release(true).await;
        assert_eq!(pool.stats().idle, 1);

        let probe_pool = pool.clone();
        let probe = tokio::spawn(async move { probe_pool.probe_idle(&Context::new()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let state = pool.inner.state.lock().expect("pool mutex poisoned");
            assert_eq!(state.idle.len(), 0, "slot should be pulled out of idle while its validation is in flight");
            assert_eq!(state.total(), 1, "a probing slot must still count toward total, or a concurrent acquire could overcommit max_size");
        }

        pool.inner.factory.notify.notify_one();
        probe.await.expect("probe task did not panic");
    }
}
