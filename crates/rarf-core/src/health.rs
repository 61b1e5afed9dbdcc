//! Health & Recovery Coordinator (§4.7): one timer per registered checker,
//! consecutive-failure escalation into DEGRADED/FAILING, and rate-limited
//! recovery actions. FAILING forces the paired circuit breaker open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::breaker::CircuitBreaker;
use crate::config::HealthCheckerOptions;
use crate::context::Context;
use crate::error::RarfError;
use crate::metrics::{self, SharedMetricsSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Ok,
    Degraded,
    Failing,
}

/// A named, idempotent probe. `check` must be safe to call concurrently with
/// itself from other checkers but is never invoked concurrently with its own
/// previous run — the coordinator serializes a given checker against itself.
#[async_trait]
pub trait Checker: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn check(&self, ctx: &Context) -> Result<Duration, RarfError>;
}

/// A pluggable response to a checker reaching FAILING (§4.7). Modeled as a
/// tagged union rather than `dyn Fn` so the coordinator can log and
/// rate-limit by variant without boxing closures per registration.
pub enum RecoveryAction {
    RecyclePool(String),
    FlushCache(String),
    ReopenConnection(String),
    Noop,
}

/// Side effects a recovery action dispatches into; implemented by whatever
/// owns the named pool/cache/connection in the embedding application.
#[async_trait]
pub trait RecoveryHandler: Send + Sync + 'static {
    async fn recycle_pool(&self, name: &str) -> Result<(), RarfError>;
    async fn flush_cache(&self, name: &str) -> Result<(), RarfError>;
    async fn reopen_connection(&self, name: &str) -> Result<(), RarfError>;
}

struct Registration {
    checker: Arc<dyn Checker>,
    options: HealthCheckerOptions,
    action: RecoveryAction,
    breaker: Option<CircuitBreaker>,
    state: Mutex<CheckerState>,
}

struct CheckerState {
    health: HealthState,
    consecutive_failures: u32,
    last_run: Option<Instant>,
    running: bool,
    recoveries_in_window: u32,
    window_start: Instant,
}

/// Invoked with `(checker_name, previous, new)` on every health-state
/// transition a checker makes, in addition to the metric already emitted.
pub type TransitionHook = Arc<dyn Fn(&str, HealthState, HealthState) + Send + Sync>;

struct Inner {
    checkers: Mutex<HashMap<String, Arc<Registration>>>,
    recovery: Option<Arc<dyn RecoveryHandler>>,
    metrics: SharedMetricsSink,
    hooks: Mutex<Vec<TransitionHook>>,
}

#[derive(Clone)]
pub struct HealthCoordinator {
    inner: Arc<Inner>,
}

impl HealthCoordinator {
    pub fn new() -> Self {
        Self::with_recovery(None, metrics::noop())
    }

    pub fn with_recovery(recovery: Option<Arc<dyn RecoveryHandler>>, metrics: SharedMetricsSink) -> Self {
        Self { inner: Arc::new(Inner { checkers: Mutex::new(HashMap::new()), recovery, metrics, hooks: Mutex::new(Vec::new()) }) }
    }

    /// Register a callback invoked on every checker's health-state transition.
    pub fn on_transition(&self, hook: impl Fn(&str, HealthState, HealthState) + Send + Sync + 'static) {
        self.inner.hooks.lock().expect("health hooks mutex poisoned").push(Arc::new(hook));
    }

    fn notify_transition(&self, name: &str, previous: HealthState, new: HealthState) {
        for hook in self.inner.hooks.lock().expect("health hooks mutex poisoned").iter() {
            hook(name, previous, new);
        }
    }

    /// Register a checker. Returns a handle the caller uses to spawn the
    /// per-checker timer loop via `CheckerHandle::spawn`.
    pub fn register(
        &self,
        checker: Arc<dyn Checker>,
        options: HealthCheckerOptions,
        action: RecoveryAction,
        breaker: Option<CircuitBreaker>,
    ) -> CheckerHandle {
        let name = options.name.clone();
        let registration = Arc::new(Registration {
            checker,
            options,
            action,
            breaker,
            state: Mutex::new(CheckerState {
                health: HealthState::Ok,
                consecutive_failures: 0,
                last_run: None,
                running: false,
                recoveries_in_window: 0,
                window_start: Instant::now(),
            }),
        });
        self.inner.checkers.lock().expect("health registry mutex poisoned").insert(name, registration.clone());
        CheckerHandle { coordinator: self.clone(), registration }
    }

    pub fn state_of(&self, name: &str) -> Option<HealthState> {
        let checkers = self.inner.checkers.lock().expect("health registry mutex poisoned");
        let health = checkers.get(name)?.state.lock().expect("checker state mutex poisoned").health;
        Some(health)
    }

    /// An aggregate view over every registered checker's current state.
    pub fn status(&self) -> HashMap<String, HealthState> {
        let checkers = self.inner.checkers.lock().expect("health registry mutex poisoned");
        checkers
            .iter()
            .map(|(name, registration)| (name.clone(), registration.state.lock().expect("checker state mutex poisoned").health))
            .collect()
    }

    /// Run one probe for `registration` and apply the escalation rules. A
    /// checker already mid-run is skipped, never queued or run concurrently.
    async fn run_once(&self, registration: &Arc<Registration>) {
        {
            let mut state = registration.state.lock().expect("checker state mutex poisoned");
            if state.running {
                return;
            }
            state.running = true;
        }

        let ctx = Context::new().child(Some(registration.options.timeout));
        let timeout_ms = registration.options.timeout.as_millis() as u64;
        let outcome = match ctx.race(registration.checker.check(&ctx)).await {
            Ok(result) => result,
            Err(RarfError::DeadlineExceeded) => Err(RarfError::CheckTimeout {
                checker: registration.options.name.clone(),
                timeout_ms,
            }),
            Err(other) => Err(other),
        };

        let mut state = registration.state.lock().expect("checker state mutex poisoned");
        state.running = false;
        state.last_run = Some(Instant::now());

        match outcome {
            Ok(latency) => {
                self.inner.metrics.observe(
                    "rarf_health_check_latency_ms",
                    &[("checker", &registration.options.name)],
                    latency.as_secs_f64() * 1000.0,
                );
                let previous = state.health;
                state.consecutive_failures = 0;
                state.health = HealthState::Ok;
                if previous != HealthState::Ok {
                    self.inner.metrics.counter(
                        "rarf_health_transition",
                        &[("checker", &registration.options.name), ("to", "ok")],
                        1,
                    );
                    drop(state);
                    self.notify_transition(&registration.options.name, previous, HealthState::Ok);
                    // Breaker dynamics resume on their own via on_success/on_failure;
                    // FAILING only forces it open, it never forces it closed.
                }
            }
            Err(err) => {
                state.consecutive_failures += 1;
                let failures = state.consecutive_failures;
                let previous = state.health;

                state.health = if failures >= registration.options.failing_threshold {
                    HealthState::Failing
                } else if failures >= registration.options.degraded_threshold {
                    HealthState::Degraded
                } else {
                    previous
                };
                let new_health = state.health;

                if new_health != previous {
                    self.inner.metrics.counter(
                        "rarf_health_transition",
                        &[("checker", &registration.options.name), ("to", state_label(new_health))],
                        1,
                    );
                }

                tracing::warn!(checker = %registration.options.name, failures, error = %err, "health check failed");

                if new_health == HealthState::Failing {
                    if let Some(breaker) = &registration.breaker {
                        breaker.force_open();
                    }
                    self.maybe_recover(registration, &mut state);
                }
                drop(state);
                if new_health != previous {
                    self.notify_transition(&registration.options.name, previous, new_health);
                }
            }
        }
    }

    fn maybe_recover(&self, registration: &Arc<Registration>, state: &mut CheckerState) {
        let now = Instant::now();
        if now.duration_since(state.window_start) > registration.options.recovery_window {
            state.window_start = now;
            state.recoveries_in_window = 0;
        }
        if state.recoveries_in_window >= registration.options.max_recoveries_per_window {
            tracing::warn!(checker = %registration.options.name, "recovery rate limit reached, skipping action");
            return;
        }
        state.recoveries_in_window += 1;

        let Some(handler) = self.inner.recovery.clone() else { return };
        let registration = registration.clone();
        tokio::spawn(async move {
            let result = match &registration.action {
                RecoveryAction::RecyclePool(name) => handler.recycle_pool(name).await,
                RecoveryAction::FlushCache(name) => handler.flush_cache(name).await,
                RecoveryAction::ReopenConnection(name) => handler.reopen_connection(name).await,
                RecoveryAction::Noop => Ok(()),
            };
            if let Err(err) = result {
                tracing::warn!(checker = %registration.options.name, error = %err, "recovery action failed");
            }
        });
    }
}

impl Default for HealthCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn state_label(state: HealthState) -> &'static str {
    match state {
        HealthState::Ok => "ok",
        HealthState::Degraded => "degraded",
        HealthState::Failing => "failing",
    }
}

/// Owns the background timer loop for one registered checker.
pub struct CheckerHandle {
    coordinator: HealthCoordinator,
    registration: Arc<Registration>,
}

impl CheckerHandle {
    pub fn spawn(self) -> CheckerTask {
        let interval = self.registration.options.interval;
        let coordinator = self.coordinator;
        let registration = self.registration;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                coordinator.run_once(&registration).await;
            }
        });
        CheckerTask { task }
    }
}

pub struct CheckerTask {
    task: JoinHandle<()>,
}

impl Drop for CheckerTask {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::clock::system_clock;
    use crate::config::BreakerOptions;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyChecker {
        should_fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Checker for FlakyChecker {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn check(&self, _ctx: &Context) -> Result<Duration, RarfError> {
            if self.should_fail.load(Ordering::SeqCst) {
                Err(RarfError::internal(std::io::Error::other("probe failed")))
            } else {
                Ok(Duration::from_millis(1))
            }
        }
    }

    struct RecordingRecovery {
        recycle_calls: AtomicU32,
    }

    #[async_trait]
    impl RecoveryHandler for RecordingRecovery {
        async fn recycle_pool(&self, _name: &str) -> Result<(), RarfError> {
            self.recycle_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn flush_cache(&self, _name: &str) -> Result<(), RarfError> {
            Ok(())
        }
        async fn reopen_connection(&self, _name: &str) -> Result<(), RarfError> {
            Ok(())
        }
    }

    fn checker_options() -> HealthCheckerOptions {
        HealthCheckerOptions {
            degraded_threshold: 2,
            failing_threshold: 4,
            max_recoveries_per_window: 3,
            recovery_window: Duration::from_secs(300),
            ..HealthCheckerOptions::new("flaky")
        }
    }

    #[tokio::test]
    async fn consecutive_failures_escalate_ok_degraded_failing() {
        let coordinator = HealthCoordinator::new();
        let checker = Arc::new(FlakyChecker { should_fail: std::sync::atomic::AtomicBool::new(false) });
        let breaker = CircuitBreaker::new("flaky-breaker", BreakerOptions::default(), system_clock());
        let handle = coordinator.register(checker.clone(), checker_options(), RecoveryAction::Noop, Some(breaker.clone()));

        coordinator.run_once(&handle.registration).await;
        assert_eq!(coordinator.state_of("flaky"), Some(HealthState::Ok));

        checker.should_fail.store(true, Ordering::SeqCst);
        coordinator.run_once(&handle.registration).await;
        coordinator.run_once(&handle.registration).await;
        assert_eq!(coordinator.state_of("flaky"), Some(HealthState::Degraded));
        assert_eq!(breaker.state(), BreakerState::Closed);

        coordinator.run_once(&handle.registration).await;
        coordinator.run_once(&handle.registration).await;
        assert_eq!(coordinator.state_of("flaky"), Some(HealthState::Failing));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn failing_state_dispatches_rate_limited_recovery() {
        let recovery = Arc::new(RecordingRecovery { recycle_calls: AtomicU32::new(0) });
        let coordinator = HealthCoordinator::with_recovery(Some(recovery.clone()), metrics::noop());
        let checker = Arc::new(FlakyChecker { should_fail: std::sync::atomic::AtomicBool::new(true) });
        let mut options = checker_options();
        options.max_recoveries_per_window = 1;
        let handle = coordinator.register(checker, options, RecoveryAction::RecyclePool("db".into()), None);

        for _ in 0..6 {
            coordinator.run_once(&handle.registration).await;
        }
        tokio::task::yield_now().await;
        assert_eq!(coordinator.state_of("flaky"), Some(HealthState::Failing));
        assert_eq!(recovery.recycle_calls.load(Ordering::SeqCst), 1, "recovery must be rate-limited to one per window");
    }

    #[tokio::test]
    async fn recovering_to_ok_resets_failure_count() {
        let coordinator = HealthCoordinator::new();
        let checker = Arc::new(FlakyChecker { should_fail: std::sync::atomic::AtomicBool::new(true) });
        let handle = coordinator.register(checker.clone(), checker_options(), RecoveryAction::Noop, None);

        coordinator.run_once(&handle.registration).await;
        coordinator.run_once(&handle.registration).await;
        assert_eq!(coordinator.state_of("flaky"), Some(HealthState::Degraded));

        checker.should_fail.store(false, Ordering::SeqCst);
        coordinator.run_once(&handle.registration).await;
        assert_eq!(coordinator.state_of("flaky"), Some(HealthState::Ok));
    }

    #[tokio::test]
    async fn status_aggregates_distinct_checker_names() {
        let coordinator = HealthCoordinator::new();
        let ok_checker = Arc::new(FlakyChecker { should_fail: std::sync::atomic::AtomicBool::new(false) });
        let failing_checker = Arc::new(FlakyChecker { should_fail: std::sync::atomic::AtomicBool::new(true) });
        let ok_handle = coordinator.register(ok_checker, HealthCheckerOptions::new("ok-checker"), RecoveryAction::Noop, None);
        let failing_handle = coordinator.register(
            failing_checker,
            HealthCheckerOptions { failing_threshold: 1, degraded_threshold: 1, ..HealthCheckerOptions::new("failing-checker") },
            RecoveryAction::Noop,
            None,
        );

        coordinator.run_once(&ok_handle.registration).await;
        coordinator.run_once(&failing_handle.registration).await;

        let status = coordinator.status();
        assert_eq!(status.get("ok-checker"), Some(&HealthState::Ok));
        assert_eq!(status.get("failing-checker"), Some(&HealthState::Failing));
    }

    #[tokio::test]
    async fn on_transition_hook_fires_when_health_changes() {
        let coordinator = HealthCoordinator::new();
        let checker = Arc::new(FlakyChecker { should_fail: std::sync::atomic::AtomicBool::new(true) });
        let seen: Arc<Mutex<Vec<(HealthState, HealthState)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        coordinator.on_transition(move |_name, previous, new| {
            seen_clone.lock().expect("test mutex poisoned").push((previous, new));
        });
        let handle = coordinator.register(
            checker,
            HealthCheckerOptions { failing_threshold: 1, degraded_threshold: 1, ..checker_options() },
            RecoveryAction::Noop,
            None,
        );

        coordinator.run_once(&handle.registration).await;

        let seen = seen.lock().expect("test mutex poisoned");
        assert_eq!(*seen, vec![(HealthState::Ok, HealthState::Failing)]);
    }

    struct SlowChecker;

    #[async_trait]
    impl Checker for SlowChecker {
        fn name(&self) -> &str {
            "slow"
        }

        async fn check(&self, _ctx: &Context) -> Result<Duration, RarfError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Duration::from_millis(50))
        }
    }

    #[tokio::test]
    async fn a_checker_that_outruns_its_timeout_counts_as_a_failed_probe() {
        let coordinator = HealthCoordinator::new();
        let options = HealthCheckerOptions {
            timeout: Duration::from_millis(5),
            degraded_threshold: 1,
            ..HealthCheckerOptions::new("slow")
        };
        let handle = coordinator.register(Arc::new(SlowChecker), options, RecoveryAction::Noop, None);

        coordinator.run_once(&handle.registration).await;

        // The coordinator itself enforces `timeout` (via ctx.race), not just
        // whatever the checker implementation happens to respect, so a
        // checker that ignores cancellation still escalates on schedule.
        assert_eq!(coordinator.state_of("slow"), Some(HealthState::Degraded));
    }
}
