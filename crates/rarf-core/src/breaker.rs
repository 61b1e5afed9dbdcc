//! Tri-state circuit breaker (§4.3). Transitions are serialized behind a
//! single short critical section; the wrapped callable always runs outside
//! it, mirroring the "transitions behind one mutex, factory call outside"
//! shape used by the pool.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::SharedClock;
use crate::config::BreakerOptions;
use crate::error::RarfError;
use crate::metrics::{self, SharedMetricsSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct State {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    cool_down: Duration,
    half_open_in_flight: bool,
    window_start: Instant,
}

struct Inner {
    name: String,
    options: BreakerOptions,
    state: Mutex<State>,
    metrics: SharedMetricsSink,
    clock: SharedClock,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

/// Outcome of `admit()`: either the caller may proceed (and must report
/// `on_success`/`on_failure` on the returned `Admission`), or the breaker is
/// open and the caller must fail fast.
pub enum Admission {
    Proceed(ProceedToken),
    Rejected,
}

/// Only `CircuitBreaker::admit` can construct one; `report` consumes it so a
/// caller cannot report twice against the same admitted call.
pub struct ProceedToken {
    is_probe: bool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, options: BreakerOptions, clock: SharedClock) -> Self {
        Self::with_metrics(name, options, clock, metrics::noop())
    }

    pub fn with_metrics(name: impl Into<String>, options: BreakerOptions, clock: SharedClock, metrics: SharedMetricsSink) -> Self {
        let cool_down = options.cool_down;
        let window_start = clock.now();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                options,
                state: Mutex::new(State {
                    state: BreakerState::Closed,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    opened_at: None,
                    next_probe_at: None,
                    cool_down,
                    half_open_in_flight: false,
                    window_start,
                }),
                metrics,
                clock,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut guard = self.inner.state.lock().expect("breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut guard);
        guard.state
    }

    fn maybe_transition_to_half_open(&self, state: &mut State) {
        if state.state == BreakerState::Open {
            if let Some(next) = state.next_probe_at {
                if self.inner.clock.now() >= next {
                    state.state = BreakerState::HalfOpen;
                    state.half_open_in_flight = false;
                    self.inner.metrics.counter(
                        "rarf_breaker_transition",
                        &[("breaker", &self.inner.name), ("to", "half_open")],
                        1,
                    );
                }
            }
        }
    }

    /// Attempt to admit a call. Forces a breaker-only path, independent of
    /// `call()`, for components (e.g. Pool) that need to gate acquisition
    /// itself rather than wrap a future.
    pub fn try_admit(&self) -> Admission {
        let mut state = self.inner.state.lock().expect("breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut state);

        match state.state {
            BreakerState::Closed => Admission::Proceed(ProceedToken { is_probe: false }),
            BreakerState::Open => {
                self.inner.metrics.counter("rarf_breaker_rejected", &[("breaker", &self.inner.name)], 1);
                Admission::Rejected
            }
            BreakerState::HalfOpen => {
                if state.half_open_in_flight {
                    self.inner.metrics.counter("rarf_breaker_rejected", &[("breaker", &self.inner.name)], 1);
                    Admission::Rejected
                } else {
                    state.half_open_in_flight = true;
                    Admission::Proceed(ProceedToken { is_probe: true })
                }
            }
        }
    }

    /// Force the breaker OPEN regardless of current state, used by the
    /// health coordinator when a checker reaches FAILING (§4.7).
    pub fn force_open(&self) {
        let mut state = self.inner.state.lock().expect("breaker mutex poisoned");
        if state.state != BreakerState::Open {
            self.trip(&mut state, self.inner.clock.now());
        }
    }

    pub fn report(&self, token: ProceedToken, success: bool) {
        if success {
            self.on_success(token.is_probe);
        } else {
            self.on_failure(token.is_probe);
        }
    }

    fn on_success(&self, was_probe: bool) {
        let mut state = self.inner.state.lock().expect("breaker mutex poisoned");
        match state.state {
            BreakerState::Closed => {
                state.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                state.half_open_in_flight = false;
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.inner.options.success_threshold {
                    state.state = BreakerState::Closed;
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.cool_down = self.inner.options.cool_down;
                    self.inner.metrics.counter(
                        "rarf_breaker_transition",
                        &[("breaker", &self.inner.name), ("to", "closed")],
                        1,
                    );
                }
            }
            BreakerState::Open => {
                debug_assert!(!was_probe, "cannot succeed while open without being a probe");
            }
        }
    }

    fn on_failure(&self, was_probe: bool) {
        let mut state = self.inner.state.lock().expect("breaker mutex poisoned");
        let now = self.inner.clock.now();
        match state.state {
            BreakerState::Closed => {
                if now.duration_since(state.window_start) > self.inner.options.rolling_window {
                    state.window_start = now;
                    state.consecutive_failures = 0;
                }
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.inner.options.failure_threshold {
                    self.trip(&mut state, now);
                }
            }
            BreakerState::HalfOpen => {
                state.half_open_in_flight = false;
                let next_cool_down = (state.cool_down.mul_f64(self.inner.options.backoff_factor))
                    .min(self.inner.options.cool_down_max);
                state.cool_down = next_cool_down;
                self.trip(&mut state, now);
            }
            BreakerState::Open => {
                debug_assert!(!was_probe);
            }
        }
    }

    fn trip(&self, state: &mut State, now: Instant) {
        state.state = BreakerState::Open;
        state.opened_at = Some(now);
        state.next_probe_at = Some(now + state.cool_down);
        state.consecutive_successes = 0;
        self.inner
            .metrics
            .counter("rarf_breaker_transition", &[("breaker", &self.inner.name), ("to", "open")], 1);
    }

    /// Wraps an async callable with the breaker, returning `BreakerOpen`
    /// without invoking `op` at all when the breaker rejects.
    pub async fn call<Fut, T, E>(&self, op: impl FnOnce() -> Fut) -> Result<T, RarfError>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
        E: Into<RarfError>,
    {
        let token = match self.try_admit() {
            Admission::Proceed(token) => token,
            Admission::Rejected => {
                return Err(RarfError::BreakerOpen { breaker: self.inner.name.clone() });
            }
        };
        let result = op().await;
        self.report(token, result.is_ok());
        result.map_err(Into::into)
    }
}
