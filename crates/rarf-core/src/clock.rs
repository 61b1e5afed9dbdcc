//! Injectable monotonic time source (§6.1), so pool/breaker/cache TTL math
//! can be driven deterministically in tests instead of racing the wall clock.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A monotonic time source. `SystemClock` wraps `Instant::now()`; `FakeClock`
/// lets tests advance time explicitly without sleeping.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock whose `now()` only moves when `advance` is called, used to test
/// TTL expiry, breaker cool-down, and backoff scheduling without real sleeps.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<Instant>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.inner.lock().expect("clock mutex poisoned");
        *guard += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.inner.lock().expect("clock mutex poisoned")
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
