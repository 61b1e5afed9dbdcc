//! Idempotency store (§4.6): at most one PENDING record per key, monotonic
//! PENDING → COMPLETED|FAILED transitions, and a striped lock table so no
//! two keys ever contend on the same mutex.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;

use crate::clock::SharedClock;
use crate::config::IdempotencyOptions;
use crate::context::Context;
use crate::error::RarfError;
use crate::metrics::{self, SharedMetricsSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Completed,
    Failed,
}

impl RecordState {
    fn label(self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Completed => "completed",
            RecordState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub state: RecordState,
    pub result: Option<Vec<u8>>,
    pub error_kind: Option<String>,
}

struct Entry {
    state: RecordState,
    created_at: Instant,
    completed_at: Option<Instant>,
    ttl: std::time::Duration,
    result: Option<Vec<u8>>,
    error_kind: Option<String>,
    notify: Arc<Notify>,
}

impl Entry {
    fn to_record(&self) -> IdempotencyRecord {
        IdempotencyRecord { state: self.state, result: self.result.clone(), error_kind: self.error_kind.clone() }
    }
}

/// Issued by `begin`; the only way to call `complete`/`fail` for a key.
/// Holding a `Lease` does not grant exclusive access forever — it is
/// single-use, consumed by whichever of `complete`/`fail` is called first.
#[derive(Debug)]
pub struct Lease {
    key: String,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

struct Inner {
    name: String,
    options: IdempotencyOptions,
    stripes: Vec<Mutex<HashMap<String, Entry>>>,
    mask_is_pow2: bool,
    clock: SharedClock,
    metrics: SharedMetricsSink,
}

#[derive(Clone)]
pub struct IdempotencyStore {
    inner: Arc<Inner>,
}

impl IdempotencyStore {
    pub fn new(name: impl Into<String>, options: IdempotencyOptions, clock: SharedClock) -> Self {
        Self::with_metrics(name, options, clock, metrics::noop())
    }

    pub fn with_metrics(name: impl Into<String>, options: IdempotencyOptions, clock: SharedClock, metrics: SharedMetricsSink) -> Self {
        let stripe_count = options.stripe_count.max(1);
        let stripes = (0..stripe_count).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                mask_is_pow2: stripe_count.is_power_of_two(),
                options,
                stripes,
                clock,
                metrics,
            }),
        }
    }

    fn stripe_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish() as usize;
        if self.inner.mask_is_pow2 {
            hash & (self.inner.stripes.len() - 1)
        } else {
            hash % self.inner.stripes.len()
        }
    }

    /// Converts a stuck PENDING entry (past `pending_timeout`) to
    /// FAILED(timeout) in place, and reports whether `entry` is expired and
    /// should be dropped. Must be called with the stripe lock held.
    fn normalize(&self, entry: &mut Entry, now: Instant) -> bool {
        if entry.state == RecordState::Pending && now.duration_since(entry.created_at) > self.inner.options.pending_timeout {
            entry.state = RecordState::Failed;
            entry.completed_at = Some(now);
            entry.error_kind = Some("timeout".to_string());
            entry.notify.notify_waiters();
        }
        match entry.state {
            RecordState::Pending => false,
            RecordState::Completed | RecordState::Failed => {
                entry.completed_at.is_some_and(|c| now.duration_since(c) >= entry.ttl)
            }
        }
    }

    /// Insert a PENDING record for `key`, or report the conflicting state of
    /// whatever is already there.
    pub fn begin(&self, key: impl Into<String>, ttl: Option<std::time::Duration>) -> Result<Lease, RarfError> {
        let key = key.into();
        let idx = self.stripe_index(&key);
        let now = self.inner.clock.now();
        let mut stripe = self.inner.stripes[idx].lock().expect("idempotency stripe mutex poisoned");

        if let Some(entry) = stripe.get_mut(&key) {
            let expired = self.normalize(entry, now);
            if expired {
                stripe.remove(&key);
            } else if entry.state == RecordState::Failed && entry.error_kind.as_deref() == Some("timeout") {
                self.inner.metrics.counter("rarf_idempotency_conflict", &[("store", &self.inner.name)], 1);
                return Err(RarfError::IdempotencyTimeout);
            } else {
                self.inner.metrics.counter("rarf_idempotency_conflict", &[("store", &self.inner.name)], 1);
                return Err(RarfError::IdempotencyConflict { state: entry.state.label() });
            }
        }

        stripe.insert(
            key.clone(),
            Entry {
                state: RecordState::Pending,
                created_at: now,
                completed_at: None,
                ttl: ttl.unwrap_or(self.inner.options.default_ttl),
                result: None,
                error_kind: None,
                notify: Arc::new(Notify::new()),
            },
        );
        Ok(Lease { key })
    }

    pub fn complete(&self, lease: Lease, result: Vec<u8>) -> Result<(), RarfError> {
        self.finish(lease, RecordState::Completed, Some(result), None)
    }

    pub fn fail(&self, lease: Lease, error_kind: impl Into<String>) -> Result<(), RarfError> {
        self.finish(lease, RecordState::Failed, None, Some(error_kind.into()))
    }

    fn finish(&self, lease: Lease, state: RecordState, result: Option<Vec<u8>>, error_kind: Option<String>) -> Result<(), RarfError> {
        let idx = self.stripe_index(&lease.key);
        let now = self.inner.clock.now();
        let mut stripe = self.inner.stripes[idx].lock().expect("idempotency stripe mutex poisoned");
        let entry = stripe
            .get_mut(&lease.key)
            .ok_or_else(|| RarfError::internal(std::io::Error::other(format!("no pending record for key '{}'", lease.key))))?;
        if entry.state != RecordState::Pending {
            return Err(RarfError::IdempotencyConflict { state: entry.state.label() });
        }
        entry.state = state;
        entry.completed_at = Some(now);
        entry.result = result;
        entry.error_kind = error_kind;
        entry.notify.notify_waiters();
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        let idx = self.stripe_index(key);
        let now = self.inner.clock.now();
        let mut stripe = self.inner.stripes[idx].lock().expect("idempotency stripe mutex poisoned");
        let entry = stripe.get_mut(key)?;
        if self.normalize(entry, now) {
            stripe.remove(key);
            return None;
        }
        Some(stripe.get(key).unwrap().to_record())
    }

    /// Subscribe to the outcome of whatever is currently PENDING for `key`.
    /// Returns immediately if the key is already terminal or absent.
    pub async fn await_completion(&self, ctx: &Context, key: &str) -> Result<IdempotencyRecord, RarfError> {
        loop {
            ctx.check()?;
            let notify = {
                let idx = self.stripe_index(key);
                let now = self.inner.clock.now();
                let mut stripe = self.inner.stripes[idx].lock().expect("idempotency stripe mutex poisoned");
                let Some(entry) = stripe.get_mut(key) else {
                    return Err(RarfError::IdempotencyConflict { state: "absent" });
                };
                if self.normalize(entry, now) {
                    stripe.remove(key);
                    return Err(RarfError::IdempotencyConflict { state: "absent" });
                }
                match entry.state {
                    RecordState::Pending => entry.notify.clone(),
                    RecordState::Completed | RecordState::Failed => return Ok(entry.to_record()),
                }
            };
            ctx.race(notify.notified()).await?;
        }
    }

    /// Remove every expired entry (stuck-PENDING past its safety timeout, or
    /// terminal entries past their TTL) across every stripe.
    pub fn sweep(&self) -> usize {
        let now = self.inner.clock.now();
        let mut removed = 0;
        for stripe in &self.inner.stripes {
            let mut stripe = stripe.lock().expect("idempotency stripe mutex poisoned");
            let expired: Vec<String> = stripe
                .iter_mut()
                .filter_map(|(key, entry)| self.normalize(entry, now).then(|| key.clone()))
                .collect();
            for key in expired {
                stripe.remove(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            self.inner.metrics.counter("rarf_idempotency_swept", &[("store", &self.inner.name)], removed as u64);
        }
        removed
    }
}

/// Owns the background task driving `IdempotencyStore::sweep` on
/// `sweep_interval`; dropping it aborts the task.
pub struct IdempotencySweepHandle {
    task: tokio::task::JoinHandle<()>,
}

impl IdempotencySweepHandle {
    pub fn spawn(store: IdempotencyStore, interval: std::time::Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep();
            }
        });
        Self { task }
    }
}

impl Drop for IdempotencySweepHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::time::Duration;

    fn store_with(options: IdempotencyOptions) -> (IdempotencyStore, FakeClock) {
        let clock = FakeClock::new();
        let store = IdempotencyStore::new("orders", options, Arc::new(clock.clone()));
        (store, clock)
    }

    #[test]
    fn second_begin_for_a_pending_key_conflicts() {
        let (store, _clock) = store_with(IdempotencyOptions::default());
        let _lease = store.begin("order-1", None).expect("first begin succeeds");
        let err = store.begin("order-1", None).unwrap_err();
        assert!(matches!(err, RarfError::IdempotencyConflict { state: "pending" }));
    }

    #[test]
    fn replay_after_completion_returns_conflict_with_completed_state() {
        let (store, _clock) = store_with(IdempotencyOptions::default());
        let lease = store.begin("order-1", None).unwrap();
        store.complete(lease, b"receipt-123".to_vec()).unwrap();

        let record = store.get("order-1").expect("completed record still present");
        assert_eq!(record.state, RecordState::Completed);
        assert_eq!(record.result.as_deref(), Some(b"receipt-123".as_slice()));

        let err = store.begin("order-1", None).unwrap_err();
        assert!(matches!(err, RarfError::IdempotencyConflict { state: "completed" }));
    }

    #[test]
    fn stuck_pending_past_timeout_normalizes_to_failed() {
        let options = IdempotencyOptions { pending_timeout: Duration::from_secs(10), ..IdempotencyOptions::default() };
        let (store, clock) = store_with(options);
        let _lease = store.begin("order-1", None).unwrap();

        clock.advance(Duration::from_secs(11));
        let record = store.get("order-1").expect("normalized entry still present until its own ttl");
        assert_eq!(record.state, RecordState::Failed);
        assert_eq!(record.error_kind.as_deref(), Some("timeout"));

        // A fresh attempt must still be rejected (failed is terminal, not a
        // licence to retry silently) until the entry's own TTL expires it;
        // the taxonomy calls this case out specifically rather than folding
        // it into the generic conflict.
        let err = store.begin("order-1", None).unwrap_err();
        assert!(matches!(err, RarfError::IdempotencyTimeout));
    }

    #[test]
    fn entries_past_ttl_are_swept_and_reusable() {
        let options = IdempotencyOptions { default_ttl: Duration::from_secs(5), ..IdempotencyOptions::default() };
        let (store, clock) = store_with(options);
        let lease = store.begin("order-1", None).unwrap();
        store.complete(lease, Vec::new()).unwrap();

        clock.advance(Duration::from_secs(6));
        assert_eq!(store.sweep(), 1);
        assert!(store.get("order-1").is_none());

        // Once swept, the key is free again.
        store.begin("order-1", None).expect("key reusable after sweep");
    }

    #[tokio::test]
    async fn await_completion_wakes_once_the_leader_finishes() {
        let (store, _clock) = store_with(IdempotencyOptions::default());
        let lease = store.begin("order-1", None).unwrap();

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move { waiter_store.await_completion(&Context::new(), "order-1").await });

        tokio::task::yield_now().await;
        store.complete(lease, b"done".to_vec()).unwrap();

        let record = waiter.await.expect("waiter task did not panic").expect("await_completion succeeds");
        assert_eq!(record.state, RecordState::Completed);
    }
}
