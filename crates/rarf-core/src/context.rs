//! Correlation context (§3, §5): the thing every public entry point accepts
//! so cancellation and deadlines propagate explicitly instead of being
//! dropped at an await point somewhere downstream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util_cancel::CancellationToken;
use uuid::Uuid;

use crate::error::RarfError;

/// Re-exported locally so call sites don't need a direct dependency on
/// `tokio-util` just for this one type; see `tokio_util_cancel` below.
mod tokio_util_cancel {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// A minimal cooperative cancellation primitive: a shared flag plus a
    /// `Notify` so waiters can be woken immediately instead of polling.
    #[derive(Clone)]
    pub struct CancellationToken {
        cancelled: Arc<AtomicBool>,
        notify: Arc<Notify>,
    }

    impl CancellationToken {
        pub fn new() -> Self {
            Self {
                cancelled: Arc::new(AtomicBool::new(false)),
                notify: Arc::new(Notify::new()),
            }
        }

        pub fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
            self.notify.notify_waiters();
        }

        pub fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }

        pub async fn cancelled(&self) {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    impl Default for CancellationToken {
        fn default() -> Self {
            Self::new()
        }
    }
}

/// `(trace_id, span_id, parent_span_id?, baggage, deadline?)` carried through
/// every async boundary. Cheap to clone: the cancellation token is shared via
/// `Arc`, everything else is small or copy.
#[derive(Clone)]
pub struct Context {
    trace_id: Uuid,
    span_id: Uuid,
    parent_span_id: Option<Uuid>,
    baggage: Arc<BTreeMap<String, String>>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl Context {
    /// A fresh root context with a new trace id and no deadline.
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            baggage: Arc::new(BTreeMap::new()),
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Derive a child context: new span id, same trace id and cancellation
    /// token (cancelling the parent cancels every child), same baggage, and
    /// the tighter of the parent's deadline and `deadline` if given.
    pub fn child(&self, deadline: Option<Duration>) -> Self {
        let mut child = self.clone();
        child.parent_span_id = Some(self.span_id);
        child.span_id = Uuid::new_v4();
        if let Some(d) = deadline {
            child.deadline = Some(tighter(self.deadline, Instant::now() + d));
        }
        child
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => tighter(Some(existing), deadline),
            None => deadline,
        });
        self
    }

    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.baggage).insert(key.into(), value.into());
        self
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn span_id(&self) -> Uuid {
        self.span_id
    }

    pub fn parent_span_id(&self) -> Option<Uuid> {
        self.parent_span_id
    }

    pub fn baggage(&self) -> &BTreeMap<String, String> {
        &self.baggage
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Signal cancellation to this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Check the context's liveness, returning the appropriate structured
    /// error if it has expired or been cancelled.
    pub fn check(&self) -> Result<(), RarfError> {
        if self.is_cancelled() {
            return Err(RarfError::ContextCancelled);
        }
        if self.is_expired() {
            return Err(RarfError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Race `fut` against this context's cancellation and deadline, whichever
    /// comes first. Every Pool/Cache/Idempotency suspension point uses this.
    pub async fn race<F, T>(&self, fut: F) -> Result<T, RarfError>
    where
        F: std::future::Future<Output = T>,
    {
        self.check()?;
        let cancelled = self.cancellation.cancelled();
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    out = fut => Ok(out),
                    _ = cancelled => Err(RarfError::ContextCancelled),
                    _ = tokio::time::sleep_until(deadline.into()) => Err(RarfError::DeadlineExceeded),
                }
            }
            None => {
                tokio::select! {
                    out = fut => Ok(out),
                    _ = cancelled => Err(RarfError::ContextCancelled),
                }
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn tighter(existing: Option<Instant>, candidate: Instant) -> Instant {
    match existing {
        Some(existing) => existing.min(candidate),
        None => candidate,
    }
}
