//! Deterministic/jittered exponential backoff executor (§4.4), cancellation-
//! aware and honoring both a per-attempt and an overall deadline.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryOptions;
use crate::context::Context;
use crate::error::RarfError;

#[derive(Clone)]
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.options.factor.powi(attempt as i32 - 1);
        let base_ms = self.options.base_delay.as_millis() as f64 * exp;
        let capped_ms = base_ms.min(self.options.max_delay.as_millis() as f64);

        let jitter = self.options.jitter_fraction;
        let factor = if jitter <= 0.0 {
            1.0
        } else {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        };
        Duration::from_millis((capped_ms * factor).max(0.0) as u64)
    }

    /// Execute `op` up to `max_attempts` times. Stops immediately on a
    /// non-retryable error, on cancellation, or once the overall context
    /// deadline elapses. `op` is given a per-attempt context that also
    /// carries `per_attempt_timeout` if configured.
    pub async fn execute<Fut, T>(
        &self,
        ctx: &Context,
        mut op: impl FnMut(Context) -> Fut,
    ) -> Result<T, RarfError>
    where
        Fut: std::future::Future<Output = Result<T, RarfError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            ctx.check()?;

            let attempt_ctx = match self.options.per_attempt_timeout {
                Some(timeout) => ctx.child(Some(timeout)),
                None => ctx.clone(),
            };

            match op(attempt_ctx).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let is_last = attempt >= self.options.max_attempts;
                    if is_last || !self.options.is_retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after backoff");
                    match ctx.race(tokio::time::sleep(delay)).await {
                        Ok(()) => continue,
                        Err(cancelled) => return Err(cancelled),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn default_retryable_kinds_follows_is_retryable() {
        let policy = RetryPolicy::new(RetryOptions { max_attempts: 3, ..RetryOptions::default() });
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), RarfError> = policy
            .execute(&Context::new(), move |_ctx| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(RarfError::CacheMiss)
                }
            })
            .await;

        assert!(matches!(result, Err(RarfError::CacheMiss)));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "cache_miss is not in the default retryable set");
    }

    #[tokio::test]
    async fn retryable_kinds_override_widens_what_gets_retried() {
        let options = RetryOptions { max_attempts: 3, base_delay: Duration::from_millis(1), ..RetryOptions::default() }
            .with_retryable_kinds(Arc::new(|err| matches!(err, RarfError::CacheMiss)));
        let policy = RetryPolicy::new(options);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), RarfError> = policy
            .execute(&Context::new(), move |_ctx| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(RarfError::CacheMiss)
                }
            })
            .await;

        assert!(matches!(result, Err(RarfError::CacheMiss)));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "override should have made cache_miss retryable up to max_attempts");
    }
}
