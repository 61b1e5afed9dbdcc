use std::time::Duration;

use tokio::task::JoinHandle;

use super::{Pool, ResourceFactory};
use crate::context::Context;

/// Owns the background task that drives `Pool::sweep_once` on
/// `health_check_interval`. Dropping the handle aborts the task, the same
/// shutdown shape as the other periodic loops in this codebase.
pub struct SweepHandle {
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn spawn<T, F>(pool: Pool<T, F>, interval: Duration) -> Self
    where
        T: Send + 'static,
        F: ResourceFactory<Resource = T>,
    {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let ctx = Context::new();
                pool.sweep_once(&ctx).await;
            }
        });
        Self { task }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
