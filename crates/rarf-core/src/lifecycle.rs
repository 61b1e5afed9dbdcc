//! Lifecycle Registry (§4.8): components register with a declared
//! dependency list; start-up runs in topological order and tears down in
//! reverse, with per-component deadlines on shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::context::Context;
use crate::error::RarfError;

#[async_trait]
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn start(&self, ctx: &Context) -> Result<(), RarfError>;
    async fn stop(&self, ctx: &Context) -> Result<(), RarfError>;
}

struct Registration {
    component: Arc<dyn Component>,
    depends_on: Vec<String>,
    stop_deadline: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistryState {
    Registering,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct Inner {
    registrations: Vec<Registration>,
    started_order: Vec<usize>,
    state: RegistryState,
}

/// Not `Clone` on purpose: exactly one registry should own the start/stop
/// sequence for a given process, guarded by its own lock so a re-entrant
/// `start` is rejected rather than racing the first one.
pub struct LifecycleRegistry {
    inner: Mutex<Inner>,
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { registrations: Vec::new(), started_order: Vec::new(), state: RegistryState::Registering }) }
    }

    /// Register a component with its dependency names. Must be called before
    /// `start_all`; panics in spirit would be wrong for a library, so this
    /// returns an error instead if called after start-up begins.
    pub async fn register(&self, component: Arc<dyn Component>, depends_on: Vec<String>) -> Result<(), RarfError> {
        let mut inner = self.inner.lock().await;
        if inner.state != RegistryState::Registering {
            return Err(RarfError::internal(std::io::Error::other("cannot register a component after start_all has run")));
        }
        inner.registrations.push(Registration { component, depends_on, stop_deadline: Duration::from_secs(10) });
        Ok(())
    }

    pub async fn register_with_stop_deadline(&self, component: Arc<dyn Component>, depends_on: Vec<String>, stop_deadline: Duration) -> Result<(), RarfError> {
        let mut inner = self.inner.lock().await;
        if inner.state != RegistryState::Registering {
            return Err(RarfError::internal(std::io::Error::other("cannot register a component after start_all has run")));
        }
        inner.registrations.push(Registration { component, depends_on, stop_deadline });
        Ok(())
    }

    fn topological_order(registrations: &[Registration]) -> Result<Vec<usize>, RarfError> {
        let index_of: HashMap<&str, usize> = registrations.iter().enumerate().map(|(i, r)| (r.component.name(), i)).collect();

        let mut order = Vec::with_capacity(registrations.len());
        let mut visited = vec![false; registrations.len()];
        let mut in_progress = vec![false; registrations.len()];

        fn visit(
            idx: usize,
            registrations: &[Registration],
            index_of: &HashMap<&str, usize>,
            visited: &mut [bool],
            in_progress: &mut [bool],
            order: &mut Vec<usize>,
        ) -> Result<(), RarfError> {
            if visited[idx] {
                return Ok(());
            }
            if in_progress[idx] {
                return Err(RarfError::internal(std::io::Error::other(format!(
                    "dependency cycle detected involving component '{}'",
                    registrations[idx].component.name()
                ))));
            }
            in_progress[idx] = true;
            for dep in &registrations[idx].depends_on {
                let &dep_idx = index_of.get(dep.as_str()).ok_or_else(|| {
                    RarfError::internal(std::io::Error::other(format!(
                        "component '{}' depends on unregistered component '{}'",
                        registrations[idx].component.name(),
                        dep
                    )))
                })?;
                visit(dep_idx, registrations, index_of, visited, in_progress, order)?;
            }
            in_progress[idx] = false;
            visited[idx] = true;
            order.push(idx);
            Ok(())
        }

        for idx in 0..registrations.len() {
            visit(idx, registrations, &index_of, &mut visited, &mut in_progress, &mut order)?;
        }
        Ok(order)
    }

    /// Start every registered component in dependency order. On the first
    /// failure, already-started components are torn down in reverse order
    /// and the triggering error is returned.
    pub async fn start_all(&self, ctx: &Context) -> Result<(), RarfError> {
        let mut inner = self.inner.lock().await;
        if inner.state != RegistryState::Registering {
            return Err(RarfError::internal(std::io::Error::other("start_all already ran")));
        }
        inner.state = RegistryState::Starting;
        let order = Self::topological_order(&inner.registrations)?;

        for &idx in &order {
            let component = inner.registrations[idx].component.clone();
            match component.start(ctx).await {
                Ok(()) => {
                    inner.started_order.push(idx);
                    tracing::info!(component = component.name(), "component started");
                }
                Err(err) => {
                    tracing::error!(component = component.name(), error = %err, "component failed to start, rolling back");
                    let started = std::mem::take(&mut inner.started_order);
                    for rollback_idx in started.into_iter().rev() {
                        let component = inner.registrations[rollback_idx].component.clone();
                        let deadline = inner.registrations[rollback_idx].stop_deadline;
                        let stop_ctx = ctx.child(Some(deadline));
                        if let Err(stop_err) = component.stop(&stop_ctx).await {
                            tracing::error!(component = component.name(), error = %stop_err, "rollback stop failed");
                        }
                    }
                    inner.state = RegistryState::Stopped;
                    return Err(err);
                }
            }
        }

        inner.state = RegistryState::Running;
        Ok(())
    }

    /// Stop every started component in reverse start order. Idempotent: a
    /// second call after the registry is already stopped is a no-op.
    pub async fn stop_all(&self, ctx: &Context) -> Result<(), RarfError> {
        let mut inner = self.inner.lock().await;
        if inner.state == RegistryState::Stopped {
            return Ok(());
        }
        inner.state = RegistryState::Stopping;
        let started = std::mem::take(&mut inner.started_order);

        let mut first_error = None;
        for idx in started.into_iter().rev() {
            let component = inner.registrations[idx].component.clone();
            let deadline = inner.registrations[idx].stop_deadline;
            let stop_ctx = ctx.child(Some(deadline));
            let stop_result = stop_ctx.race(component.stop(&stop_ctx)).await;
            match stop_result {
                Ok(Ok(())) => tracing::info!(component = component.name(), "component stopped"),
                Ok(Err(err)) => {
                    tracing::error!(component = component.name(), error = %err, "component stop failed");
                    first_error.get_or_insert(err);
                }
                Err(timeout_err) => {
                    tracing::error!(component = component.name(), error = %timeout_err, "component stop exceeded deadline, abandoning");
                    first_error.get_or_insert(timeout_err);
                }
            }
        }

        inner.state = RegistryState::Stopped;
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn registered_names(&self) -> HashSet<String> {
        let inner = self.inner.lock().await;
        inner.registrations.iter().map(|r| r.component.name().to_string()).collect()
    }
}

impl Default for LifecycleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
