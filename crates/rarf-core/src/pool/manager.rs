//! Named registry over same-typed pools (§6.2). An embedding application
//! typically owns one `PoolManager` per resource kind (one for Postgres
//! connections, one for Redis) and looks pools up by name at call sites
//! instead of threading a `Pool<T, F>` value through the whole call graph.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{Pool, ResourceFactory};
use crate::error::RarfError;

pub struct PoolManager<T: Send + 'static, F: ResourceFactory<Resource = T>> {
    pools: Mutex<HashMap<String, Pool<T, F>>>,
}

impl<T: Send + 'static, F: ResourceFactory<Resource = T>> PoolManager<T, F> {
    pub fn new() -> Self {
        Self { pools: Mutex::new(HashMap::new()) }
    }

    /// Register a pool under `name`, replacing any pool already registered
    /// there (the replaced pool is not closed — the caller still owns it).
    pub fn register_pool(&self, name: impl Into<String>, pool: Pool<T, F>) {
        self.pools.lock().expect("pool manager mutex poisoned").insert(name.into(), pool);
    }

    pub fn get_pool(&self, name: &str) -> Result<Pool<T, F>, RarfError> {
        self.pools
            .lock()
            .expect("pool manager mutex poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| RarfError::PoolUnavailable { pool: name.to_string() })
    }

    pub fn names(&self) -> Vec<String> {
        self.pools.lock().expect("pool manager mutex poisoned").keys().cloned().collect()
    }

    /// Close and drop every registered pool.
    pub async fn close_all(&self) {
        let pools: Vec<Pool<T, F>> = self.pools.lock().expect("pool manager mutex poisoned").drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close().await;
        }
    }
}

impl<T: Send + 'static, F: ResourceFactory<Resource = T>> Default for PoolManager<T, F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::config::PoolOptions;
    use crate::context::Context;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingFactory {
        created: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ResourceFactory for CountingFactory {
        type Resource = u32;

        async fn create(&self, _ctx: &Context) -> Result<u32, RarfError> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn validate(&self, _resource: &mut u32, _ctx: &Context) -> bool {
            true
        }

        async fn destroy(&self, _resource: u32) {}
    }

    #[test]
    fn get_pool_on_an_unknown_name_is_pool_unavailable() {
        let manager: PoolManager<u32, CountingFactory> = PoolManager::new();
        assert!(matches!(manager.get_pool("db"), Err(RarfError::PoolUnavailable { .. })));
    }

    #[tokio::test]
    async fn get_pool_returns_the_pool_registered_under_that_name() {
        let manager = PoolManager::new();
        let pool = Pool::new(PoolOptions::new("db"), CountingFactory { created: AtomicU32::new(0) }, system_clock()).unwrap();
        manager.register_pool("db", pool.clone());

        let fetched = manager.get_pool("db").unwrap();
        let acquired = fetched.acquire(&Context::new()).await.unwrap();
        drop(acquired);
        assert_eq!(manager.names(), vec!["db".to_string()]);
    }
}
