//! Hierarchical L1/L2 cache (§4.5): a sharded, LRU-evicting in-process map
//! backed optionally by a durable L2 store for demotion/promotion, with
//! single-flight load fan-in and ascending-lock-order transactions.

mod l2;
mod shard;
mod single_flight;
mod transaction;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::config::CacheOptions;
use crate::context::Context;
use crate::error::RarfError;
use crate::metrics::{self, SharedMetricsSink};

pub use l2::L2Backend;
pub use transaction::Transaction;

/// Which layer, if any, satisfied a `get`. Carried back to the caller so
/// hit-rate metrics and tests can distinguish an L1 hit from an L2 promotion
/// without a miss ever being an error in its own right (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitLayer {
    L1,
    L2,
    Miss,
}

use shard::{GetOutcome, Shard};
use single_flight::SingleFlight;
use transaction::Op;

struct Inner {
    name: String,
    options: CacheOptions,
    shards: Vec<Mutex<Shard>>,
    mask: usize,
    clock: SharedClock,
    metrics: SharedMetricsSink,
    l2: Option<Arc<dyn L2Backend>>,
    single_flight: SingleFlight,
}

/// A hierarchical cache instance. Cheap to clone; every clone shares the
/// same shards, L2 backend, and in-flight load table.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub l1_entries: usize,
    pub l1_bytes: usize,
}

impl Cache {
    pub fn new(name: impl Into<String>, options: CacheOptions, clock: SharedClock) -> Result<Self, RarfError> {
        Self::with_backend(name, options, clock, metrics::noop(), None)
    }

    pub fn with_backend(
        name: impl Into<String>,
        options: CacheOptions,
        clock: SharedClock,
        metrics: SharedMetricsSink,
        l2: Option<Arc<dyn L2Backend>>,
    ) -> Result<Self, RarfError> {
        options.validate()?;
        if options.enable_l2 && l2.is_none() {
            return Err(RarfError::ConfigInvalid {
                option: "enable_l2",
                reason: "set but no L2Backend was supplied".into(),
            });
        }
        let shard_count = options.shard_count;
        let shards = (0..shard_count).map(|_| Mutex::new(Shard::new())).collect();
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                mask: shard_count - 1,
                options,
                shards,
                clock,
                metrics,
                l2,
                single_flight: SingleFlight::new(),
            }),
        })
    }

    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & self.inner.mask
    }

    fn ttl_to_instant(&self, ttl: Option<Duration>) -> Option<std::time::Instant> {
        Some(self.inner.clock.now() + ttl.unwrap_or(self.inner.options.default_ttl))
    }

    /// L1 lookup, falling through to L2 (and promoting on hit) when L1
    /// misses. A miss is reported as `(None, HitLayer::Miss)`, never as an
    /// error — callers that want fail-on-miss convenience use `get_or_err`.
    pub async fn get(&self, ctx: &Context, key: &[u8]) -> Result<(Option<Vec<u8>>, HitLayer), RarfError> {
        ctx.check()?;
        let idx = self.shard_index(key);
        let now = self.inner.clock.now();

        let l1_outcome = {
            let mut shard = self.inner.shards[idx].lock().expect("cache shard mutex poisoned");
            shard.get(key, now)
        };

        match l1_outcome {
            GetOutcome::Hit(value) => {
                self.inner.metrics.counter("rarf_cache_hit", &[("cache", &self.inner.name), ("layer", "l1")], 1);
                return Ok((Some(value), HitLayer::L1));
            }
            GetOutcome::Expired | GetOutcome::Miss => {}
        }

        let Some(l2) = self.inner.l2.clone() else {
            self.inner.metrics.counter("rarf_cache_miss", &[("cache", &self.inner.name)], 1);
            return Ok((None, HitLayer::Miss));
        };

        match ctx.race(l2.get(key)).await?? {
            Some((value, expires_at_ms)) => {
                self.inner.metrics.counter("rarf_cache_hit", &[("cache", &self.inner.name), ("layer", "l2")], 1);
                let expires_at = expires_at_ms.map(|ms| epoch_ms_to_instant(ms, self.inner.clock.now()));
                self.promote(idx, key.to_vec(), value.clone(), expires_at);
                Ok((Some(value), HitLayer::L2))
            }
            None => {
                self.inner.metrics.counter("rarf_cache_miss", &[("cache", &self.inner.name)], 1);
                Ok((None, HitLayer::Miss))
            }
        }
    }

    /// Fail-on-miss convenience over `get`: lifts `HitLayer::Miss` to
    /// `CacheMiss` for callers that want a plain `Result<Vec<u8>, _>`.
    pub async fn get_or_err(&self, ctx: &Context, key: &[u8]) -> Result<Vec<u8>, RarfError> {
        match self.get(ctx, key).await? {
            (Some(value), _) => Ok(value),
            (None, _) => Err(RarfError::CacheMiss),
        }
    }

    fn promote(&self, idx: usize, key: Vec<u8>, value: Vec<u8>, expires_at: Option<std::time::Instant>) {
        let now = self.inner.clock.now();
        let evicted = {
            let mut shard = self.inner.shards[idx].lock().expect("cache shard mutex poisoned");
            shard.put(key, value, expires_at, now, self.inner.options.l1_max_entries, self.inner.options.l1_max_bytes)
        };
        self.demote(evicted);
    }

    fn demote(&self, evicted: Vec<(Vec<u8>, Vec<u8>, Option<std::time::Instant>)>) {
        if evicted.is_empty() || !self.inner.options.enable_demotion {
            return;
        }
        let Some(l2) = self.inner.l2.clone() else { return };
        let now = self.inner.clock.now();
        for (key, value, expires_at) in evicted {
            let expires_at_ms = expires_at.map(|e| instant_to_epoch_ms(e, now));
            let l2 = l2.clone();
            tokio::spawn(async move {
                let _ = l2.put(&key, &value, expires_at_ms).await;
            });
        }
    }

    pub async fn put(&self, ctx: &Context, key: &[u8], value: &[u8], ttl: Option<Duration>) -> Result<(), RarfError> {
        ctx.check()?;
        let needed_bytes = key.len() + value.len();
        if needed_bytes > self.inner.options.l1_max_bytes {
            return Err(RarfError::CacheCapacityExceeded { needed_bytes, budget_bytes: self.inner.options.l1_max_bytes });
        }
        let idx = self.shard_index(key);
        let expires_at = self.ttl_to_instant(ttl);
        let evicted = {
            let mut shard = self.inner.shards[idx].lock().expect("cache shard mutex poisoned");
            shard.put(
                key.to_vec(),
                value.to_vec(),
                expires_at,
                self.inner.clock.now(),
                self.inner.options.l1_max_entries,
                self.inner.options.l1_max_bytes,
            )
        };
        self.demote(evicted);

        if self.inner.options.write_through {
            if let Some(l2) = self.inner.l2.clone() {
                let expires_at_ms = expires_at.map(|e| instant_to_epoch_ms(e, self.inner.clock.now()));
                ctx.race(l2.put(key, value, expires_at_ms)).await??;
            }
        }
        Ok(())
    }

    pub async fn delete(&self, ctx: &Context, key: &[u8]) -> Result<(), RarfError> {
        ctx.check()?;
        let idx = self.shard_index(key);
        {
            let mut shard = self.inner.shards[idx].lock().expect("cache shard mutex poisoned");
            shard.delete(key);
        }
        if let Some(l2) = self.inner.l2.clone() {
            ctx.race(l2.delete(key)).await??;
        }
        Ok(())
    }

    /// Fan concurrent misses for `key` into a single call to `loader`, then
    /// populate L1 (and L2, if write-through) with the result.
    pub async fn get_or_load<F>(&self, ctx: &Context, key: &[u8], ttl: Option<Duration>, loader: F) -> Result<Arc<Vec<u8>>, RarfError>
    where
        F: std::future::Future<Output = Result<Vec<u8>, RarfError>> + Send + 'static,
    {
        match self.get(ctx, key).await? {
            (Some(value), _) => return Ok(Arc::new(value)),
            (None, _) => {}
        }

        let this = self.clone();
        let key_owned = key.to_vec();
        let ttl_owned = ttl;
        let ctx_owned = ctx.clone();
        self.single_flight(key, async move {
            let loaded = loader.await?;
            this.put(&ctx_owned, &key_owned, &loaded, ttl_owned).await?;
            Ok(loaded)
        })
        .await
    }

    /// Fan concurrent loads for `key` into a single call to `loader`,
    /// guaranteeing at-most-one concurrent loader per key (§4.5). Unlike
    /// `get_or_load`, this does not itself read or populate L1/L2 — it is
    /// the bare coalescing primitive for callers that manage storage
    /// themselves.
    pub async fn single_flight<F>(&self, key: &[u8], loader: F) -> Result<Arc<Vec<u8>>, RarfError>
    where
        F: std::future::Future<Output = Result<Vec<u8>, RarfError>> + Send + 'static,
    {
        self.inner.single_flight.run(key, loader).await
    }

    /// Stage writes/deletes in `f`, then apply them atomically across every
    /// touched shard, locking shards in ascending index order (§5).
    pub async fn with_transaction<R>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, RarfError>,
    ) -> Result<R, RarfError> {
        ctx.check()?;
        let mut txn = Transaction::new();
        let value = f(&mut txn)?;
        self.commit(txn.overlay).await?;
        Ok(value)
    }

    async fn commit(&self, overlay: std::collections::HashMap<Vec<u8>, Op>) -> Result<(), RarfError> {
        if overlay.is_empty() {
            return Ok(());
        }
        let mut shard_ids: Vec<usize> = overlay.keys().map(|k| self.shard_index(k)).collect();
        shard_ids.sort_unstable();
        shard_ids.dedup();

        let mut guards = std::collections::HashMap::new();
        for id in shard_ids {
            guards.insert(id, self.inner.shards[id].lock().expect("cache shard mutex poisoned"));
        }

        let now = self.inner.clock.now();
        let mut all_evicted = Vec::new();
        for (key, op) in overlay {
            let idx = self.shard_index(&key);
            let shard = guards.get_mut(&idx).expect("shard locked for this key's index");
            match op {
                Op::Put { value, ttl } => {
                    let expires_at = Some(now + ttl.unwrap_or(self.inner.options.default_ttl));
                    let evicted = shard.put(key, value, expires_at, now, self.inner.options.l1_max_entries, self.inner.options.l1_max_bytes);
                    all_evicted.extend(evicted);
                }
                Op::Delete => {
                    shard.delete(&key);
                }
            }
        }
        drop(guards);
        self.demote(all_evicted);
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in &self.inner.shards {
            let shard = shard.lock().expect("cache shard mutex poisoned");
            stats.l1_entries += shard.len();
            stats.l1_bytes += shard.bytes();
        }
        stats
    }

    /// One pass of TTL-based expiry across every shard, called by
    /// `CacheSweepHandle` on `sweep_interval`.
    pub fn sweep_once(&self) -> usize {
        let now = self.inner.clock.now();
        let mut total = 0;
        for shard in &self.inner.shards {
            let mut shard = shard.lock().expect("cache shard mutex poisoned");
            total += shard.sweep_expired(now);
        }
        if total > 0 {
            self.inner.metrics.counter("rarf_cache_swept", &[("cache", &self.inner.name)], total as u64);
        }
        total
    }
}

fn epoch_ms_to_instant(expires_at_ms: i64, reference: std::time::Instant) -> std::time::Instant {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let delta_ms = expires_at_ms - now_ms;
    if delta_ms <= 0 {
        reference
    } else {
        reference + Duration::from_millis(delta_ms as u64)
    }
}

fn instant_to_epoch_ms(expires_at: std::time::Instant, reference: std::time::Instant) -> i64 {
    let now_ms = chrono::Utc::now().timestamp_millis();
    if expires_at <= reference {
        now_ms
    } else {
        now_ms + expires_at.duration_since(reference).as_millis() as i64
    }
}

/// Owns the background task driving `Cache::sweep_once` on the configured
/// interval; dropping it aborts the task, matching `pool::sweep::SweepHandle`.
pub struct CacheSweepHandle {
    task: JoinHandle<()>,
}

impl CacheSweepHandle {
    pub fn spawn(cache: Cache, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep_once();
            }
        });
        Self { task }
    }
}

impl Drop for CacheSweepHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct InMemoryL2 {
        entries: Mutex<std::collections::HashMap<Vec<u8>, (Vec<u8>, Option<i64>)>>,
        put_calls: AtomicU32,
    }

    impl InMemoryL2 {
        fn new() -> Self {
            Self { entries: Mutex::new(std::collections::HashMap::new()), put_calls: AtomicU32::new(0) }
        }
    }

    #[async_trait::async_trait]
    impl L2Backend for InMemoryL2 {
        async fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Option<i64>)>, RarfError> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }
        async fn put(&self, key: &[u8], value: &[u8], expires_at_epoch_ms: Option<i64>) -> Result<(), RarfError> {
            self.put_calls.fetch_add(1, Ordering::SeqCst);
            self.entries.lock().unwrap().insert(key.to_vec(), (value.to_vec(), expires_at_epoch_ms));
            Ok(())
        }
        async fn delete(&self, key: &[u8]) -> Result<(), RarfError> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn cache(options: CacheOptions) -> Cache {
        Cache::new("test-cache", options, Arc::new(FakeClock::new())).unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let c = cache(CacheOptions::default());
        let ctx = Context::new();
        c.put(&ctx, b"k1", b"v1", None).await.unwrap();
        assert_eq!(c.get(&ctx, b"k1").await.unwrap(), (Some(b"v1".to_vec()), HitLayer::L1));
    }

    #[tokio::test]
    async fn miss_without_l2_is_reported_as_hit_layer_miss_not_an_error() {
        let c = cache(CacheOptions::default());
        let (value, layer) = c.get(&Context::new(), b"missing").await.unwrap();
        assert_eq!(value, None);
        assert_eq!(layer, HitLayer::Miss);
    }

    #[tokio::test]
    async fn get_or_err_lifts_a_miss_to_cache_miss() {
        let c = cache(CacheOptions::default());
        let err = c.get_or_err(&Context::new(), b"missing").await.unwrap_err();
        assert!(matches!(err, RarfError::CacheMiss));
    }

    #[tokio::test]
    async fn put_past_l1_max_bytes_is_rejected_as_capacity_exceeded() {
        let options = CacheOptions { l1_max_bytes: 4, ..CacheOptions::default() };
        let c = cache(options);
        let err = c.put(&Context::new(), b"k1", b"this value is far too large", None).await.unwrap_err();
        assert!(matches!(err, RarfError::CacheCapacityExceeded { .. }));
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_loaders_without_touching_storage() {
        let c = cache(CacheOptions::default());
        let load_calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let c = c.clone();
            let load_calls = load_calls.clone();
            handles.push(tokio::spawn(async move {
                c.single_flight(b"k1", async move {
                    load_calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(b"loaded".to_vec())
                })
                .await
            }));
        }
        for handle in handles {
            assert_eq!(*handle.await.unwrap().unwrap(), b"loaded".to_vec());
        }
        assert_eq!(load_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.get(&Context::new(), b"k1").await.unwrap(), (None, HitLayer::Miss), "single_flight must not itself populate the cache");
    }

    #[tokio::test]
    async fn l2_hit_promotes_into_l1() {
        let l2 = Arc::new(InMemoryL2::new());
        l2.entries.lock().unwrap().insert(b"k1".to_vec(), (b"from-l2".to_vec(), None));
        let options = CacheOptions { enable_l2: true, l2_path: Some("/tmp/unused".into()), ..CacheOptions::default() };
        let c = Cache::with_backend("test-cache", options, Arc::new(FakeClock::new()), metrics::noop(), Some(l2.clone())).unwrap();

        let ctx = Context::new();
        assert_eq!(c.get(&ctx, b"k1").await.unwrap(), (Some(b"from-l2".to_vec()), HitLayer::L2));
        assert_eq!(c.stats().l1_entries, 1, "l2 hit should promote the entry into l1");
    }

    #[tokio::test]
    async fn eviction_demotes_into_l2_when_enabled() {
        let l2 = Arc::new(InMemoryL2::new());
        let options = CacheOptions {
            shard_count: 1,
            l1_max_entries: 1,
            enable_l2: true,
            enable_demotion: true,
            l2_path: Some("/tmp/unused".into()),
            ..CacheOptions::default()
        };
        let c = Cache::with_backend("test-cache", options, Arc::new(FakeClock::new()), metrics::noop(), Some(l2.clone())).unwrap();

        let ctx = Context::new();
        c.put(&ctx, b"k1", b"v1", None).await.unwrap();
        c.put(&ctx, b"k2", b"v2", None).await.unwrap();

        tokio::task::yield_now().await;
        assert!(l2.put_calls.load(Ordering::SeqCst) >= 1, "evicted entry must be spawned into l2");
    }

    #[tokio::test]
    async fn concurrent_get_or_load_calls_loader_once() {
        let c = cache(CacheOptions::default());
        let load_calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = c.clone();
            let load_calls = load_calls.clone();
            handles.push(tokio::spawn(async move {
                c.get_or_load(&Context::new(), b"k1", None, async move {
                    load_calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(b"loaded".to_vec())
                })
                .await
            }));
        }
        for handle in handles {
            assert_eq!(*handle.await.unwrap().unwrap(), b"loaded".to_vec());
        }
        assert_eq!(load_calls.load(Ordering::SeqCst), 1, "single-flight must coalesce concurrent loads for the same key");
    }

    #[tokio::test]
    async fn transaction_applies_writes_across_multiple_shards_atomically() {
        let c = cache(CacheOptions::default());
        let ctx = Context::new();
        c.with_transaction(&ctx, |txn| {
            txn.put(b"a".to_vec(), b"1".to_vec(), None);
            txn.put(b"b".to_vec(), b"2".to_vec(), None);
            txn.put(b"c".to_vec(), b"3".to_vec(), None);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(c.get(&ctx, b"a").await.unwrap().0, Some(b"1".to_vec()));
        assert_eq!(c.get(&ctx, b"b").await.unwrap().0, Some(b"2".to_vec()));
        assert_eq!(c.get(&ctx, b"c").await.unwrap().0, Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn expired_entry_is_treated_as_a_miss() {
        let clock = FakeClock::new();
        let c = Cache::new("test-cache", CacheOptions::default(), Arc::new(clock.clone())).unwrap();
        let ctx = Context::new();
        c.put(&ctx, b"k1", b"v1", Some(Duration::from_secs(1))).await.unwrap();

        clock.advance(Duration::from_secs(2));
        let (value, layer) = c.get(&ctx, b"k1").await.unwrap();
        assert_eq!(value, None);
        assert_eq!(layer, HitLayer::Miss);
    }
}
