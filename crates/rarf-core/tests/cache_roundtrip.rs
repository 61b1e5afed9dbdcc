//! Property tests for §4.5's cache round-trip laws: a `put` is always
//! visible to a subsequent `get` on the same key, and a `delete` always
//! turns a previously-put key back into a miss.

use quickcheck::TestResult;
use quickcheck_macros::quickcheck;

use rarf_core::clock::system_clock;
use rarf_core::config::CacheOptions;
use rarf_core::context::Context;
use rarf_core::{Cache, HitLayer};

fn runtime() -> Option<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().ok()
}

#[quickcheck]
fn put_then_get_round_trips_the_exact_bytes(key: Vec<u8>, value: Vec<u8>) -> TestResult {
    if key.is_empty() || key.len() + value.len() > 4096 {
        return TestResult::discard();
    }
    let Some(rt) = runtime() else { return TestResult::discard() };

    let holds = rt.block_on(async move {
        let cache = Cache::new("prop-cache", CacheOptions::default(), system_clock()).unwrap();
        let ctx = Context::new();
        cache.put(&ctx, &key, &value, None).await.unwrap();
        let (got, layer) = cache.get(&ctx, &key).await.unwrap();
        got == Some(value) && layer == HitLayer::L1
    });

    TestResult::from_bool(holds)
}

#[quickcheck]
fn delete_makes_a_previously_put_key_a_miss(key: Vec<u8>, value: Vec<u8>) -> TestResult {
    if key.is_empty() || key.len() + value.len() > 4096 {
        return TestResult::discard();
    }
    let Some(rt) = runtime() else { return TestResult::discard() };

    let holds = rt.block_on(async move {
        let cache = Cache::new("prop-cache", CacheOptions::default(), system_clock()).unwrap();
        let ctx = Context::new();
        cache.put(&ctx, &key, &value, None).await.unwrap();
        cache.delete(&ctx, &key).await.unwrap();
        let (got, layer) = cache.get(&ctx, &key).await.unwrap();
        got.is_none() && layer == HitLayer::Miss
    });

    TestResult::from_bool(holds)
}

#[quickcheck]
fn overwriting_a_key_leaves_only_the_latest_value_visible(key: Vec<u8>, first: Vec<u8>, second: Vec<u8>) -> TestResult {
    if key.is_empty() || key.len() + first.len().max(second.len()) > 4096 {
        return TestResult::discard();
    }
    let Some(rt) = runtime() else { return TestResult::discard() };

    let holds = rt.block_on(async move {
        let cache = Cache::new("prop-cache", CacheOptions::default(), system_clock()).unwrap();
        let ctx = Context::new();
        cache.put(&ctx, &key, &first, None).await.unwrap();
        cache.put(&ctx, &key, &second, None).await.unwrap();
        let (got, _) = cache.get(&ctx, &key).await.unwrap();
        got == Some(second)
    });

    TestResult::from_bool(holds)
}
