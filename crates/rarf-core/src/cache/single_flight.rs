//! Per-key load fan-in (§9 design note): concurrent cache misses for the
//! same key collapse into one execution of the loader; every caller awaits
//! a clone of the same `Shared` future instead of stampeding the source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::RarfError;

// `Shared` requires its output to be `Clone`, which `RarfError` is not (it
// carries boxed trait-object causes). Fan-in failures are therefore reported
// to joined callers as an `Arc<RarfError>` wrapped back into `RarfError` on
// the way out; the caller that actually ran `loader` still sees its error
// shape untouched since it always wins the only insert.
type SharedLoad = Shared<BoxFuture<'static, Result<Arc<Vec<u8>>, Arc<RarfError>>>>;

pub(super) struct SingleFlight {
    inflight: Mutex<HashMap<Vec<u8>, SharedLoad>>,
}

impl SingleFlight {
    pub(super) fn new() -> Self {
        Self { inflight: Mutex::new(HashMap::new()) }
    }

    pub(super) async fn run<F>(&self, key: &[u8], loader: F) -> Result<Arc<Vec<u8>>, RarfError>
    where
        F: std::future::Future<Output = Result<Vec<u8>, RarfError>> + Send + 'static,
    {
        let boxed: BoxFuture<'static, Result<Arc<Vec<u8>>, Arc<RarfError>>> =
            async move { loader.await.map(Arc::new).map_err(Arc::new) }.boxed();

        let shared = {
            let mut guard = self.inflight.lock().expect("single-flight mutex poisoned");
            guard.entry(key.to_vec()).or_insert_with(|| boxed.shared()).clone()
        };

        let result = shared.clone().await.map_err(|err| match Arc::try_unwrap(err) {
            Ok(owned) => owned,
            Err(shared_err) => RarfError::internal(std::io::Error::other(shared_err.to_string())),
        });

        // Only drop the entry once nobody else is going to join it: re-check
        // that the map still holds exactly the future we just awaited before
        // removing, so a caller that arrived mid-await and is about to clone
        // it doesn't race with the removal.
        {
            let mut guard = self.inflight.lock().expect("single-flight mutex poisoned");
            if let Some(current) = guard.get(key) {
                if current.ptr_eq(&shared) {
                    guard.remove(key);
                }
            }
        }

        result
    }
}
