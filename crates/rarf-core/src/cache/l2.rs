//! The L2 seam (§4.5, §6.3): a durable, out-of-process backing store the L1
//! cache can demote entries into and promote entries back out of. Concrete
//! implementations (file-backed log-structured store, Redis, ...) live
//! outside this crate and are plugged in as `Arc<dyn L2Backend>`.

use async_trait::async_trait;

use crate::error::RarfError;

/// A durable key/value store keyed on the same bytes as the L1 shards.
/// `expires_at_epoch_ms` is wall-clock (not `Instant`) because L2 entries
/// outlive the process.
#[async_trait]
pub trait L2Backend: Send + Sync + 'static {
    async fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Option<i64>)>, RarfError>;
    async fn put(&self, key: &[u8], value: &[u8], expires_at_epoch_ms: Option<i64>) -> Result<(), RarfError>;
    async fn delete(&self, key: &[u8]) -> Result<(), RarfError>;
}
