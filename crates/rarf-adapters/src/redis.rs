//! `ResourceFactory` for Redis connections. Pools individual multiplexed
//! connections rather than handing out `redis::Client` itself, since the
//! client is a cheap, stateless connector and the actual socket is what
//! `rarf_core::pool::Pool` should be managing lifetimes for.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use rarf_core::context::Context;
use rarf_core::error::RarfError;
use rarf_core::pool::ResourceFactory;

pub struct RedisConnectionFactory {
    client: redis::Client,
}

impl RedisConnectionFactory {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn from_url(url: impl AsRef<str>) -> Result<Self, RarfError> {
        let client = redis::Client::open(url.as_ref()).map_err(RarfError::internal)?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ResourceFactory for RedisConnectionFactory {
    type Resource = MultiplexedConnection;

    async fn create(&self, _ctx: &Context) -> Result<Self::Resource, RarfError> {
        self.client.get_multiplexed_async_connection().await.map_err(RarfError::internal)
    }

    async fn validate(&self, resource: &mut Self::Resource, _ctx: &Context) -> bool {
        redis::cmd("PING").query_async::<_, String>(resource).await.is_ok()
    }

    async fn destroy(&self, _resource: Self::Resource) {
        // Dropping the connection closes its socket; redis-rs has no
        // separate async close handshake for multiplexed connections.
    }
}

/// Thin wrapper exposing the subset of Redis operations this codebase's
/// resource-level cache/idempotency backends actually need, so call sites
/// don't depend on `redis::AsyncCommands` directly.
pub struct RedisOps;

impl RedisOps {
    pub async fn get(conn: &mut MultiplexedConnection, key: &str) -> Result<Option<Vec<u8>>, RarfError> {
        conn.get(key).await.map_err(RarfError::internal)
    }

    pub async fn set_ex(conn: &mut MultiplexedConnection, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), RarfError> {
        conn.set_ex(key, value, ttl_secs).await.map_err(RarfError::internal)
    }

    pub async fn del(conn: &mut MultiplexedConnection, key: &str) -> Result<(), RarfError> {
        conn.del(key).await.map_err(RarfError::internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_url_accepts_a_well_formed_redis_url() {
        assert!(RedisConnectionFactory::from_url("redis://127.0.0.1:6379").is_ok());
    }

    #[test]
    fn from_url_rejects_a_malformed_url() {
        assert!(RedisConnectionFactory::from_url("not a url").is_err());
    }
}
