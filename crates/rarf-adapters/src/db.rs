//! `ResourceFactory` for raw Postgres connections. Pools a single
//! `sqlx::PgConnection` per slot rather than wrapping `sqlx::PgPool` — the
//! pooling itself is `rarf_core::pool::Pool`'s job, not sqlx's.

use async_trait::async_trait;
use sqlx::{postgres::PgConnectOptions, Connection, Executor, PgConnection};

use rarf_core::context::Context;
use rarf_core::error::RarfError;
use rarf_core::pool::ResourceFactory;

pub struct PgConnectionFactory {
    options: PgConnectOptions,
    validation_query: &'static str,
}

impl PgConnectionFactory {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options, validation_query: "SELECT 1" }
    }

    pub fn with_validation_query(mut self, query: &'static str) -> Self {
        self.validation_query = query;
        self
    }
}

#[async_trait]
impl ResourceFactory for PgConnectionFactory {
    type Resource = PgConnection;

    async fn create(&self, _ctx: &Context) -> Result<Self::Resource, RarfError> {
        PgConnection::connect_with(&self.options).await.map_err(RarfError::internal)
    }

    async fn validate(&self, resource: &mut Self::Resource, _ctx: &Context) -> bool {
        resource.execute(self.validation_query).await.is_ok()
    }

    async fn destroy(&self, resource: Self::Resource) {
        if let Err(err) = resource.close().await {
            tracing::debug!(error = %err, "postgres connection close failed during destroy");
        }
    }
}
