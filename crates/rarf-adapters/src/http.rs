//! `ResourceFactory` for outbound HTTP clients bound to a specific upstream.
//! Pooling a `reqwest::Client` per slot is useful when a client must carry
//! per-destination affinity (a sticky auth header, a pinned base URL) that
//! makes sharing one global client across destinations awkward, while still
//! letting the pool apply the same health-check/leak/circuit-breaker
//! machinery it applies to database and cache connections.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use rarf_core::context::Context;
use rarf_core::error::RarfError;
use rarf_core::pool::ResourceFactory;

pub struct HttpClientFactory {
    base_url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    health_path: Option<String>,
}

impl HttpClientFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            health_path: None,
        }
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = Some(path.into());
        self
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, request_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.request_timeout = request_timeout;
        self
    }
}

#[async_trait]
impl ResourceFactory for HttpClientFactory {
    type Resource = Client;

    async fn create(&self, _ctx: &Context) -> Result<Self::Resource, RarfError> {
        Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .build()
            .map_err(RarfError::internal)
    }

    async fn validate(&self, resource: &mut Self::Resource, ctx: &Context) -> bool {
        let Some(path) = &self.health_path else { return true };
        let url = format!("{}{}", self.base_url, path);
        let timeout = ctx.time_remaining().unwrap_or(self.request_timeout);
        matches!(
            resource.get(url).timeout(timeout).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    async fn destroy(&self, _resource: Self::Resource) {
        // reqwest::Client has no explicit close; connections are reclaimed
        // by its internal pool once the last clone is dropped.
    }
}
