//! Concrete [`rarf_core::pool::ResourceFactory`] implementations for the
//! backends this platform actually talks to: Postgres, Redis, and outbound
//! HTTP. Each adapter knows nothing about pooling policy — that lives in
//! `rarf_core::pool::Pool` — only how to create, validate, and tear down one
//! instance of its resource.

pub mod db;
pub mod http;
pub mod redis;

pub use db::PgConnectionFactory;
pub use http::HttpClientFactory;
pub use redis::RedisConnectionFactory;
