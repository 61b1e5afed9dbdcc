//! File-backed L2 cache tier: a log-structured on-disk store implementing
//! [`rarf_core::cache::L2Backend`], plugged into a [`rarf_core::cache::Cache`]
//! as its demotion/promotion target.

pub mod format;
pub mod store;

pub use store::FileL2Store;
