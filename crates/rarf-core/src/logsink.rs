//! Logger sink contract consumed by every component (§6.1). The concrete
//! `tracing_subscriber::Layer` that forwards events into a `LogSink` lives in
//! `rarf-observability`; this crate only knows the small structured shape.

use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub level: LogLevel,
    pub event: &'static str,
    pub fields: BTreeMap<String, String>,
}

pub trait LogSink: Send + Sync + 'static {
    fn log(&self, event: LogEvent);
}

pub type SharedLogSink = Arc<dyn LogSink>;

/// Discards everything; `tracing`'s own subscriber remains the source of
/// truth unless the embedder wires a `LogSink` through `rarf-observability`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogSink;

impl LogSink for NoopLogSink {
    fn log(&self, _event: LogEvent) {}
}
