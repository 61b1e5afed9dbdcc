//! Metrics sink contract consumed by every component (§6.1). Concrete sinks
//! (Prometheus, no-op, recording test double) live in `rarf-observability`;
//! this crate only depends on the trait so pool/cache/breaker/etc. never pull
//! in a metrics backend transitively.

use std::sync::Arc;

pub type Labels<'a> = &'a [(&'a str, &'a str)];

pub trait MetricsSink: Send + Sync + 'static {
    fn counter(&self, name: &str, labels: Labels<'_>, delta: u64);
    fn observe(&self, name: &str, labels: Labels<'_>, value: f64);
    fn gauge(&self, name: &str, labels: Labels<'_>, value: f64);
}

pub type SharedMetricsSink = Arc<dyn MetricsSink>;

/// Discards everything; used where the caller has not wired up real metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn counter(&self, _name: &str, _labels: Labels<'_>, _delta: u64) {}
    fn observe(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}
    fn gauge(&self, _name: &str, _labels: Labels<'_>, _value: f64) {}
}

pub fn noop() -> SharedMetricsSink {
    Arc::new(NoopMetricsSink)
}
