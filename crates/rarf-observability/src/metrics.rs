//! `MetricsSink` implementations: a `prometheus`-backed sink for production
//! and a recording double for tests, following the way this codebase
//! registers its own Prometheus collectors into a shared `Registry`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use prometheus::{GaugeVec, HistogramVec, IntCounterVec, Opts, Registry};
use rarf_core::metrics::{Labels, MetricsSink};

/// Registers one `IntCounterVec`/`HistogramVec`/`GaugeVec` per metric name on
/// first use, keyed by the sorted label names seen on that first call — RARF
/// itself always calls each metric name with a fixed label set, so this
/// lazy-register-once approach never hits a label cardinality mismatch.
pub struct PrometheusMetricsSink {
    registry: Registry,
    counters: Mutex<HashMap<String, IntCounterVec>>,
    histograms: Mutex<HashMap<String, HistogramVec>>,
    gauges: Mutex<HashMap<String, GaugeVec>>,
}

impl PrometheusMetricsSink {
    pub fn new(registry: Registry) -> Self {
        Self { registry, counters: Mutex::new(HashMap::new()), histograms: Mutex::new(HashMap::new()), gauges: Mutex::new(HashMap::new()) }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn label_names(labels: Labels<'_>) -> Vec<&str> {
        labels.iter().map(|(k, _)| *k).collect()
    }

    fn label_values<'a>(labels: Labels<'a>) -> Vec<&'a str> {
        labels.iter().map(|(_, v)| *v).collect()
    }
}

impl MetricsSink for PrometheusMetricsSink {
    fn counter(&self, name: &str, labels: Labels<'_>, delta: u64) {
        let mut counters = self.counters.lock().expect("metrics mutex poisoned");
        let vec = counters.entry(name.to_string()).or_insert_with(|| {
            let opts = Opts::new(name.to_string(), format!("RARF counter {name}"));
            let vec = IntCounterVec::new(opts, &Self::label_names(labels)).expect("valid counter metric definition");
            let _ = self.registry.register(Box::new(vec.clone()));
            vec
        });
        vec.with_label_values(&Self::label_values(labels)).inc_by(delta);
    }

    fn observe(&self, name: &str, labels: Labels<'_>, value: f64) {
        let mut histograms = self.histograms.lock().expect("metrics mutex poisoned");
        let vec = histograms.entry(name.to_string()).or_insert_with(|| {
            let opts = prometheus::HistogramOpts::new(name.to_string(), format!("RARF histogram {name}"));
            let vec = HistogramVec::new(opts, &Self::label_names(labels)).expect("valid histogram metric definition");
            let _ = self.registry.register(Box::new(vec.clone()));
            vec
        });
        vec.with_label_values(&Self::label_values(labels)).observe(value);
    }

    fn gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        let mut gauges = self.gauges.lock().expect("metrics mutex poisoned");
        let vec = gauges.entry(name.to_string()).or_insert_with(|| {
            let opts = Opts::new(name.to_string(), format!("RARF gauge {name}"));
            let vec = GaugeVec::new(opts, &Self::label_names(labels)).expect("valid gauge metric definition");
            let _ = self.registry.register(Box::new(vec.clone()));
            vec
        });
        vec.with_label_values(&Self::label_values(labels)).set(value);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Counter { name: String, labels: Vec<(String, String)>, delta: u64 },
    Observe { name: String, labels: Vec<(String, String)>, value: f64 },
    Gauge { name: String, labels: Vec<(String, String)>, value: f64 },
}

/// Stores every call made against it; used by component tests that assert
/// on emitted metrics rather than wiring up a real Prometheus registry.
#[derive(Default)]
pub struct RecordingMetricsSink {
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingMetricsSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("metrics mutex poisoned").clone()
    }
}

fn owned_labels(labels: Labels<'_>) -> Vec<(String, String)> {
    labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

impl MetricsSink for RecordingMetricsSink {
    fn counter(&self, name: &str, labels: Labels<'_>, delta: u64) {
        self.calls.lock().expect("metrics mutex poisoned").push(RecordedCall::Counter {
            name: name.to_string(),
            labels: owned_labels(labels),
            delta,
        });
    }

    fn observe(&self, name: &str, labels: Labels<'_>, value: f64) {
        self.calls.lock().expect("metrics mutex poisoned").push(RecordedCall::Observe {
            name: name.to_string(),
            labels: owned_labels(labels),
            value,
        });
    }

    fn gauge(&self, name: &str, labels: Labels<'_>, value: f64) {
        self.calls.lock().expect("metrics mutex poisoned").push(RecordedCall::Gauge {
            name: name.to_string(),
            labels: owned_labels(labels),
            value,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_captures_calls_in_order() {
        let sink = RecordingMetricsSink::new();
        sink.counter("rarf_pool_created", &[("pool", "db")], 1);
        sink.observe("rarf_pool_acquire_wait_ms", &[("pool", "db")], 12.5);

        let calls = sink.calls();
        assert_eq!(
            calls[0],
            RecordedCall::Counter { name: "rarf_pool_created".into(), labels: vec![("pool".into(), "db".into())], delta: 1 }
        );
        assert_eq!(
            calls[1],
            RecordedCall::Observe { name: "rarf_pool_acquire_wait_ms".into(), labels: vec![("pool".into(), "db".into())], value: 12.5 }
        );
    }

    #[test]
    fn prometheus_sink_registers_a_metric_on_first_use_and_reuses_it_after() {
        let sink = PrometheusMetricsSink::new(Registry::new());
        sink.counter("rarf_cache_hit", &[("cache", "l1")], 1);
        sink.counter("rarf_cache_hit", &[("cache", "l1")], 2);

        let families = sink.registry().gather();
        let family = families.iter().find(|f| f.get_name() == "rarf_cache_hit").expect("metric registered");
        let metric = &family.get_metric()[0];
        assert_eq!(metric.get_counter().get_value(), 3.0);
    }
}
