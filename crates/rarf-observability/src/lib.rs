//! Concrete observability backends for the Resilient Async Resource Fabric:
//! a Prometheus-backed [`metrics::PrometheusMetricsSink`] and a
//! tracing-forwarding [`logging::Layer`]. `rarf-core` only ever depends on
//! the `MetricsSink`/`LogSink` traits; this crate is where an embedding
//! application picks the concrete backend.

pub mod logging;
pub mod metrics;

pub use logging::Layer;
pub use metrics::{PrometheusMetricsSink, RecordedCall, RecordingMetricsSink};
