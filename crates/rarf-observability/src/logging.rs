//! A `tracing_subscriber::Layer` that forwards every event into a
//! [`LogSink`], so the embedding application's own logger is the source of
//! truth rather than RARF writing to stdout directly.

use rarf_core::logsink::{LogEvent, LogLevel, LogSink, SharedLogSink};

pub struct Layer {
    sink: SharedLogSink,
}

impl Layer {
    pub fn new(sink: SharedLogSink) -> Self {
        Self { sink }
    }
}

impl<S> tracing_subscriber::Layer<S> for Layer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let log_event = LogEvent { level: level_from_tracing(metadata.level()), event: metadata.name(), fields: visitor.fields };
        self.sink.log(log_event);
    }
}

#[derive(Default)]
struct FieldVisitor {
    fields: std::collections::BTreeMap<String, String>,
}

impl FieldVisitor {
    fn record_raw(&mut self, field: &tracing::field::Field, value: impl ToString) {
        self.fields.insert(field.name().to_string(), value.to_string());
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.record_raw(field, value)
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.record_raw(field, value)
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.record_raw(field, value)
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.record_raw(field, value)
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.record_raw(field, value)
    }

    fn record_error(&mut self, field: &tracing::field::Field, value: &(dyn std::error::Error + 'static)) {
        let mut chain = vec![value.to_string()];
        let mut next = value.source();
        while let Some(cause) = next {
            chain.push(cause.to_string());
            next = cause.source();
        }
        self.record_raw(field, chain.join(" <- "))
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.record_raw(field, format!("{value:?}"))
    }
}

fn level_from_tracing(level: &tracing::Level) -> LogLevel {
    match *level {
        tracing::Level::TRACE => LogLevel::Trace,
        tracing::Level::DEBUG => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::WARN => LogLevel::Warn,
        tracing::Level::ERROR => LogLevel::Error,
    }
}
