//! Where ended transactions go.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{
        Span, SpanBuilder, SpanContext, SpanKind, Status, TraceContextExt, TraceFlags, TraceState,
        Tracer,
    },
    Context, Key, KeyValue,
};
use opentelemetry_semantic_conventions::trace as semconv;

use crate::transaction::TransactionData;

/// Instrumentation scope name used for exported transactions.
pub const INSTRUMENTATION_NAME: &str = env!("CARGO_PKG_NAME");

pub trait Reporter: Send + Sync {
    fn report(&self, transaction: TransactionData);
}

/// Keeps every reported transaction in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    transactions: Mutex<Vec<TransactionData>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions(&self) -> Vec<TransactionData> {
        self.lock().clone()
    }

    pub fn first_transaction(&self) -> Option<TransactionData> {
        self.lock().first().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TransactionData>> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, transaction: TransactionData) {
        self.lock().push(transaction);
    }
}

/// Logs one event per transaction through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, transaction: TransactionData) {
        let duration_ms = transaction
            .duration()
            .map(|duration| duration.as_secs_f64() * 1000.0);

        tracing::info!(
            transaction.id = %transaction.id,
            trace.id = %transaction.trace_id,
            name = transaction.name_or_default(),
            r#type = ?transaction.transaction_type,
            result = ?transaction.result,
            method = ?transaction.request.method,
            path = ?transaction.request.url.pathname,
            duration_ms = ?duration_ms,
            error = ?transaction.error.as_ref().map(|error| &error.message),
            "transaction ended"
        );
    }
}

/// Exports each transaction as an OpenTelemetry server span through the
/// global tracer provider, keeping its ids, parent and timestamps.
pub struct OtelReporter {
    tracer: BoxedTracer,
}

impl OtelReporter {
    pub fn new() -> Self {
        OtelReporter {
            tracer: global::tracer(INSTRUMENTATION_NAME),
        }
    }
}

impl Default for OtelReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OtelReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelReporter").finish_non_exhaustive()
    }
}

impl Reporter for OtelReporter {
    fn report(&self, transaction: TransactionData) {
        let parent = match transaction.parent_id {
            Some(parent_id) => {
                let flags = if transaction.sampled {
                    TraceFlags::SAMPLED
                } else {
                    TraceFlags::default()
                };
                Context::new().with_remote_span_context(SpanContext::new(
                    transaction.trace_id,
                    parent_id,
                    flags,
                    true,
                    TraceState::default(),
                ))
            }
            None => Context::new(),
        };

        let mut builder = SpanBuilder::from_name(transaction.name_or_default().to_owned())
            .with_kind(SpanKind::Server)
            .with_trace_id(transaction.trace_id)
            .with_span_id(transaction.id)
            .with_start_time(transaction.start)
            .with_attributes(attributes(&transaction));
        if let Some(error) = &transaction.error {
            builder = builder.with_status(Status::error(error.message.clone()));
        }

        let mut span = self.tracer.build_with_context(builder, &parent);
        span.end_with_timestamp(transaction.end.unwrap_or_else(SystemTime::now));
    }
}

fn attributes(transaction: &TransactionData) -> Vec<KeyValue> {
    let request = &transaction.request;
    let url = &request.url;
    let text = [
        (Key::from(semconv::HTTP_REQUEST_METHOD), &request.method),
        (Key::from(semconv::URL_SCHEME), &url.protocol),
        (Key::from(semconv::SERVER_ADDRESS), &url.hostname),
        (Key::from(semconv::URL_PATH), &url.pathname),
        (Key::from(semconv::URL_QUERY), &url.search),
        (Key::from(semconv::CLIENT_ADDRESS), &request.socket.remote_address),
        (Key::from_static_str("transaction.type"), &transaction.transaction_type),
        (Key::from_static_str("transaction.result"), &transaction.result),
    ];

    let mut attributes: Vec<KeyValue> = text
        .into_iter()
        .filter_map(|(key, value)| Some(KeyValue::new(key, value.clone()?)))
        .collect();
    attributes.push(KeyValue::new("tls", request.socket.encrypted));
    if let Some(port) = url.port {
        attributes.push(KeyValue::new(semconv::SERVER_PORT, i64::from(port)));
    }
    if let Some(error) = &transaction.error {
        attributes.push(KeyValue::new(semconv::EXCEPTION_TYPE, error.type_name.clone()));
        attributes.push(KeyValue::new(semconv::EXCEPTION_MESSAGE, error.message.clone()));
    }

    attributes
}

#[cfg(test)]
mod tests {
    use opentelemetry::{trace::SpanId, Value};
    use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transaction::CapturedError;

    fn transaction() -> TransactionData {
        let ids = RandomIdGenerator::default();
        let mut data = TransactionData::new(
            ids.new_span_id(),
            ids.new_trace_id(),
            None,
            true,
            "orders".to_owned(),
        );
        data.request.with_method("GET");
        data.request
            .url_mut()
            .with_protocol(Some("https"))
            .with_hostname(Some("example.com"))
            .with_port(Some(8443))
            .with_pathname(Some("/hello"))
            .with_search(None);
        data
    }

    fn value(attributes: &[KeyValue], key: impl Into<Key>) -> Option<Value> {
        let key = key.into();
        attributes
            .iter()
            .find(|attribute| attribute.key == key)
            .map(|attribute| attribute.value.clone())
    }

    #[test]
    fn memory_reporter_collects_in_order() {
        let reporter = MemoryReporter::new();
        let first = transaction();
        let second = transaction();

        reporter.report(first.clone());
        reporter.report(second.clone());

        assert_eq!(reporter.len(), 2);
        assert_eq!(reporter.first_transaction(), Some(first));
        assert_eq!(reporter.transactions()[1], second);

        reporter.reset();
        assert!(reporter.is_empty());
    }

    #[test]
    fn attributes_skip_missing_values() {
        let attributes = attributes(&transaction());

        assert_eq!(
            value(&attributes, semconv::HTTP_REQUEST_METHOD),
            Some(Value::from("GET"))
        );
        assert_eq!(value(&attributes, semconv::SERVER_PORT), Some(Value::I64(8443)));
        assert_eq!(value(&attributes, semconv::URL_QUERY), None);
        assert_eq!(value(&attributes, semconv::EXCEPTION_MESSAGE), None);
    }

    #[test]
    fn attributes_carry_captured_errors() {
        let mut data = transaction();
        data.error = Some(CapturedError {
            type_name: "std::io::Error".to_owned(),
            message: "boom".to_owned(),
            panicked: false,
        });

        let attributes = attributes(&data);

        assert_eq!(
            value(&attributes, semconv::EXCEPTION_MESSAGE),
            Some(Value::from("boom"))
        );
    }

    #[test]
    fn otel_reporter_exports_without_a_provider() {
        let mut data = transaction();
        data.parent_id = Some(SpanId::from_hex("b7ad6b7169203331").unwrap());

        OtelReporter::new().report(data);
    }
}
