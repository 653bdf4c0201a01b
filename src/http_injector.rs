use http::{HeaderName, Request};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector, TextMapPropagator},
    trace::{SpanContext, TraceContextExt},
};
use opentelemetry_sdk::propagation::TraceContextPropagator;

use crate::transaction::Transaction;

/// Header carrying the caller's trace context.
pub const TRACE_PARENT_HEADER: &str = "traceparent";

/// Injects the context of `transaction` into a [`Request`]'s headers to
/// allow propagation downstream.
pub fn inject_transaction_context_into_request<'r, T>(
    transaction: &Transaction,
    request: &'r mut Request<T>,
) -> &'r mut Request<T> {
    let context = transaction.otel_context();

    global::get_text_map_propagator(|injector| {
        injector.inject_context(&context, &mut RequestInjector::new(request))
    });

    request
}

/// The upstream context a new transaction continues, if the caller sent a
/// usable one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceContext {
    parent: Option<SpanContext>,
}

impl TraceContext {
    /// A context with no upstream parent.
    pub fn root() -> Self {
        TraceContext::default()
    }

    /// Parses a `traceparent` header value. Absent, malformed or invalid
    /// values yield [`TraceContext::root`].
    pub fn from_traceparent_header(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self::root();
        };

        let context = TraceContextPropagator::new().extract(&TraceParentExtractor(value));
        let span_context = context.span().span_context().clone();
        if !span_context.is_valid() {
            tracing::debug!(%value, "ignoring malformed traceparent header");
            return Self::root();
        }

        TraceContext {
            parent: Some(span_context),
        }
    }

    pub fn parent(&self) -> Option<&SpanContext> {
        self.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

// "traceparent" => https://www.w3.org/TR/trace-context/#trace-context-http-headers-format

/// Injector used via opentelemetry propagator to tell it how to insert the
/// "traceparent" header value, a string
/// "{version}-{trace_id}-{span_id}-{trace_flags}" identifying the
/// transaction. Listeners can then re-hydrate the context to continue the
/// same trace.
struct RequestInjector<'a, T> {
    request: &'a mut Request<T>,
}

impl<'a, T> RequestInjector<'a, T> {
    pub fn new(request: &'a mut Request<T>) -> Self {
        RequestInjector { request }
    }
}

impl<'a, T> Injector for RequestInjector<'a, T> {
    fn set(&mut self, key: &str, value: String) {
        let Ok(key) = key.parse::<HeaderName>() else {
            tracing::debug!(%key, "failed to parse header name");
            return;
        };
        let Ok(value) = value.parse() else {
            tracing::debug!(%value, "failed to parse header value");
            return;
        };
        self.request.headers_mut().insert(key, value);
    }
}

/// Exposes a single, already looked up `traceparent` value to the propagator.
struct TraceParentExtractor<'a>(&'a str);

impl<'a> Extractor for TraceParentExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        key.eq_ignore_ascii_case(TRACE_PARENT_HEADER)
            .then_some(self.0)
    }

    fn keys(&self) -> Vec<&str> {
        vec![TRACE_PARENT_HEADER]
    }
}
