//! The transaction record produced for every dispatched request, and the
//! [`Scope`] token that marks a transaction as the ambient one for the
//! current thread.

use std::{
    any::{type_name, Any},
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, SystemTime},
};

use opentelemetry::{
    trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState},
    Context,
};

use crate::tracer::{ambient, Shared};

/// Name reported for transactions nobody named.
pub const DEFAULT_NAME: &str = "unnamed";

/// Handle to one logical request-response unit.
///
/// Clones share the same record. Mutations go through the `with_*` methods
/// and become visible to every holder; [`Transaction::end`] hands a
/// [`TransactionData`] snapshot to the reporter exactly once.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

struct Inner {
    data: Mutex<TransactionData>,
    ended: AtomicBool,
    shared: Arc<Shared>,
}

impl Transaction {
    pub(crate) fn new(data: TransactionData, shared: Arc<Shared>) -> Self {
        Transaction {
            inner: Arc::new(Inner {
                data: Mutex::new(data),
                ended: AtomicBool::new(false),
                shared,
            }),
        }
    }

    pub fn id(&self) -> SpanId {
        self.lock().id
    }

    pub fn trace_id(&self) -> TraceId {
        self.lock().trace_id
    }

    pub fn parent_id(&self) -> Option<SpanId> {
        self.lock().parent_id
    }

    /// Overwrites the transaction name.
    pub fn with_name(&self, name: impl Into<String>) -> &Self {
        self.lock().name = Some(name.into());
        self
    }

    pub fn with_type(&self, transaction_type: impl Into<String>) -> &Self {
        self.lock().transaction_type = Some(transaction_type.into());
        self
    }

    /// Sets the result unless something already did.
    pub fn with_result_if_unset(&self, result: impl Into<String>) -> &Self {
        let mut data = self.lock();
        if data.result.is_none() {
            data.result = Some(result.into());
        }
        drop(data);
        self
    }

    pub fn capture_exception(&self, error: CapturedError) -> &Self {
        self.lock().error = Some(error);
        self
    }

    /// Gives `update` mutable access to the request sub-record.
    pub fn update_request(&self, update: impl FnOnce(&mut Request)) -> &Self {
        update(&mut self.lock().request);
        self
    }

    /// Makes this transaction the ambient one for the calling thread.
    ///
    /// Activating the transaction that is already on top of the thread's
    /// activation stack returns a no-op scope.
    pub fn activate(&self) -> Scope {
        if ambient::is_current(self) {
            return Scope::noop();
        }

        self.inner.shared.notify(|listener| listener.on_activate(self));
        ambient::push(self.clone());
        Scope {
            transaction: Some(self.clone()),
            _thread_bound: PhantomData,
        }
    }

    /// Ends the transaction and reports it. Only the first call has any
    /// effect.
    pub fn end(&self) {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            tracing::debug!(transaction.id = %self.id(), "transaction already ended");
            return;
        }

        let snapshot = {
            let mut data = self.lock();
            data.end = Some(SystemTime::now());
            data.clone()
        };

        self.inner.shared.reporter.report(snapshot);
        self.inner.shared.notify(|listener| listener.on_end(self));
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> TransactionData {
        self.lock().clone()
    }

    /// The OpenTelemetry span context this transaction represents, used to
    /// parent handler spans and to propagate downstream.
    pub fn span_context(&self) -> SpanContext {
        let data = self.lock();
        let flags = if data.sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };

        SpanContext::new(data.trace_id, data.id, flags, true, TraceState::default())
    }

    pub fn otel_context(&self) -> Context {
        Context::new().with_remote_span_context(self.span_context())
    }

    fn lock(&self) -> MutexGuard<'_, TransactionData> {
        self.inner
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.lock();
        f.debug_struct("Transaction")
            .field("id", &data.id)
            .field("trace_id", &data.trace_id)
            .field("name", &data.name)
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Plain copy of a transaction's state, as handed to reporters.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionData {
    pub id: SpanId,
    pub trace_id: TraceId,
    pub parent_id: Option<SpanId>,
    pub sampled: bool,
    pub service_name: String,
    pub name: Option<String>,
    pub transaction_type: Option<String>,
    pub result: Option<String>,
    pub request: Request,
    pub error: Option<CapturedError>,
    pub start: SystemTime,
    pub end: Option<SystemTime>,
}

impl TransactionData {
    pub(crate) fn new(
        id: SpanId,
        trace_id: TraceId,
        parent_id: Option<SpanId>,
        sampled: bool,
        service_name: String,
    ) -> Self {
        TransactionData {
            id,
            trace_id,
            parent_id,
            sampled,
            service_name,
            name: None,
            transaction_type: None,
            result: None,
            request: Request::default(),
            error: None,
            start: SystemTime::now(),
            end: None,
        }
    }

    pub fn name_or_default(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.end?.duration_since(self.start).ok()
    }
}

/// Request metadata captured when the transaction starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: Option<String>,
    pub socket: Socket,
    pub url: Url,
}

impl Request {
    pub fn with_method(&mut self, method: &str) -> &mut Self {
        self.method = Some(method.to_owned());
        self
    }

    pub fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Socket {
    pub encrypted: bool,
    pub remote_address: Option<String>,
}

impl Socket {
    pub fn with_encrypted(&mut self, encrypted: bool) -> &mut Self {
        self.encrypted = encrypted;
        self
    }

    pub fn with_remote_address(&mut self, remote_address: Option<&str>) -> &mut Self {
        self.remote_address = remote_address.map(str::to_owned);
        self
    }
}

/// URL components as the exchange exposed them. `port` is `None` when the
/// request did not name one, `search` is `None` without a query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Url {
    pub protocol: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub pathname: Option<String>,
    pub search: Option<String>,
}

impl Url {
    pub fn with_protocol(&mut self, protocol: Option<&str>) -> &mut Self {
        self.protocol = protocol.map(str::to_owned);
        self
    }

    pub fn with_hostname(&mut self, hostname: Option<&str>) -> &mut Self {
        self.hostname = hostname.map(str::to_owned);
        self
    }

    pub fn with_port(&mut self, port: Option<u16>) -> &mut Self {
        self.port = port;
        self
    }

    pub fn with_pathname(&mut self, pathname: Option<&str>) -> &mut Self {
        self.pathname = pathname.map(str::to_owned);
        self
    }

    pub fn with_search(&mut self, search: Option<&str>) -> &mut Self {
        self.search = search.map(str::to_owned);
        self
    }
}

/// An error or panic recorded on a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedError {
    pub type_name: String,
    pub message: String,
    pub panicked: bool,
}

impl CapturedError {
    pub fn new<E: fmt::Display + ?Sized>(error: &E) -> Self {
        CapturedError {
            type_name: type_name::<E>().to_owned(),
            message: error.to_string(),
            panicked: false,
        }
    }

    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "Box<dyn Any>".to_owned());

        CapturedError {
            type_name: "panic".to_owned(),
            message,
            panicked: true,
        }
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Marks a transaction as ambient on the thread that activated it until
/// the scope is dropped or [`Scope::deactivate`]d.
///
/// Scopes are bound to their thread and cannot be sent elsewhere.
#[must_use = "dropping a scope deactivates its transaction"]
pub struct Scope {
    transaction: Option<Transaction>,
    _thread_bound: PhantomData<*const ()>,
}

impl Scope {
    fn noop() -> Self {
        Scope {
            transaction: None,
            _thread_bound: PhantomData,
        }
    }

    /// Whether acquiring this scope changed nothing because the transaction
    /// was already ambient.
    pub fn is_noop(&self) -> bool {
        self.transaction.is_none()
    }

    pub fn deactivate(self) {}
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            ambient::remove(&transaction);
            transaction
                .inner
                .shared
                .notify(|listener| listener.on_deactivate(&transaction));
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("transaction", &self.transaction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        reporter::MemoryReporter,
        tracer::{current_transaction, Tracer},
    };

    fn tracer() -> (Tracer, Arc<MemoryReporter>) {
        let reporter = Arc::new(MemoryReporter::new());
        let tracer = Tracer::builder()
            .service_name("orders")
            .reporter(reporter.clone())
            .build();
        (tracer, reporter)
    }

    #[test]
    fn result_is_only_set_once() {
        let (tracer, _) = tracer();
        let transaction = tracer.start_transaction(None, "test");

        transaction.with_result_if_unset("Custom");
        transaction.with_result_if_unset("Http 200");

        assert_eq!(transaction.snapshot().result.as_deref(), Some("Custom"));
    }

    #[test]
    fn name_can_be_overwritten() {
        let (tracer, _) = tracer();
        let transaction = tracer.start_transaction(None, "test");

        transaction.with_name("first").with_name("second");

        assert_eq!(transaction.snapshot().name_or_default(), "second");
    }

    #[test]
    fn end_reports_once() {
        let (tracer, reporter) = tracer();
        let transaction = tracer.start_transaction(None, "test");

        transaction.end();
        transaction.end();

        assert!(transaction.is_ended());
        assert_eq!(reporter.len(), 1);
        let reported = reporter.first_transaction().unwrap();
        assert_eq!(reported.service_name, "orders");
        assert!(reported.end.is_some());
    }

    #[test]
    fn scopes_stack_and_unwind() {
        let (tracer, _) = tracer();
        let outer = tracer.start_transaction(None, "test");
        let inner = tracer.start_transaction(None, "test");

        let outer_scope = outer.activate();
        let inner_scope = inner.activate();
        assert_eq!(current_transaction(), Some(inner.clone()));

        inner_scope.deactivate();
        assert_eq!(current_transaction(), Some(outer.clone()));

        outer_scope.deactivate();
        assert_eq!(current_transaction(), None);
    }

    #[test]
    fn reactivating_the_current_transaction_is_a_noop() {
        let (tracer, _) = tracer();
        let transaction = tracer.start_transaction(None, "test");

        let scope = transaction.activate();
        let again = transaction.activate();
        assert!(again.is_noop());

        drop(again);
        assert_eq!(current_transaction(), Some(transaction.clone()));

        drop(scope);
        assert_eq!(current_transaction(), None);
    }

    #[test]
    fn scopes_released_out_of_order_remove_their_own_activation() {
        let (tracer, _) = tracer();
        let first = tracer.start_transaction(None, "test");
        let second = tracer.start_transaction(None, "test");

        let first_scope = first.activate();
        let second_scope = second.activate();

        first_scope.deactivate();
        assert_eq!(current_transaction(), Some(second.clone()));

        second_scope.deactivate();
        assert_eq!(current_transaction(), None);
    }

    #[test]
    fn captured_panic_keeps_the_message() {
        let payload: Box<dyn Any + Send> = Box::new("handler exploded");
        let error = CapturedError::from_panic(&*payload);

        assert!(error.panicked);
        assert_eq!(error.message, "handler exploded");

        let payload: Box<dyn Any + Send> = Box::new(String::from("formatted 42"));
        assert_eq!(CapturedError::from_panic(&*payload).message, "formatted 42");
    }

    #[test]
    fn captured_error_records_type_and_message() {
        let error = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let captured = CapturedError::new(&error);

        assert!(captured.type_name.contains("io"));
        assert_eq!(captured.message, "boom");
        assert!(!captured.panicked);
    }
}
