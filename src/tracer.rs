//! The engine behind the dispatch hooks: starts transactions, tracks which
//! one is ambient on each thread and hands ended ones to a [`Reporter`].

use std::{fmt, sync::Arc};

use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};

use crate::{
    http_injector::TraceContext,
    reporter::{LogReporter, Reporter},
    transaction::{Transaction, TransactionData},
};

/// Observes transaction lifecycle events. Every callback defaults to doing
/// nothing.
pub trait LifecycleListener: Send + Sync {
    fn on_start(&self, _transaction: &Transaction) {}

    fn on_activate(&self, _transaction: &Transaction) {}

    fn on_deactivate(&self, _transaction: &Transaction) {}

    fn on_end(&self, _transaction: &Transaction) {}
}

/// State shared between a tracer and every transaction it started.
pub(crate) struct Shared {
    pub(crate) service_name: String,
    pub(crate) reporter: Arc<dyn Reporter>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl Shared {
    pub(crate) fn notify(&self, event: impl Fn(&dyn LifecycleListener)) {
        for listener in &self.listeners {
            event(listener.as_ref());
        }
    }
}

pub struct Tracer {
    shared: Arc<Shared>,
    ids: RandomIdGenerator,
}

impl Tracer {
    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    /// Starts a transaction. Continues the trace named by `traceparent`
    /// when it parses, otherwise starts a new root trace. The transaction is
    /// not activated.
    ///
    /// `scope_hint` names the caller for diagnostics only.
    pub fn start_transaction(&self, traceparent: Option<&str>, scope_hint: &str) -> Transaction {
        let context = TraceContext::from_traceparent_header(traceparent);
        let (trace_id, parent_id, sampled) = match context.parent() {
            Some(parent) => (
                parent.trace_id(),
                Some(parent.span_id()),
                parent.is_sampled(),
            ),
            None => (self.ids.new_trace_id(), None, true),
        };

        let data = TransactionData::new(
            self.ids.new_span_id(),
            trace_id,
            parent_id,
            sampled,
            self.shared.service_name.clone(),
        );
        let transaction = Transaction::new(data, self.shared.clone());

        tracing::debug!(
            transaction.id = %transaction.id(),
            trace.id = %trace_id,
            continued = parent_id.is_some(),
            scope = scope_hint,
            "started transaction"
        );
        self.shared.notify(|listener| listener.on_start(&transaction));

        transaction
    }

    pub fn current_transaction(&self) -> Option<Transaction> {
        current_transaction()
    }

    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("service_name", &self.shared.service_name)
            .field("listeners", &self.shared.listeners.len())
            .finish()
    }
}

pub struct TracerBuilder {
    service_name: String,
    reporter: Arc<dyn Reporter>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl Default for TracerBuilder {
    fn default() -> Self {
        TracerBuilder {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            reporter: Arc::new(LogReporter),
            listeners: Vec::new(),
        }
    }
}

impl TracerBuilder {
    pub fn service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Tracer {
        Tracer {
            shared: Arc::new(Shared {
                service_name: self.service_name,
                reporter: self.reporter,
                listeners: self.listeners,
            }),
            ids: RandomIdGenerator::default(),
        }
    }
}

/// The tracer handle the dispatch hooks are built with.
///
/// `Disabled` stands in for a process without a tracer: every hook becomes a
/// no-op and nothing is ever reported.
#[derive(Clone, Debug, Default)]
pub enum Engine {
    #[default]
    Disabled,
    Enabled(Arc<Tracer>),
}

impl Engine {
    pub fn tracer(&self) -> Option<&Tracer> {
        match self {
            Engine::Disabled => None,
            Engine::Enabled(tracer) => Some(tracer.as_ref()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Engine::Enabled(_))
    }

    pub fn current_transaction(&self) -> Option<Transaction> {
        self.tracer().and_then(Tracer::current_transaction)
    }
}

impl From<Tracer> for Engine {
    fn from(tracer: Tracer) -> Self {
        Engine::Enabled(Arc::new(tracer))
    }
}

/// The transaction ambient on the calling thread, if any.
pub fn current_transaction() -> Option<Transaction> {
    ambient::current()
}

/// Per-thread activation stack.
pub(crate) mod ambient {
    use std::cell::RefCell;

    use crate::transaction::Transaction;

    thread_local! {
        static ACTIVE: RefCell<Vec<Transaction>> = const { RefCell::new(Vec::new()) };
    }

    pub(crate) fn current() -> Option<Transaction> {
        ACTIVE.with(|active| active.borrow().last().cloned())
    }

    pub(crate) fn is_current(transaction: &Transaction) -> bool {
        ACTIVE.with(|active| active.borrow().last() == Some(transaction))
    }

    pub(crate) fn push(transaction: Transaction) {
        ACTIVE.with(|active| active.borrow_mut().push(transaction));
    }

    /// Removes the most recent activation of `transaction`, wherever it sits
    /// in the stack.
    pub(crate) fn remove(transaction: &Transaction) {
        ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(position) = active.iter().rposition(|t| t == transaction) {
                active.remove(position);
            } else {
                tracing::debug!(
                    transaction.id = %transaction.id(),
                    "deactivated a transaction that was not active"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::reporter::MemoryReporter;

    const TRACEPARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    #[derive(Default)]
    struct Starts(Mutex<Vec<String>>);

    impl LifecycleListener for Starts {
        fn on_start(&self, transaction: &Transaction) {
            self.0.lock().unwrap().push(transaction.id().to_string());
        }
    }

    #[test]
    fn continues_upstream_trace() {
        let tracer = Tracer::builder().build();
        let transaction = tracer.start_transaction(Some(TRACEPARENT), "test");

        assert_eq!(
            transaction.trace_id().to_string(),
            "0af7651916cd43dd8448eb211c80319c"
        );
        assert_eq!(
            transaction.parent_id().map(|id| id.to_string()),
            Some("b7ad6b7169203331".to_string())
        );
        assert_ne!(transaction.id().to_string(), "b7ad6b7169203331");
    }

    #[test]
    fn malformed_header_starts_a_root() {
        let tracer = Tracer::builder().build();
        let transaction = tracer.start_transaction(Some("not-a-traceparent"), "test");

        assert_eq!(transaction.parent_id(), None);
        assert!(transaction.span_context().is_valid());
    }

    #[test]
    fn start_does_not_activate() {
        let tracer = Tracer::builder().build();
        let _transaction = tracer.start_transaction(None, "test");

        assert_eq!(tracer.current_transaction(), None);
    }

    #[test]
    fn listeners_observe_starts() {
        let starts = Arc::new(Starts::default());
        let tracer = Tracer::builder().listener(starts.clone()).build();

        let transaction = tracer.start_transaction(None, "test");

        assert_eq!(
            *starts.0.lock().unwrap(),
            vec![transaction.id().to_string()]
        );
    }

    #[test]
    fn disabled_engine_has_no_tracer() {
        let engine = Engine::default();

        assert!(!engine.is_enabled());
        assert!(engine.tracer().is_none());
        assert_eq!(engine.current_transaction(), None);
    }

    #[test]
    fn enabled_engine_reports_through_its_tracer() {
        let reporter = Arc::new(MemoryReporter::new());
        let engine = Engine::from(Tracer::builder().reporter(reporter.clone()).build());

        let tracer = engine.tracer().unwrap();
        tracer.start_transaction(None, "test").end();

        assert_eq!(reporter.len(), 1);
    }
}
