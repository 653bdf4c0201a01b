//! Wraps the dispatch of an inbound request to its handler with a
//! transaction.
//!
//! Entry starts and activates a transaction and records the request; exit
//! names the transaction after the handler, records the result and any error,
//! then deactivates and ends it. Both phases live in one wrapper, either
//! [`DispatchInterceptor::dispatch`] around a synchronous call or
//! [`DispatchInterceptor::dispatch_future`] around a future that may complete
//! on another thread.
//!
//! Re-entry: when the exchange carries a transaction attached by an upstream
//! component and nothing is ambient on the current thread, that transaction
//! is re-activated before the new one is started. A new transaction is
//! started on every entry regardless.

use std::{
    any::{type_name, Any},
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    task::{Context, Poll},
};

use http::{Response, StatusCode};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::{
    exchange::Exchange,
    handler::Handler,
    http_injector::TRACE_PARENT_HEADER,
    tracer::{current_transaction, Engine},
    transaction::{CapturedError, Request, Scope, Transaction},
};

/// Type recorded on every transaction started by the interceptor.
pub const TRANSACTION_TYPE: &str = "request";

/// What a completed dispatch tells the exit hook.
pub trait Completion {
    /// Numeric response status, if one was produced.
    fn status(&self) -> Option<u16> {
        None
    }

    /// The handler that served the request, if the response names it.
    fn handler(&self) -> Option<Handler> {
        None
    }

    fn error(&self) -> Option<CapturedError> {
        None
    }
}

impl<B> Completion for Response<B> {
    fn status(&self) -> Option<u16> {
        Some(Response::status(self).as_u16())
    }

    fn handler(&self) -> Option<Handler> {
        self.extensions().get::<Handler>().cloned()
    }
}

impl<B, E: fmt::Display> Completion for Result<Response<B>, E> {
    fn status(&self) -> Option<u16> {
        self.as_ref().ok().and_then(Completion::status)
    }

    fn handler(&self) -> Option<Handler> {
        self.as_ref().ok().and_then(Completion::handler)
    }

    fn error(&self) -> Option<CapturedError> {
        self.as_ref().err().map(CapturedError::new)
    }
}

impl<E: fmt::Display> Completion for Result<StatusCode, E> {
    fn status(&self) -> Option<u16> {
        self.as_ref().ok().map(StatusCode::as_u16)
    }

    fn error(&self) -> Option<CapturedError> {
        self.as_ref().err().map(CapturedError::new)
    }
}

/// The before/after hook pair around request dispatch.
#[derive(Clone, Debug, Default)]
pub struct DispatchInterceptor {
    engine: Engine,
}

impl DispatchInterceptor {
    pub fn new(engine: Engine) -> Self {
        DispatchInterceptor { engine }
    }

    /// An interceptor whose hooks do nothing.
    pub fn disabled() -> Self {
        Self::new(Engine::Disabled)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Runs `dispatch` for `exchange` inside a transaction and returns its
    /// output untouched. A panic in `dispatch` is recorded, the transaction
    /// ended, and the panic resumed.
    pub fn dispatch<X, R, F>(&self, exchange: &X, handler: Option<&Handler>, dispatch: F) -> R
    where
        X: Exchange + ?Sized,
        R: Completion,
        F: FnOnce() -> R,
    {
        let Some((active, bindings)) = self.enter(exchange, handler.cloned()) else {
            return dispatch();
        };

        match panic::catch_unwind(AssertUnwindSafe(|| active.span.in_scope(dispatch))) {
            Ok(output) => {
                active.exit(bindings, Exit::completed(&output));
                output
            }
            Err(payload) => {
                active.exit(bindings, Exit::panicked(&*payload));
                panic::resume_unwind(payload)
            }
        }
    }

    /// Runs the entry hook now, builds the dispatch future with `make` while
    /// the transaction is ambient, and runs the exit hook when that future
    /// completes.
    pub fn dispatch_future<X, M, F>(
        &self,
        exchange: X,
        handler: Option<Handler>,
        make: M,
    ) -> DispatchFuture<F>
    where
        X: Exchange,
        M: FnOnce(X) -> F,
        F: Future,
        F::Output: Completion,
    {
        let Some((active, bindings)) = self.enter(&exchange, handler) else {
            return DispatchFuture {
                inner: Box::pin(make(exchange)),
                active: None,
            };
        };

        match panic::catch_unwind(AssertUnwindSafe(|| active.span.in_scope(|| make(exchange)))) {
            Ok(inner) => {
                bindings.suspend();
                DispatchFuture {
                    inner: Box::pin(inner),
                    active: Some(active),
                }
            }
            Err(payload) => {
                active.exit(bindings, Exit::panicked(&*payload));
                panic::resume_unwind(payload)
            }
        }
    }

    fn enter<X: Exchange + ?Sized>(
        &self,
        exchange: &X,
        handler: Option<Handler>,
    ) -> Option<(ActiveDispatch, Bindings)> {
        let tracer = self.engine.tracer()?;

        let reentered = suppress("entry", || {
            exchange
                .attachment()
                .filter(|_| current_transaction().is_none())
        })
        .flatten();
        let reentry = reentered.as_ref().and_then(|transaction| {
            tracing::debug!(
                transaction.id = %transaction.id(),
                "re-activating transaction attached to the exchange"
            );
            activate(transaction)
        });

        let started = suppress("entry", || {
            tracer.start_transaction(exchange.header(TRACE_PARENT_HEADER), type_name::<X>())
        });
        let Some(transaction) = started else {
            release(reentry);
            return None;
        };
        let scope = activate(&transaction);

        suppress("entry", || {
            transaction.update_request(|request| capture_request(request, exchange));
        });
        let span = suppress("entry", || {
            let span = tracing::info_span!(
                "dispatch",
                transaction.id = %transaction.id(),
                trace.id = %transaction.trace_id()
            );
            span.set_parent(transaction.otel_context());
            span
        })
        .unwrap_or_else(Span::none);

        Some((
            ActiveDispatch {
                transaction,
                reentered,
                handler,
                span,
            },
            Bindings { reentry, scope },
        ))
    }
}

/// Copies the request metadata, verbatim, onto the transaction.
fn capture_request<X: Exchange + ?Sized>(request: &mut Request, exchange: &X) {
    let remote_address = exchange.remote_addr().map(|address| address.to_string());

    request.with_method(exchange.method());
    request
        .socket_mut()
        .with_encrypted(exchange.is_secure())
        .with_remote_address(remote_address.as_deref());
    request
        .url_mut()
        .with_protocol(exchange.scheme())
        .with_hostname(exchange.host())
        .with_port(exchange.port())
        .with_pathname(Some(exchange.path()))
        .with_search(exchange.query());
}

/// Runs a hook body, swallowing any panic so the wrapped dispatch carries on.
fn suppress<T>(hook: &'static str, body: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => Some(value),
        Err(payload) => {
            tracing::warn!(
                hook,
                error = %CapturedError::from_panic(&*payload),
                "suppressed panic in dispatch hook"
            );
            None
        }
    }
}

fn activate(transaction: &Transaction) -> Option<Scope> {
    suppress("activate", || transaction.activate())
}

fn release(scope: Option<Scope>) {
    if let Some(scope) = scope {
        suppress("deactivate", move || scope.deactivate());
    }
}

/// State one dispatch carries from its entry hook to its exit hook.
struct ActiveDispatch {
    transaction: Transaction,
    /// Attached transaction re-activated at entry.
    reentered: Option<Transaction>,
    handler: Option<Handler>,
    span: Span,
}

/// Activations held on the current thread for one dispatch. Either may be
/// missing when its activation failed.
struct Bindings {
    reentry: Option<Scope>,
    scope: Option<Scope>,
}

impl Bindings {
    /// Releases the thread bindings of a dispatch that has not completed yet.
    fn suspend(self) {
        let Bindings { reentry, scope } = self;
        release(scope);
        release(reentry);
    }
}

/// What the exit hook learns about the finished dispatch.
struct Exit {
    handler: Option<Handler>,
    status: Option<u16>,
    error: Option<CapturedError>,
}

impl Exit {
    fn completed<C: Completion + ?Sized>(completion: &C) -> Self {
        Exit {
            handler: completion.handler(),
            status: completion.status(),
            error: completion.error(),
        }
    }

    fn panicked(payload: &(dyn Any + Send)) -> Self {
        Exit {
            handler: None,
            status: None,
            error: Some(CapturedError::from_panic(payload)),
        }
    }
}

impl ActiveDispatch {
    /// Re-activates this dispatch on the polling thread. The attached
    /// transaction is only restored when nothing else is ambient there.
    fn bind(&self) -> Bindings {
        let reentry = self
            .reentered
            .as_ref()
            .filter(|_| current_transaction().is_none())
            .and_then(activate);

        Bindings {
            reentry,
            scope: activate(&self.transaction),
        }
    }

    fn exit(self, bindings: Bindings, exit: Exit) {
        let ActiveDispatch {
            transaction,
            handler,
            ..
        } = self;
        let handler = exit.handler.or(handler);

        suppress("exit", || {
            match &handler {
                Some(handler) => match handler.transaction_name() {
                    Some(name) => {
                        transaction.with_name(name);
                    }
                    None => tracing::debug!(
                        handler = handler.type_name(),
                        "handler does not name transactions"
                    ),
                },
                None => tracing::debug!("no handler resolved for the exchange"),
            }
            if let Some(status) = exit.status {
                transaction.with_result_if_unset(format!("Http {status}"));
            }
            transaction.with_type(TRANSACTION_TYPE);
            if let Some(error) = exit.error {
                transaction.capture_exception(error);
            }
        });

        let Bindings { reentry, scope } = bindings;
        release(reentry);
        release(scope);
        suppress("end", || transaction.end());
    }
}

/// A dispatch future wrapped by [`DispatchInterceptor::dispatch_future`].
///
/// Every poll re-activates the dispatch's transactions on the polling
/// thread and releases them afterwards. Dropping the future before it
/// completes leaves the transaction un-ended.
pub struct DispatchFuture<F> {
    inner: Pin<Box<F>>,
    active: Option<ActiveDispatch>,
}

impl<F> Future for DispatchFuture<F>
where
    F: Future,
    F::Output: Completion,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(active) = this.active.as_ref() else {
            return this.inner.as_mut().poll(cx);
        };

        let bindings = active.bind();
        let polled = {
            let _entered = active.span.enter();
            panic::catch_unwind(AssertUnwindSafe(|| this.inner.as_mut().poll(cx)))
        };

        match polled {
            Ok(Poll::Pending) => {
                bindings.suspend();
                Poll::Pending
            }
            Ok(Poll::Ready(output)) => {
                if let Some(active) = this.active.take() {
                    active.exit(bindings, Exit::completed(&output));
                }
                Poll::Ready(output)
            }
            Err(payload) => {
                if let Some(active) = this.active.take() {
                    active.exit(bindings, Exit::panicked(&*payload));
                }
                panic::resume_unwind(payload)
            }
        }
    }
}

impl<F> Drop for DispatchFuture<F> {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            tracing::debug!(
                transaction.id = %active.transaction.id(),
                "dispatch dropped before completion, transaction not ended"
            );
        }
    }
}

impl<F> fmt::Debug for DispatchFuture<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchFuture")
            .field(
                "transaction",
                &self.active.as_ref().map(|active| &active.transaction),
            )
            .finish_non_exhaustive()
    }
}
