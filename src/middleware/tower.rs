use std::{
    fmt,
    task::{Context, Poll},
};

use http::{Request, Response};
use tower::Service;
use tower_layer::Layer;

use crate::{
    handler::Handler,
    interceptor::{DispatchFuture, DispatchInterceptor},
    tracer::Engine,
};

/// Wraps every request dispatched through the inner service in a
/// transaction.
///
/// Generally, the middleware should be used on every http route, this usually
/// means that it can be registered globally and in the last position, to be the
/// first to run, even before general logging layers.
///
/// The transaction is named after the [`Handler`] found in the response
/// extensions, or in the request extensions when the response carries none.
/// Connection details are read from a
/// [`ConnectionInfo`](crate::exchange::ConnectionInfo) request extension.
///
/// ```ignore
/// let app = Router::new()
///     .route("/foo", get(|| async {}))
///     .route("/bar", get(|| async {}))
///     .layer(TransactionLayer::new(engine));
/// ```
#[derive(Clone, Debug, Default)]
pub struct TransactionLayer {
    interceptor: DispatchInterceptor,
}

impl TransactionLayer {
    pub fn new(engine: Engine) -> Self {
        TransactionLayer {
            interceptor: DispatchInterceptor::new(engine),
        }
    }
}

impl<S> Layer<S> for TransactionLayer {
    type Service = TransactionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        TransactionService {
            service,
            interceptor: self.interceptor.clone(),
        }
    }
}

/// This service implements the transaction behavior
#[derive(Clone, Debug)]
pub struct TransactionService<S> {
    service: S,
    interceptor: DispatchInterceptor,
}

impl<S, Body, ResBody> Service<Request<Body>> for TransactionService<S>
where
    S: Service<Request<Body>, Response = Response<ResBody>>,
    S::Error: fmt::Display,
{
    type Error = S::Error;
    type Future = DispatchFuture<S::Future>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let handler = request.extensions().get::<Handler>().cloned();
        let service = &mut self.service;

        self.interceptor
            .dispatch_future(request, handler, |request| service.call(request))
    }
}
