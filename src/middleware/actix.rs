use std::{future, future::Ready, net::SocketAddr};

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};

use crate::{
    exchange::{split_host, Exchange, ExchangeTransaction},
    handler::Handler,
    interceptor::{Completion, DispatchFuture, DispatchInterceptor},
    tracer::Engine,
    transaction::{CapturedError, Transaction},
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
///
/// ```ignore
/// let app = App::new()
///     .route("/foo", web::get().to(foo))
///     .route("/bar", web::get().to(bar))
///     .wrap(TransactionLayer::new(engine));
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

impl<S, B> Transform<S, ServiceRequest> for TransactionLayer
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Error = Error;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;
    type InitError = ();
    type Response = ServiceResponse<B>;
    type Transform = TransactionService<S>;

    fn new_transform(&self, service: S) -> Self::Future {
        future::ready(Ok(TransactionService {
            service,
            interceptor: self.interceptor.clone(),
        }))
    }
}

/// This service implements the transaction behavior
pub struct TransactionService<S> {
    service: S,
    interceptor: DispatchInterceptor,
}

impl<S, Body> Service<ServiceRequest> for TransactionService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<Body>, Error = Error>,
    S::Future: 'static,
    Body: 'static,
{
    type Error = Error;
    type Future = DispatchFuture<S::Future>;
    type Response = ServiceResponse<Body>;

    // This service is ready when its next service is ready
    forward_ready!(service);

    fn call(&self, request: ServiceRequest) -> Self::Future {
        let handler = request.extensions().get::<Handler>().cloned();

        self.interceptor
            .dispatch_future(request, handler, |request| self.service.call(request))
    }
}

impl Exchange for ServiceRequest {
    fn method(&self) -> &str {
        ServiceRequest::method(self).as_str()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name)?.to_str().ok()
    }

    fn scheme(&self) -> Option<&str> {
        match self.uri().scheme_str() {
            Some(scheme) => Some(scheme),
            None if Exchange::is_secure(self) => Some("https"),
            None => Some("http"),
        }
    }

    fn host(&self) -> Option<&str> {
        match self.uri().host() {
            Some(host) => Some(host),
            None => Some(split_host(self.header("host")?).0),
        }
    }

    fn port(&self) -> Option<u16> {
        if self.uri().host().is_some() {
            return self.uri().port_u16();
        }
        split_host(self.header("host")?).1
    }

    fn path(&self) -> &str {
        self.uri().path()
    }

    fn query(&self) -> Option<&str> {
        self.uri().query()
    }

    fn is_secure(&self) -> bool {
        self.app_config().secure()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr()
    }

    fn attachment(&self) -> Option<Transaction> {
        self.extensions()
            .get::<ExchangeTransaction>()
            .map(|attached| attached.0.clone())
    }
}

impl<B> Completion for Result<ServiceResponse<B>, Error> {
    fn status(&self) -> Option<u16> {
        match self {
            Ok(response) => Some(response.status().as_u16()),
            Err(error) => Some(error.as_response_error().status_code().as_u16()),
        }
    }

    fn handler(&self) -> Option<Handler> {
        let response = self.as_ref().ok()?;
        let handler = response.response().extensions().get::<Handler>().cloned();
        handler
    }

    /// Handler errors reach the middleware as error responses, so both the
    /// `Err` case and an error carried by the response are captured.
    fn error(&self) -> Option<CapturedError> {
        match self {
            Ok(response) => response.response().error().map(CapturedError::new),
            Err(error) => Some(CapturedError::new(error)),
        }
    }
}
