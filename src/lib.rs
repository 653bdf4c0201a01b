//! # Request transactions
//! This crate wraps the dispatch of inbound http requests to their handlers
//! with *transactions*: one record per logical request-response cycle,
//! correlated with upstream callers through the W3C `traceparent` header.
//!
//! ## Setup
//! The transaction engine, logging and OpenTelemetry export are set up using
//! [`setup::setup`] with a [`config::TraceConfig`]. This should be the first
//! call of any server binary. A disabled configuration yields
//! [`Engine::Disabled`], under which every hook is a no-op.
//!
//! ## Dispatch
//! [`DispatchInterceptor`] owns the entry and exit hooks. Entry starts and
//! activates a transaction and records method, socket and url of the
//! request; exit names the transaction after the [`Handler`], sets the
//! `Http <status>` result unless something deeper already did, records
//! errors, then deactivates and ends it.
//!
//! When using [`tower`] based http frameworks like [`axum`](https://docs.rs/axum/latest/axum),
//! the middleware `middleware::tower::TransactionLayer` (feature `tower`) wraps
//! every request. actix-web is covered by `middleware::actix::TransactionLayer`
//! (feature `actix`).
//!
//! Generally, the middleware should be used on every http route, this usually
//! means that it can be registered globally and in the last position, to be the
//! first to run.
//!
//! ## Propagation
//! [`http_injector`] parses incoming `traceparent` values and injects a
//! transaction's context into outgoing [`http::Request`]s.

pub mod config;
pub mod exchange;
pub mod handler;
pub mod http_injector;
pub mod interceptor;
pub mod middleware;
pub mod reporter;
pub mod setup;
pub mod tracer;
pub mod transaction;

pub use exchange::{attach_transaction, ConnectionInfo, Exchange, ExchangeTransaction};
pub use handler::Handler;
pub use interceptor::{Completion, DispatchFuture, DispatchInterceptor};
pub use tracer::{current_transaction, Engine, LifecycleListener, Tracer};
pub use transaction::{CapturedError, Scope, Transaction, TransactionData};
