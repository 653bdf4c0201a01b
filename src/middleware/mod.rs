//! Framework adapters that put the [`DispatchInterceptor`] around request
//! dispatch.
//!
//! [`DispatchInterceptor`]: crate::interceptor::DispatchInterceptor

#[cfg(feature = "actix")]
pub mod actix;
#[cfg(feature = "tower")]
pub mod tower;
