//! What the dispatch hooks read from an in-flight request.

use std::net::SocketAddr;

use http::{header::HOST, uri::Scheme, Request};

use crate::transaction::Transaction;

/// An inbound request as seen by the dispatch hooks.
///
/// Implemented for [`http::Request`] and, with the `actix` feature, for
/// actix-web's `ServiceRequest`.
pub trait Exchange {
    fn method(&self) -> &str;

    /// First value of header `name`, if it is valid UTF-8.
    fn header(&self, name: &str) -> Option<&str>;

    fn scheme(&self) -> Option<&str>;

    fn host(&self) -> Option<&str>;

    /// Port named by the request; `None` means the scheme's default.
    fn port(&self) -> Option<u16>;

    fn path(&self) -> &str;

    fn query(&self) -> Option<&str>;

    /// Whether the request arrived over TLS.
    fn is_secure(&self) -> bool;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// The transaction an upstream component attached to this exchange.
    fn attachment(&self) -> Option<Transaction>;
}

/// Connection details a server stores in the request extensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_addr: Option<SocketAddr>,
    pub secure: bool,
}

/// Exchange-scoped slot holding a transaction across re-entries of the same
/// logical request. The dispatch hooks only read it.
#[derive(Debug, Clone)]
pub struct ExchangeTransaction(pub Transaction);

/// Stores `transaction` in the exchange-scoped slot of `request`.
pub fn attach_transaction<B>(request: &mut Request<B>, transaction: Transaction) {
    request
        .extensions_mut()
        .insert(ExchangeTransaction(transaction));
}

/// Splits a `Host` header value into host and optional port. IPv6 hosts keep
/// their brackets.
pub(crate) fn split_host(authority: &str) -> (&str, Option<u16>) {
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => {
                let port = authority[end + 1..]
                    .strip_prefix(':')
                    .and_then(|port| port.parse().ok());
                (&authority[..=end], port)
            }
            None => (authority, None),
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        None => (authority, None),
    }
}

impl<B> Exchange for Request<B> {
    fn method(&self) -> &str {
        Request::method(self).as_str()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name)?.to_str().ok()
    }

    /// Scheme of an absolute URI, else derived from the connection.
    fn scheme(&self) -> Option<&str> {
        match self.uri().scheme_str() {
            Some(scheme) => Some(scheme),
            None if Exchange::is_secure(self) => Some("https"),
            None => Some("http"),
        }
    }

    /// Host of an absolute URI, else from the `Host` header.
    fn host(&self) -> Option<&str> {
        match self.uri().host() {
            Some(host) => Some(host),
            None => Some(split_host(self.header(HOST.as_str())?).0),
        }
    }

    fn port(&self) -> Option<u16> {
        if self.uri().host().is_some() {
            return self.uri().port_u16();
        }
        split_host(self.header(HOST.as_str())?).1
    }

    fn path(&self) -> &str {
        self.uri().path()
    }

    fn query(&self) -> Option<&str> {
        self.uri().query()
    }

    fn is_secure(&self) -> bool {
        match self.extensions().get::<ConnectionInfo>() {
            Some(connection) => connection.secure,
            None => self.uri().scheme() == Some(&Scheme::HTTPS),
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.extensions()
            .get::<ConnectionInfo>()
            .and_then(|connection| connection.remote_addr)
    }

    fn attachment(&self) -> Option<Transaction> {
        self.extensions()
            .get::<ExchangeTransaction>()
            .map(|attached| attached.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{reporter::MemoryReporter, tracer::Tracer};

    #[test]
    fn absolute_uri_components() {
        let request = Request::get("https://example.com:8443/hello?name=world")
            .body(())
            .unwrap();

        assert_eq!(Exchange::method(&request), "GET");
        assert_eq!(request.scheme(), Some("https"));
        assert_eq!(request.host(), Some("example.com"));
        assert_eq!(request.port(), Some(8443));
        assert_eq!(request.path(), "/hello");
        assert_eq!(request.query(), Some("name=world"));
        assert!(request.is_secure());
    }

    #[test]
    fn origin_form_falls_back_to_host_header() {
        let request = Request::get("/hello")
            .header(HOST, "localhost:8080")
            .body(())
            .unwrap();

        assert_eq!(request.scheme(), Some("http"));
        assert_eq!(request.host(), Some("localhost"));
        assert_eq!(request.port(), Some(8080));
        assert_eq!(request.query(), None);
        assert!(!request.is_secure());
    }

    #[test]
    fn default_port_is_none() {
        let request = Request::get("/")
            .header(HOST, "example.com")
            .body(())
            .unwrap();

        assert_eq!(request.host(), Some("example.com"));
        assert_eq!(request.port(), None);
    }

    #[test]
    fn connection_info_from_extensions() {
        let remote: SocketAddr = "10.0.0.7:51234".parse().unwrap();
        let request = Request::get("/")
            .extension(ConnectionInfo {
                remote_addr: Some(remote),
                secure: true,
            })
            .body(())
            .unwrap();

        assert_eq!(request.remote_addr(), Some(remote));
        assert!(request.is_secure());
        assert_eq!(request.scheme(), Some("https"));
    }

    #[test]
    fn attachment_round_trips_through_extensions() {
        let tracer = Tracer::builder()
            .reporter(Arc::new(MemoryReporter::new()))
            .build();
        let transaction = tracer.start_transaction(None, "test");
        let mut request = Request::new(());
        assert_eq!(request.attachment(), None);

        attach_transaction(&mut request, transaction.clone());

        assert_eq!(request.attachment(), Some(transaction));
    }

    #[test]
    fn splits_host_headers() {
        assert_eq!(split_host("example.com"), ("example.com", None));
        assert_eq!(split_host("example.com:80"), ("example.com", Some(80)));
        assert_eq!(split_host("[::1]:8080"), ("[::1]", Some(8080)));
        assert_eq!(split_host("[::1]"), ("[::1]", None));
        assert_eq!(split_host("example.com:http"), ("example.com:http", None));
    }
}
