//! The request half of an exchange, as seen by handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use portside_h1::{Method, Version};

use crate::error::Error;
use crate::exchange::{AsyncHandle, BodyReader, ExchangeShared};
use crate::exec::ExecHandle;
use crate::headers::HeaderMap;

/// Wire protocol a connection negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http1 => f.write_str("HTTP/1.1"),
            Protocol::Http2 => f.write_str("HTTP/2"),
        }
    }
}

/// An inbound request.
///
/// The body is pull-based and unread until the handler asks for it; a
/// handler that never touches the body leaves draining to the connection
/// driver.
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    version: Version,
    protocol: Protocol,
    headers: HeaderMap,
    body: BodyReader,
    remote_addr: SocketAddr,
    shared: Arc<ExchangeShared>,
    exec: ExecHandle,
    async_handle: Option<AsyncHandle>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        method: Method,
        path: String,
        query: Option<String>,
        version: Version,
        protocol: Protocol,
        headers: HeaderMap,
        body: BodyReader,
        remote_addr: SocketAddr,
        shared: Arc<ExchangeShared>,
        exec: ExecHandle,
    ) -> Self {
        Self {
            method,
            path,
            query,
            version,
            protocol,
            headers,
            body,
            remote_addr,
            shared,
            exec,
            async_handle: None,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Normalised request path (no query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The client advertised `TE: trailers` and may receive trailers.
    pub fn accepts_trailers(&self) -> bool {
        self.headers.has_token("te", "trailers")
    }

    /// Streaming access to the request body.
    pub fn body_mut(&mut self) -> &mut BodyReader {
        &mut self.body
    }

    /// Read the whole body, bounded by `limit` bytes (413 beyond it).
    pub fn read_body(&mut self, limit: usize) -> Result<Vec<u8>, Error> {
        self.body.read_to_vec(limit)
    }

    /// Claim asynchronous completion.
    ///
    /// After this, returning from the handler does not finish the
    /// exchange; the handle (or one of its clones) must call `complete`.
    /// The request body moves into the handle. Repeated calls return the
    /// same handle.
    pub fn handle_async(&mut self) -> AsyncHandle {
        if let Some(handle) = &self.async_handle {
            return handle.clone();
        }
        let body = std::mem::replace(&mut self.body, BodyReader::empty());
        let handle = AsyncHandle::new(Arc::clone(&self.shared), body, self.exec.clone());
        self.async_handle = Some(handle.clone());
        handle
    }

    pub(crate) fn async_claimed(&self) -> bool {
        self.async_handle.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_request() -> Request {
        let (tx, _rx) = mpsc::unbounded_channel();
        let shared = ExchangeShared::new(1, tx);
        let mut headers = HeaderMap::new();
        headers.add("host", "example.org");
        headers.add("te", "trailers");
        Request::new(
            Method::Get,
            "/a/b".into(),
            Some("x=1".into()),
            Version::Http11,
            Protocol::Http1,
            headers,
            BodyReader::empty(),
            "127.0.0.1:1234".parse().unwrap(),
            shared,
            ExecHandle::inline_for_tests(),
        )
    }

    #[test]
    fn accessors() {
        let req = test_request();
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/a/b");
        assert_eq!(req.query(), Some("x=1"));
        assert_eq!(req.header("HOST"), Some("example.org"));
        assert!(req.accepts_trailers());
        assert_eq!(req.protocol(), Protocol::Http1);
    }

    #[test]
    fn handle_async_is_sticky() {
        let mut req = test_request();
        assert!(!req.async_claimed());
        let a = req.handle_async();
        let b = req.handle_async();
        assert!(req.async_claimed());
        // Both handles drive the same exchange.
        a.complete();
        b.complete();
    }
}
