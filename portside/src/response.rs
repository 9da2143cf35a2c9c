//! The response half of an exchange, as seen by handlers.
//!
//! The facade never touches the socket: every operation becomes a command
//! on the exchange's channel, executed by the connection driver in
//! arrival order. Status and headers are snapshotted into the command
//! that emits the first wire byte; mutations after that point have no
//! effect, matching the head-immutability rule.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use tokio::sync::oneshot;

use portside_h1::reason_phrase;

use crate::error::Error;
use crate::exchange::{CompletionListener, ExchangeShared, ResponseCmd};
use crate::headers::HeaderMap;

/// An outbound response under construction.
pub struct Response {
    shared: Arc<ExchangeShared>,
    status: Option<u16>,
    headers: HeaderMap,
    started: bool,
}

impl Response {
    pub(crate) fn new(shared: Arc<ExchangeShared>) -> Self {
        Self {
            shared,
            status: None,
            headers: HeaderMap::new(),
            started: false,
        }
    }

    /// Set the status code. Defaults to 200 when a body is written and
    /// 204 when the handler finishes without writing anything.
    pub fn status(&mut self, status: u16) {
        self.status = Some(status);
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status
    }

    /// Set (replace) a header.
    pub fn header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Append a header, keeping existing values.
    pub fn add_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers.add(name, value);
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn content_type(&mut self, value: impl Into<String>) {
        self.headers.set("content-type", value);
    }

    /// Whether the head has been committed to the wire.
    pub fn has_started(&self) -> bool {
        self.started || self.shared.response_started.load(Ordering::Acquire)
    }

    /// Send the whole response at once. `Content-Length` is derived from
    /// the body; callable once.
    pub fn write(&mut self, body: impl Into<Bytes>) -> Result<(), Error> {
        if self.started {
            return Err(Error::Internal(
                "response already started; use send_chunk for streaming".into(),
            ));
        }
        self.started = true;
        self.shared.send(ResponseCmd::Full {
            status: self.status.unwrap_or(200),
            headers: self.headers.as_list(),
            body: body.into(),
        });
        Ok(())
    }

    /// Stream one chunk. The first call commits the head (chunked unless
    /// a `Content-Length` header was set); blocks until the bytes reach
    /// the socket, which is the write-side backpressure.
    pub fn send_chunk(&mut self, data: impl Into<Bytes>) -> Result<(), Error> {
        if !self.started {
            self.started = true;
            self.shared.send(ResponseCmd::Start {
                status: self.status.unwrap_or(200),
                headers: self.headers.as_list(),
            });
        }
        let (tx, rx) = oneshot::channel();
        self.shared.send(ResponseCmd::Chunk {
            data: data.into(),
            ack: Some(tx),
        });
        match rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(Error::ClientDisconnected),
        }
    }

    /// Declare a trailer field, sent after the last chunk when the client
    /// negotiated `TE: trailers` on a chunked response.
    pub fn set_trailer(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let mut trailers = self.shared.trailers.lock().expect("trailer lock");
        trailers.push((name.as_ref().to_ascii_lowercase(), value.into()));
    }

    /// Respond 302 to `location`.
    pub fn redirect(&mut self, location: impl Into<String>) -> Result<(), Error> {
        self.status = Some(302);
        self.headers.set("location", location.into());
        self.write(Bytes::new())
    }

    /// Run `listener` when the exchange reaches its terminal state.
    pub fn on_complete(&self, listener: CompletionListener) {
        self.shared.add_completion_listener(listener);
    }

    /// Render the standard minimal error page.
    pub(crate) fn write_error_page(&mut self, status: u16, detail: &str) {
        if self.has_started() {
            return;
        }
        self.status = Some(status);
        self.headers.set("content-type", "text/html;charset=utf-8");
        let body = error_page(status, detail);
        let _ = self.write(Bytes::from(body));
    }

    /// Snapshot for the completion command.
    pub(crate) fn snapshot(&self) -> (Option<u16>, portside_h1::HeaderList) {
        (self.status, self.headers.as_list())
    }

    pub(crate) fn shared(&self) -> &Arc<ExchangeShared> {
        &self.shared
    }
}

/// `<h1>code reason</h1><p>detail</p>` with the detail HTML-escaped.
pub(crate) fn error_page(status: u16, detail: &str) -> String {
    let reason = reason_phrase(status);
    let mut escaped = String::with_capacity(detail.len());
    for c in detail.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    format!("<h1>{status} {reason}</h1><p>{escaped}</p>")
}
