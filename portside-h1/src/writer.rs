//! HTTP/1.1 response serialisation.
//!
//! [`ResponseWriter`] is the output half of the codec: one instance per
//! response, writing wire bytes into a caller-supplied `BytesMut`. Two
//! paths exist: a single-shot full write (`Nothing -> FullSent`) and a
//! streaming path (`Nothing -> Streaming -> StreamingComplete`) that emits
//! the head once and then zero or more body writes followed by a
//! terminator. Anything after a terminal state is [`WriteError::AlreadyCompleted`].
//!
//! Mode selection follows the framing rules: a handler-set
//! `Content-Length` means fixed-length (overruns are truncated, reported to
//! the caller for logging), otherwise the writer inserts
//! `Transfer-Encoding: chunked`; HEAD responses carry the same headers as
//! their GET counterpart with every body byte suppressed; 204/304 strip
//! any `Content-Length` and never carry a body.

use bytes::{BufMut, BytesMut};

use crate::HeaderList;
use crate::date;
use crate::error::WriteError;

/// Output-side state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// No bytes emitted yet; status and headers still mutable.
    Nothing,
    /// Head emitted, body writes in progress.
    Streaming,
    /// Terminator emitted. Terminal.
    StreamingComplete,
    /// Head and complete body emitted in one call. Terminal.
    FullSent,
}

/// What happened to one streamed body write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyWriteOutcome {
    /// All bytes were emitted.
    Written(usize),
    /// The declared `Content-Length` was reached mid-write; the overrun was
    /// dropped. The caller should log a warning.
    Truncated { accepted: usize, dropped: usize },
    /// The response never carries a body (HEAD, 204, 304); the write was a
    /// no-op at the socket.
    Suppressed,
}

/// Serialises one HTTP/1.1 response.
pub struct ResponseWriter {
    state: WriterState,
    head_request: bool,
    close_connection: bool,
    trailers_negotiated: bool,
    chunked: bool,
    suppressed: bool,
    declared: Option<u64>,
    body_written: u64,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self {
            state: WriterState::Nothing,
            head_request: false,
            close_connection: false,
            trailers_negotiated: false,
            chunked: false,
            suppressed: false,
            declared: None,
            body_written: 0,
        }
    }

    /// The response answers a HEAD request: identical headers, no body bytes.
    pub fn for_head_request(mut self) -> Self {
        self.head_request = true;
        self
    }

    /// Write `Connection: close` on the head (client asked for it, the
    /// keep-alive cap was reached, or the server is draining).
    pub fn close_connection(mut self, close: bool) -> Self {
        self.close_connection = close;
        self
    }

    /// The request carried `TE: trailers`, so declared trailers may be sent.
    pub fn trailers_negotiated(mut self, negotiated: bool) -> Self {
        self.trailers_negotiated = negotiated;
        self
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Total body bytes emitted so far (suppressed bodies stay at zero).
    pub fn body_bytes_written(&self) -> u64 {
        self.body_written
    }

    /// Single-shot response: head plus entire body in one buffer fill.
    ///
    /// `Content-Length` is set from `body` (204/304 excepted); a HEAD
    /// response gets the same head with the body bytes left out.
    pub fn write_full(
        &mut self,
        out: &mut BytesMut,
        status: u16,
        headers: &mut HeaderList,
        body: &[u8],
    ) -> Result<(), WriteError> {
        self.check_nothing()?;
        self.suppressed = body_is_suppressed(status, self.head_request);

        if strips_body_headers(status) {
            remove_header(headers, "content-length");
            remove_header(headers, "transfer-encoding");
        } else {
            set_header(headers, "content-length", &body.len().to_string());
        }
        self.finish_head(out, status, headers);

        if !self.suppressed {
            out.put_slice(body);
            self.body_written = body.len() as u64;
        }
        self.state = WriterState::FullSent;
        Ok(())
    }

    /// Emit the head and enter streaming mode.
    ///
    /// A handler-set `Content-Length` selects fixed-length framing;
    /// otherwise `Transfer-Encoding: chunked` is inserted.
    pub fn start_streaming(
        &mut self,
        out: &mut BytesMut,
        status: u16,
        headers: &mut HeaderList,
    ) -> Result<(), WriteError> {
        self.check_nothing()?;
        self.suppressed = body_is_suppressed(status, self.head_request);

        if strips_body_headers(status) {
            remove_header(headers, "content-length");
            remove_header(headers, "transfer-encoding");
        } else if let Some(declared) = get_header(headers, "content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.declared = Some(declared);
        } else {
            set_header(headers, "transfer-encoding", "chunked");
            self.chunked = true;
        }

        self.finish_head(out, status, headers);
        self.state = WriterState::Streaming;
        Ok(())
    }

    /// Append one body write in the current framing.
    pub fn write_body(
        &mut self,
        out: &mut BytesMut,
        data: &[u8],
    ) -> Result<BodyWriteOutcome, WriteError> {
        self.check_streaming()?;
        if self.suppressed {
            return Ok(BodyWriteOutcome::Suppressed);
        }
        if data.is_empty() {
            return Ok(BodyWriteOutcome::Written(0));
        }

        if self.chunked {
            put_chunk(out, data);
            self.body_written += data.len() as u64;
            return Ok(BodyWriteOutcome::Written(data.len()));
        }

        // Fixed-length framing: truncate at the declared boundary.
        let declared = self.declared.unwrap_or(u64::MAX);
        let remaining = declared.saturating_sub(self.body_written);
        let accepted = (data.len() as u64).min(remaining) as usize;
        out.put_slice(&data[..accepted]);
        self.body_written += accepted as u64;
        if accepted < data.len() {
            Ok(BodyWriteOutcome::Truncated {
                accepted,
                dropped: data.len() - accepted,
            })
        } else {
            Ok(BodyWriteOutcome::Written(accepted))
        }
    }

    /// Terminate a streamed response.
    ///
    /// Chunked responses get the last-chunk marker and, when `TE: trailers`
    /// was negotiated, the declared trailer block. Fixed-length responses
    /// are checked against their declared length; a short body is a
    /// [`WriteError::LengthMismatch`] and the exchange must end in error.
    pub fn finish(
        &mut self,
        out: &mut BytesMut,
        trailers: Option<&HeaderList>,
    ) -> Result<(), WriteError> {
        self.check_streaming()?;

        if let Some(t) = trailers {
            if !t.is_empty() && !self.chunked && !self.suppressed {
                return Err(WriteError::TrailersNotAllowed);
            }
        }

        if self.chunked && !self.suppressed {
            out.put_slice(b"0\r\n");
            if self.trailers_negotiated {
                if let Some(trailers) = trailers {
                    for (name, value) in trailers {
                        put_header_line(out, name, value);
                    }
                }
            }
            out.put_slice(b"\r\n");
        } else if !self.suppressed {
            if let Some(declared) = self.declared {
                if self.body_written != declared {
                    self.state = WriterState::StreamingComplete;
                    return Err(WriteError::LengthMismatch {
                        declared,
                        written: self.body_written,
                    });
                }
            }
        }

        self.state = WriterState::StreamingComplete;
        Ok(())
    }

    // -- Internal --

    fn check_nothing(&self) -> Result<(), WriteError> {
        match self.state {
            WriterState::Nothing => Ok(()),
            WriterState::Streaming => Err(WriteError::HeadersAlreadySent),
            WriterState::FullSent | WriterState::StreamingComplete => {
                Err(WriteError::AlreadyCompleted)
            }
        }
    }

    fn check_streaming(&self) -> Result<(), WriteError> {
        match self.state {
            WriterState::Streaming => Ok(()),
            WriterState::Nothing => Err(WriteError::HeadersAlreadySent),
            WriterState::FullSent | WriterState::StreamingComplete => {
                Err(WriteError::AlreadyCompleted)
            }
        }
    }

    /// Status line + headers + blank line, with `Date` and
    /// `Connection: close` filled in when the handler did not.
    fn finish_head(&self, out: &mut BytesMut, status: u16, headers: &mut HeaderList) {
        if get_header(headers, "date").is_none() {
            headers.push(("date".into(), date::now()));
        }
        if self.close_connection && get_header(headers, "connection").is_none() {
            headers.push(("connection".into(), "close".into()));
        }

        out.put_slice(b"HTTP/1.1 ");
        out.put_slice(status.to_string().as_bytes());
        out.put_u8(b' ');
        out.put_slice(reason_phrase(status).as_bytes());
        out.put_slice(b"\r\n");
        for (name, value) in headers.iter() {
            put_header_line(out, name, value);
        }
        out.put_slice(b"\r\n");
    }
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether body bytes are dropped at the socket for this response.
fn body_is_suppressed(status: u16, head_request: bool) -> bool {
    head_request || strips_body_headers(status)
}

/// Statuses that never carry a body and shed framing headers.
fn strips_body_headers(status: u16) -> bool {
    status == 204 || status == 304 || (100..200).contains(&status)
}

fn put_chunk(out: &mut BytesMut, data: &[u8]) {
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

fn put_header_line(out: &mut BytesMut, name: &str, value: &str) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(b"\r\n");
}

fn get_header<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn set_header(headers: &mut HeaderList, name: &str, value: &str) {
    remove_header(headers, name);
    headers.push((name.to_string(), value.to_string()));
}

fn remove_header(headers: &mut HeaderList, name: &str) {
    headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
}

/// Reason phrases for the statuses the server emits itself; anything else
/// gets an empty phrase, which clients must tolerate.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}
