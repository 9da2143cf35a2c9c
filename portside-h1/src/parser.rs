//! Incremental HTTP/1.1 message parser.
//!
//! A single byte-at-a-time state machine that consumes a possibly-fragmented
//! byte stream and produces [`ParseEvent`]s. Body bytes are handed out as
//! borrowed slices of the caller's input; everything else is accumulated
//! into owned buffers so parsing can resume at any split point.
//!
//! Recoverable protocol violations (unknown method, oversized URL, oversized
//! header block) do not abort the parse: they are recorded as a [`Reject`]
//! on the request head and the parser keeps consuming the message, so the
//! server can still answer with the right status code. Only a byte stream
//! that cannot be framed at all produces a [`ParseError`].

use crate::HeaderList;
use crate::error::ParseError;
use crate::method::{Method, Version};

/// Hard multiplier applied to the configured limits before the parser gives
/// up consuming an oversized token and fails the connection instead.
const OVERRUN_FACTOR: usize = 4;

/// Longest method token accepted before the request line is declared broken.
const MAX_METHOD_LEN: usize = 24;

/// Parser size limits.
#[derive(Debug, Clone, Copy)]
pub struct ParserLimits {
    /// Request targets longer than this are rejected with 414.
    pub max_url_size: usize,
    /// Header blocks (and trailer blocks) larger than this are rejected with 431.
    pub max_headers_size: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_url_size: 8175,
            max_headers_size: 8192,
        }
    }
}

/// A recoverable request rejection discovered during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    /// Method token is not in the supported set.
    MethodNotAllowed,
    /// Request target exceeded `max_url_size`.
    UriTooLong,
    /// Header block exceeded `max_headers_size`.
    HeaderFieldsTooLarge,
}

impl Reject {
    /// The response status this rejection maps to.
    pub fn status(&self) -> u16 {
        match self {
            Reject::MethodNotAllowed => 405,
            Reject::UriTooLong => 414,
            Reject::HeaderFieldsTooLarge => 431,
        }
    }
}

/// Normalised request target: decoded path plus the raw query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub path: String,
    pub query: Option<String>,
}

/// How the message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body follows the headers.
    None,
    /// Exactly this many bytes follow.
    Fixed(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Body extends to end of stream (responses without framing headers).
    Unspecified,
}

/// A fully parsed request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: Target,
    pub version: Version,
    pub headers: HeaderList,
    pub body: BodyKind,
    /// Recoverable rejection to be answered with the matching status.
    pub reject: Option<Reject>,
    /// Authority-form target without a scheme: redirect here with a 301.
    pub redirect: Option<String>,
    /// The request asked for a websocket upgrade; remaining bytes belong
    /// to the frame layer.
    pub websocket_upgrade: bool,
}

impl RequestHead {
    /// First header value for a (lowercase) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A fully parsed response head (used when parsing the peer's responses,
/// e.g. in tests and upstream probes).
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderList,
    pub body: BodyKind,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Events produced by the parser.
#[derive(Debug)]
pub enum ParseEvent<'a> {
    /// A request head is complete. Body events follow, ending in `EndOfBody`.
    NewRequest(Box<RequestHead>),
    /// A response head is complete (response parsing mode only).
    NewResponse(Box<ResponseHead>),
    /// A run of body bytes. `last` is set on the final slice of a
    /// fixed-length body; chunked bodies signal the end via `EndOfBody`.
    BodyChunk { data: &'a [u8], last: bool },
    /// The message body is complete; the parser is ready for the next message.
    EndOfBody,
    /// Trailer fields that followed the last chunk.
    Trailers(HeaderList),
    /// Clean end of stream between messages.
    Eof,
}

/// Result of one parser invocation.
#[derive(Debug)]
pub enum ParseStep<'a> {
    /// An event was produced after consuming `consumed` input bytes.
    Event {
        consumed: usize,
        event: ParseEvent<'a>,
    },
    /// All `consumed` bytes were absorbed without completing an event.
    NeedMore { consumed: usize },
}

/// Wire position, one variant per byte class the machine can be waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReqStart,
    Method,
    Target,
    Version,
    ReqLineEnd,
    RespStart,
    Status,
    Reason,
    StatusLineEnd,
    HeaderStart,
    HeaderName,
    HeaderNameEnd,
    HeaderValue,
    HeaderValueEnd,
    HeadersEnd,
    FixedBody,
    UnspecifiedBody,
    ChunkStart,
    ChunkSize,
    ChunkExts,
    ChunkHeaderEnd,
    ChunkData,
    ChunkDataRead,
    ChunkDataEnd,
    LastChunk,
    ChunkedBodyEnd,
    Trailers,
    WebsocketHandoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Request,
    Response,
}

/// Incremental HTTP/1.1 parser for one direction of a connection.
pub struct MessageParser {
    mode: Mode,
    limits: ParserLimits,
    state: State,

    // Token accumulators, reused across messages.
    token: Vec<u8>,
    name_buf: String,
    value_buf: String,
    reason_buf: String,
    headers: HeaderList,
    trailers: HeaderList,

    // Per-message scratch.
    header_bytes: usize,
    target_len: usize,
    in_trailers: bool,
    reject: Option<Reject>,
    redirect: Option<String>,
    method: Option<Method>,
    version: Option<Version>,
    target: Option<Target>,
    status: u16,
    body_remaining: u64,
    chunk_remaining: u64,
    pending_end_of_body: bool,
    saw_eof: bool,
    /// Response mode: the request this response answers was HEAD or CONNECT.
    head_response: bool,
}

impl MessageParser {
    /// Parser for inbound requests.
    pub fn request(limits: ParserLimits) -> Self {
        Self::new(Mode::Request, limits)
    }

    /// Parser for responses (test clients, health probes).
    pub fn response(limits: ParserLimits) -> Self {
        Self::new(Mode::Response, limits)
    }

    fn new(mode: Mode, limits: ParserLimits) -> Self {
        Self {
            mode,
            limits,
            state: match mode {
                Mode::Request => State::ReqStart,
                Mode::Response => State::RespStart,
            },
            token: Vec::new(),
            name_buf: String::new(),
            value_buf: String::new(),
            reason_buf: String::new(),
            headers: Vec::new(),
            trailers: Vec::new(),
            header_bytes: 0,
            target_len: 0,
            in_trailers: false,
            reject: None,
            redirect: None,
            method: None,
            version: None,
            target: None,
            status: 0,
            body_remaining: 0,
            chunk_remaining: 0,
            pending_end_of_body: false,
            saw_eof: false,
            head_response: false,
        }
    }

    /// Response mode: tell the parser the corresponding request was HEAD or
    /// CONNECT, so a body-less response is framed correctly.
    pub fn expect_no_body(&mut self) {
        self.head_response = true;
    }

    /// Whether the parser stopped at a websocket upgrade boundary. Bytes fed
    /// after this point are not consumed; they belong to the frame layer.
    pub fn is_websocket_handoff(&self) -> bool {
        self.state == State::WebsocketHandoff
    }

    /// Whether the parser is between messages (safe point for idle close).
    pub fn is_idle(&self) -> bool {
        !self.pending_end_of_body
            && matches!(self.state, State::ReqStart | State::RespStart)
            && self.token.is_empty()
    }

    /// Consume input and produce at most one event.
    ///
    /// Call in a loop, advancing the input by `consumed` each time, until
    /// [`ParseStep::NeedMore`] asks for another read. `BodyChunk` slices
    /// borrow from `input` and must be used before the buffer is recycled.
    pub fn next_event<'a>(&mut self, input: &'a [u8]) -> Result<ParseStep<'a>, ParseError> {
        if self.pending_end_of_body {
            self.pending_end_of_body = false;
            self.reset_for_next_message();
            return Ok(ParseStep::Event {
                consumed: 0,
                event: ParseEvent::EndOfBody,
            });
        }

        let mut i = 0;
        while i < input.len() {
            match self.state {
                State::FixedBody => {
                    let take = (self.body_remaining as usize).min(input.len() - i);
                    self.body_remaining -= take as u64;
                    let last = self.body_remaining == 0;
                    if last {
                        self.pending_end_of_body = true;
                    }
                    return Ok(ParseStep::Event {
                        consumed: i + take,
                        event: ParseEvent::BodyChunk {
                            data: &input[i..i + take],
                            last,
                        },
                    });
                }
                State::ChunkData => {
                    let take = (self.chunk_remaining as usize).min(input.len() - i);
                    self.chunk_remaining -= take as u64;
                    if self.chunk_remaining == 0 {
                        self.state = State::ChunkDataRead;
                    }
                    return Ok(ParseStep::Event {
                        consumed: i + take,
                        event: ParseEvent::BodyChunk {
                            data: &input[i..i + take],
                            last: false,
                        },
                    });
                }
                State::UnspecifiedBody => {
                    return Ok(ParseStep::Event {
                        consumed: input.len(),
                        event: ParseEvent::BodyChunk {
                            data: &input[i..],
                            last: false,
                        },
                    });
                }
                State::WebsocketHandoff => {
                    // Remaining bytes are websocket frames, not ours.
                    return Ok(ParseStep::NeedMore { consumed: i });
                }
                _ => {
                    let b = input[i];
                    i += 1;
                    if let Some(event) = self.step(b)? {
                        return Ok(ParseStep::Event { consumed: i, event });
                    }
                }
            }
        }
        Ok(ParseStep::NeedMore { consumed: i })
    }

    /// Signal end of stream.
    ///
    /// Returns `Eof` at a message boundary, `EndOfBody` when an
    /// EOF-delimited body just finished, and an error when the stream ended
    /// mid-message.
    pub fn on_eof(&mut self) -> Result<ParseEvent<'static>, ParseError> {
        if self.saw_eof {
            return Ok(ParseEvent::Eof);
        }
        self.saw_eof = true;
        match self.state {
            State::UnspecifiedBody => Ok(ParseEvent::EndOfBody),
            State::ReqStart | State::RespStart if self.token.is_empty() => Ok(ParseEvent::Eof),
            State::WebsocketHandoff => Ok(ParseEvent::Eof),
            _ => Err(ParseError::bad_request("unexpected end of stream")),
        }
    }

    // -- Single-byte transitions --

    fn step(&mut self, b: u8) -> Result<Option<ParseEvent<'static>>, ParseError> {
        match self.state {
            State::ReqStart => {
                // Tolerate stray CRLF between pipelined requests.
                if b == b'\r' || b == b'\n' {
                    return Ok(None);
                }
                self.token.clear();
                self.token.push(b);
                self.state = State::Method;
                Ok(None)
            }
            State::Method => {
                if b == b' ' {
                    self.method = Method::from_bytes(&self.token);
                    if self.method.is_none() {
                        self.set_reject(Reject::MethodNotAllowed);
                    }
                    self.token.clear();
                    self.target_len = 0;
                    self.state = State::Target;
                } else if self.token.len() >= MAX_METHOD_LEN {
                    return Err(ParseError::bad_request("method token too long"));
                } else {
                    self.token.push(b);
                }
                Ok(None)
            }
            State::Target => {
                if b == b' ' {
                    self.finish_target()?;
                    self.token.clear();
                    self.state = State::Version;
                } else if !(0x21..=0x7e).contains(&b) {
                    return Err(ParseError::bad_request("invalid byte in request target"));
                } else {
                    self.target_len += 1;
                    if self.target_len > self.limits.max_url_size {
                        self.set_reject(Reject::UriTooLong);
                        if self.target_len > self.limits.max_url_size * OVERRUN_FACTOR {
                            return Err(ParseError::new(414, "request target overruns buffer"));
                        }
                        // Keep consuming without accumulating.
                    } else {
                        self.token.push(b);
                    }
                }
                Ok(None)
            }
            State::Version => {
                if b == b'\r' {
                    self.version = Version::from_bytes(&self.token);
                    if self.version.is_none() {
                        return Err(ParseError::new(505, "unsupported HTTP version"));
                    }
                    self.token.clear();
                    self.state = State::ReqLineEnd;
                } else if self.token.len() >= 8 {
                    return Err(ParseError::new(505, "unsupported HTTP version"));
                } else {
                    self.token.push(b);
                }
                Ok(None)
            }
            State::ReqLineEnd => {
                if b != b'\n' {
                    return Err(ParseError::bad_request("request line missing LF"));
                }
                self.header_bytes = 0;
                self.state = State::HeaderStart;
                Ok(None)
            }

            // -- Status line (response parsing mode) --
            State::RespStart => {
                if b == b' ' {
                    self.version = Version::from_bytes(&self.token);
                    if self.version.is_none() {
                        return Err(ParseError::bad_request("malformed status line version"));
                    }
                    self.token.clear();
                    self.status = 0;
                    self.state = State::Status;
                } else if b == b'\r' || b == b'\n' {
                    return Err(ParseError::bad_request("truncated status line"));
                } else if self.token.len() >= 8 {
                    return Err(ParseError::bad_request("malformed status line version"));
                } else {
                    self.token.push(b);
                }
                Ok(None)
            }
            State::Status => {
                if b.is_ascii_digit() {
                    if self.status >= 1000 {
                        return Err(ParseError::bad_request("status code too long"));
                    }
                    self.status = self.status * 10 + u16::from(b - b'0');
                } else if b == b' ' || b == b'\r' {
                    if !(100..=599).contains(&self.status) {
                        return Err(ParseError::bad_request("status code out of range"));
                    }
                    self.reason_buf.clear();
                    self.state = if b == b' ' {
                        State::Reason
                    } else {
                        State::StatusLineEnd
                    };
                } else {
                    return Err(ParseError::bad_request("non-digit in status code"));
                }
                Ok(None)
            }
            State::Reason => {
                if b == b'\r' {
                    self.state = State::StatusLineEnd;
                } else {
                    self.reason_buf.push(b as char);
                }
                Ok(None)
            }
            State::StatusLineEnd => {
                if b != b'\n' {
                    return Err(ParseError::bad_request("status line missing LF"));
                }
                self.header_bytes = 0;
                self.state = State::HeaderStart;
                Ok(None)
            }

            // -- Header block (shared by headers and trailers) --
            State::HeaderStart => {
                if b == b'\r' {
                    self.state = State::HeadersEnd;
                } else if b == b' ' || b == b'\t' {
                    return Err(ParseError::bad_request("obsolete header line folding"));
                } else if b == b':' {
                    return Err(ParseError::bad_request("empty header field name"));
                } else {
                    self.count_header_byte()?;
                    self.name_buf.clear();
                    self.push_name_byte(b)?;
                    self.state = State::HeaderName;
                }
                Ok(None)
            }
            State::HeaderName => {
                self.count_header_byte()?;
                if b == b':' {
                    if self.name_buf.is_empty() && !self.budget_exceeded() {
                        return Err(ParseError::bad_request("empty header field name"));
                    }
                    self.value_buf.clear();
                    self.state = State::HeaderNameEnd;
                } else if b == b'\r' || b == b'\n' {
                    return Err(ParseError::bad_request("header line missing colon"));
                } else {
                    self.push_name_byte(b)?;
                }
                Ok(None)
            }
            State::HeaderNameEnd => {
                // Skip optional whitespace before the value.
                if b == b' ' || b == b'\t' {
                    self.count_header_byte()?;
                } else if b == b'\r' {
                    // Empty value.
                    self.state = State::HeaderValueEnd;
                } else {
                    self.count_header_byte()?;
                    self.push_value_byte(b);
                    self.state = State::HeaderValue;
                }
                Ok(None)
            }
            State::HeaderValue => {
                if b == b'\r' {
                    self.state = State::HeaderValueEnd;
                } else if b == b'\n' {
                    return Err(ParseError::bad_request("bare LF in header value"));
                } else {
                    self.count_header_byte()?;
                    self.push_value_byte(b);
                }
                Ok(None)
            }
            State::HeaderValueEnd => {
                if b != b'\n' {
                    return Err(ParseError::bad_request("header line missing LF"));
                }
                self.commit_header_line();
                self.state = if self.in_trailers {
                    State::Trailers
                } else {
                    State::HeaderStart
                };
                Ok(None)
            }
            State::HeadersEnd => {
                if b != b'\n' {
                    return Err(ParseError::bad_request("header block missing final LF"));
                }
                self.finish_headers().map(Some)
            }

            // -- Chunked body --
            State::ChunkStart => {
                if !b.is_ascii_hexdigit() {
                    return Err(ParseError::bad_request("chunk size is not hex"));
                }
                self.chunk_remaining = hex_value(b);
                self.token.clear();
                self.token.push(b);
                self.state = State::ChunkSize;
                Ok(None)
            }
            State::ChunkSize => {
                if b.is_ascii_hexdigit() {
                    if self.token.len() >= 16 {
                        return Err(ParseError::new(413, "chunk size overflows"));
                    }
                    self.token.push(b);
                    self.chunk_remaining = self.chunk_remaining * 16 + hex_value(b);
                } else if b == b';' {
                    self.state = State::ChunkExts;
                } else if b == b'\r' {
                    self.state = State::ChunkHeaderEnd;
                } else {
                    return Err(ParseError::bad_request("invalid chunk size line"));
                }
                Ok(None)
            }
            State::ChunkExts => {
                // Extensions are tolerated and discarded.
                if b == b'\r' {
                    self.state = State::ChunkHeaderEnd;
                } else if b == b'\n' {
                    return Err(ParseError::bad_request("bare LF in chunk extensions"));
                }
                Ok(None)
            }
            State::ChunkHeaderEnd => {
                if b != b'\n' {
                    return Err(ParseError::bad_request("chunk size line missing LF"));
                }
                if self.chunk_remaining == 0 {
                    self.in_trailers = true;
                    self.header_bytes = 0;
                    self.trailers.clear();
                    self.state = State::LastChunk;
                } else {
                    self.state = State::ChunkData;
                }
                Ok(None)
            }
            State::ChunkDataRead => {
                if b != b'\r' {
                    return Err(ParseError::bad_request("chunk data missing CR"));
                }
                self.state = State::ChunkDataEnd;
                Ok(None)
            }
            State::ChunkDataEnd => {
                if b != b'\n' {
                    return Err(ParseError::bad_request("chunk data missing LF"));
                }
                self.state = State::ChunkStart;
                Ok(None)
            }
            State::LastChunk => {
                if b == b'\r' {
                    self.state = State::ChunkedBodyEnd;
                } else if b == b' ' || b == b'\t' {
                    return Err(ParseError::bad_request("obsolete trailer line folding"));
                } else {
                    // First trailer field.
                    self.count_header_byte()?;
                    self.name_buf.clear();
                    self.push_name_byte(b)?;
                    self.state = State::HeaderName;
                }
                Ok(None)
            }
            State::Trailers => {
                if b == b'\r' {
                    self.state = State::ChunkedBodyEnd;
                } else if b == b' ' || b == b'\t' {
                    return Err(ParseError::bad_request("obsolete trailer line folding"));
                } else {
                    self.count_header_byte()?;
                    self.name_buf.clear();
                    self.push_name_byte(b)?;
                    self.state = State::HeaderName;
                }
                Ok(None)
            }
            State::ChunkedBodyEnd => {
                if b != b'\n' {
                    return Err(ParseError::bad_request("chunked body missing final LF"));
                }
                if self.in_trailers && !self.trailers.is_empty() {
                    let trailers = std::mem::take(&mut self.trailers);
                    self.pending_end_of_body = true;
                    Ok(Some(ParseEvent::Trailers(trailers)))
                } else {
                    self.reset_for_next_message();
                    Ok(Some(ParseEvent::EndOfBody))
                }
            }

            State::FixedBody
            | State::ChunkData
            | State::UnspecifiedBody
            | State::WebsocketHandoff => unreachable!("body states are handled by next_event"),
        }
    }

    // -- Header helpers --

    fn count_header_byte(&mut self) -> Result<(), ParseError> {
        self.header_bytes += 1;
        if self.header_bytes > self.limits.max_headers_size {
            if self.in_trailers {
                // The head was already delivered; an oversized trailer block
                // can only be answered by failing the message.
                return Err(ParseError::new(431, "trailer block too large"));
            }
            self.set_reject(Reject::HeaderFieldsTooLarge);
            if self.header_bytes > self.limits.max_headers_size * OVERRUN_FACTOR {
                return Err(ParseError::new(431, "header block overruns buffer"));
            }
        }
        Ok(())
    }

    fn budget_exceeded(&self) -> bool {
        self.header_bytes > self.limits.max_headers_size
    }

    fn push_name_byte(&mut self, b: u8) -> Result<(), ParseError> {
        if b <= 0x20 || b >= 0x7f {
            return Err(ParseError::bad_request("invalid byte in header name"));
        }
        if !self.budget_exceeded() {
            self.name_buf.push(b.to_ascii_lowercase() as char);
        }
        Ok(())
    }

    fn push_value_byte(&mut self, b: u8) {
        if !self.budget_exceeded() {
            self.value_buf.push(b as char);
        }
    }

    fn commit_header_line(&mut self) {
        if self.budget_exceeded() {
            return;
        }
        let name = std::mem::take(&mut self.name_buf);
        let mut value = std::mem::take(&mut self.value_buf);
        while value.ends_with(' ') || value.ends_with('\t') {
            value.pop();
        }
        if self.in_trailers {
            self.trailers.push((name, value));
        } else {
            self.headers.push((name, value));
        }
    }

    /// Blank line seen: resolve the body mode and emit the head event.
    fn finish_headers(&mut self) -> Result<ParseEvent<'static>, ParseError> {
        let headers = std::mem::take(&mut self.headers);
        let body = self.resolve_body_kind(&headers)?;

        match self.mode {
            Mode::Request => {
                let websocket_upgrade = wants_websocket_upgrade(&headers);
                let head = RequestHead {
                    method: self.method.unwrap_or(Method::Get),
                    target: self.target.take().unwrap_or(Target {
                        path: String::from("/"),
                        query: None,
                    }),
                    version: self.version.unwrap_or(Version::Http11),
                    headers,
                    body,
                    reject: self.reject.take(),
                    redirect: self.redirect.take(),
                    websocket_upgrade,
                };
                self.state = if websocket_upgrade {
                    State::WebsocketHandoff
                } else {
                    match body {
                        BodyKind::None => {
                            self.pending_end_of_body = true;
                            State::ReqStart
                        }
                        BodyKind::Fixed(n) => {
                            self.body_remaining = n;
                            State::FixedBody
                        }
                        BodyKind::Chunked => State::ChunkStart,
                        // Requests never have EOF-delimited bodies.
                        BodyKind::Unspecified => unreachable!(),
                    }
                };
                Ok(ParseEvent::NewRequest(Box::new(head)))
            }
            Mode::Response => {
                let head = ResponseHead {
                    version: self.version.unwrap_or(Version::Http11),
                    status: self.status,
                    reason: std::mem::take(&mut self.reason_buf),
                    headers,
                    body,
                };
                self.state = match body {
                    BodyKind::None => {
                        self.pending_end_of_body = true;
                        State::RespStart
                    }
                    BodyKind::Fixed(n) => {
                        self.body_remaining = n;
                        State::FixedBody
                    }
                    BodyKind::Chunked => State::ChunkStart,
                    BodyKind::Unspecified => State::UnspecifiedBody,
                };
                Ok(ParseEvent::NewResponse(Box::new(head)))
            }
        }
    }

    /// Body-mode resolution, in priority order: chunked transfer-encoding,
    /// then content-length, then the no-body rules for the message kind.
    fn resolve_body_kind(&mut self, headers: &HeaderList) -> Result<BodyKind, ParseError> {
        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        for (name, value) in headers {
            match name.as_str() {
                "transfer-encoding" => {
                    if value
                        .split(',')
                        .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
                    {
                        chunked = true;
                    }
                }
                "content-length" => {
                    let parsed: u64 = value
                        .trim()
                        .parse()
                        .map_err(|_| ParseError::bad_request("malformed content-length"))?;
                    if let Some(existing) = content_length {
                        if existing != parsed {
                            return Err(ParseError::bad_request("conflicting content-length"));
                        }
                    }
                    content_length = Some(parsed);
                }
                _ => {}
            }
        }

        if chunked {
            return Ok(BodyKind::Chunked);
        }
        if let Some(n) = content_length {
            return Ok(if n == 0 { BodyKind::None } else { BodyKind::Fixed(n) });
        }
        match self.mode {
            Mode::Request => Ok(BodyKind::None),
            Mode::Response => {
                let status = self.status;
                if self.head_response || (100..200).contains(&status) || status == 204 || status == 304
                {
                    Ok(BodyKind::None)
                } else {
                    Ok(BodyKind::Unspecified)
                }
            }
        }
    }

    // -- Target handling --

    /// Normalise the accumulated request target.
    ///
    /// Absolute-form with a scheme is accepted and reduced to its path.
    /// Authority-form without a scheme (`//host/path`) produces a redirect
    /// signal. Only the four unreserved percent escapes are decoded.
    fn finish_target(&mut self) -> Result<(), ParseError> {
        let raw = std::mem::take(&mut self.token);

        if raw.is_empty() {
            return Err(ParseError::bad_request("empty request target"));
        }

        let rel: &[u8] = if let Some(rest) = strip_scheme(&raw) {
            path_of_authority_form(rest)
        } else if raw.starts_with(b"//") {
            let path = path_of_authority_form(&raw[2..]);
            self.redirect = Some(decode_path(path));
            path
        } else if raw == b"*" {
            b"*"
        } else if raw.starts_with(b"/") {
            &raw
        } else {
            return Err(ParseError::bad_request("request target is not origin form"));
        };

        let (path_bytes, query) = match rel.iter().position(|&b| b == b'?') {
            Some(q) => (&rel[..q], Some(String::from_utf8_lossy(&rel[q + 1..]).into_owned())),
            None => (rel, None),
        };

        self.target = Some(Target {
            path: decode_path(path_bytes),
            query,
        });
        Ok(())
    }

    // -- Lifecycle --

    fn set_reject(&mut self, reject: Reject) {
        // The first rejection wins; later ones would mask the root cause.
        if self.reject.is_none() {
            self.reject = Some(reject);
        }
    }

    fn reset_for_next_message(&mut self) {
        self.state = match self.mode {
            Mode::Request => State::ReqStart,
            Mode::Response => State::RespStart,
        };
        self.token.clear();
        self.name_buf.clear();
        self.value_buf.clear();
        self.reason_buf.clear();
        self.headers.clear();
        self.trailers.clear();
        self.header_bytes = 0;
        self.target_len = 0;
        self.in_trailers = false;
        self.reject = None;
        self.redirect = None;
        self.method = None;
        self.version = None;
        self.target = None;
        self.status = 0;
        self.body_remaining = 0;
        self.chunk_remaining = 0;
    }
}

fn hex_value(b: u8) -> u64 {
    match b {
        b'0'..=b'9' => u64::from(b - b'0'),
        b'a'..=b'f' => u64::from(b - b'a' + 10),
        b'A'..=b'F' => u64::from(b - b'A' + 10),
        _ => 0,
    }
}

/// Strip `http://` or `https://`, returning the authority + path remainder.
fn strip_scheme(raw: &[u8]) -> Option<&[u8]> {
    let lower_matches = |prefix: &[u8]| {
        raw.len() > prefix.len() && raw[..prefix.len()].eq_ignore_ascii_case(prefix)
    };
    if lower_matches(b"http://") {
        Some(&raw[7..])
    } else if lower_matches(b"https://") {
        Some(&raw[8..])
    } else {
        None
    }
}

/// Given `authority/path?query`, return the `/path?query` suffix (or `/`).
fn path_of_authority_form(rest: &[u8]) -> &[u8] {
    match rest.iter().position(|&b| b == b'/') {
        Some(p) => &rest[p..],
        None => b"/",
    }
}

/// Decode the four unreserved percent escapes (`%7E %5F %2E %2D`); all
/// other bytes, including other escapes, pass through unchanged. Shared
/// with the HTTP/2 layer so both protocols normalise paths identically.
pub fn decode_path(path: &[u8]) -> String {
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < path.len() {
        if path[i] == b'%' && i + 2 < path.len() {
            match (path[i + 1].to_ascii_uppercase(), path[i + 2].to_ascii_uppercase()) {
                (b'7', b'E') => {
                    out.push('~');
                    i += 3;
                    continue;
                }
                (b'5', b'F') => {
                    out.push('_');
                    i += 3;
                    continue;
                }
                (b'2', b'E') => {
                    out.push('.');
                    i += 3;
                    continue;
                }
                (b'2', b'D') => {
                    out.push('-');
                    i += 3;
                    continue;
                }
                _ => {}
            }
        }
        out.push(path[i] as char);
        i += 1;
    }
    out
}

/// `Connection: upgrade` + `Upgrade: websocket`.
fn wants_websocket_upgrade(headers: &HeaderList) -> bool {
    let upgrade = headers.iter().any(|(n, v)| {
        n == "upgrade" && v.split(',').any(|t| t.trim().eq_ignore_ascii_case("websocket"))
    });
    let connection = headers.iter().any(|(n, v)| {
        n == "connection" && v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
    });
    upgrade && connection
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed the whole input, collecting owned copies of every event.
    fn drive(parser: &mut MessageParser, mut input: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        loop {
            match parser.next_event(input).unwrap() {
                ParseStep::Event { consumed, event } => {
                    out.push(describe(&event));
                    input = &input[consumed..];
                }
                ParseStep::NeedMore { consumed } => {
                    input = &input[consumed..];
                    if input.is_empty() {
                        return out;
                    }
                }
            }
        }
    }

    fn describe(event: &ParseEvent<'_>) -> String {
        match event {
            ParseEvent::NewRequest(h) => format!(
                "req {} {} reject={:?}",
                h.method,
                h.target.path,
                h.reject.map(|r| r.status())
            ),
            ParseEvent::NewResponse(h) => format!("resp {}", h.status),
            ParseEvent::BodyChunk { data, last } => {
                format!("body {:?} last={last}", String::from_utf8_lossy(data))
            }
            ParseEvent::EndOfBody => "end".into(),
            ParseEvent::Trailers(t) => format!("trailers {t:?}"),
            ParseEvent::Eof => "eof".into(),
        }
    }

    fn parse_one_head(input: &[u8]) -> Box<RequestHead> {
        let mut parser = MessageParser::request(ParserLimits::default());
        match parser.next_event(input).unwrap() {
            ParseStep::Event {
                event: ParseEvent::NewRequest(head),
                ..
            } => head,
            other => panic!("expected NewRequest, got {other:?}"),
        }
    }

    #[test]
    fn simple_get() {
        let head = parse_one_head(b"GET /blah HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.target.path, "/blah");
        assert_eq!(head.target.query, None);
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.header("host"), Some("x"));
        assert_eq!(head.body, BodyKind::None);
        assert!(head.reject.is_none());
    }

    #[test]
    fn no_body_request_reaches_end_immediately() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let events = drive(&mut parser, b"GET / HTTP/1.1\r\nhost: x\r\n\r\n");
        assert_eq!(events, vec!["req GET / reject=None", "end"]);
        assert!(parser.is_idle());
    }

    #[test]
    fn query_is_split_raw() {
        let head = parse_one_head(b"GET /a/b?x=1&y=%20 HTTP/1.1\r\n\r\n");
        assert_eq!(head.target.path, "/a/b");
        assert_eq!(head.target.query.as_deref(), Some("x=1&y=%20"));
    }

    #[test]
    fn unreserved_escapes_are_decoded_others_kept() {
        let head = parse_one_head(b"GET /%7Euser/%5Fa/%2e%2D/%41 HTTP/1.1\r\n\r\n");
        assert_eq!(head.target.path, "/~user/_a/.-/%41");
    }

    #[test]
    fn headers_are_lowercased_and_ordered() {
        let head =
            parse_one_head(b"GET / HTTP/1.1\r\nX-One: a\r\nx-two: b\r\nX-One: c\r\n\r\n");
        let expected: HeaderList = vec![
            ("x-one".into(), "a".into()),
            ("x-two".into(), "b".into()),
            ("x-one".into(), "c".into()),
        ];
        assert_eq!(head.headers, expected);
    }

    #[test]
    fn fixed_body_chunks_and_completion() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let events = drive(
            &mut parser,
            b"POST /u HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello",
        );
        assert_eq!(
            events,
            vec![
                "req POST /u reject=None",
                "body \"hello\" last=true",
                "end"
            ]
        );
    }

    #[test]
    fn fixed_body_split_across_reads() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let mut events = drive(&mut parser, b"POST /u HTTP/1.1\r\ncontent-length: 5\r\n\r\nhel");
        events.extend(drive(&mut parser, b"lo"));
        assert_eq!(
            events,
            vec![
                "req POST /u reject=None",
                "body \"hel\" last=false",
                "body \"lo\" last=true",
                "end"
            ]
        );
    }

    #[test]
    fn content_length_zero_is_no_body() {
        let head = parse_one_head(b"POST / HTTP/1.1\r\ncontent-length: 0\r\n\r\n");
        assert_eq!(head.body, BodyKind::None);
    }

    #[test]
    fn byte_at_a_time_feeding() {
        let raw = b"GET /one?q=2 HTTP/1.1\r\nhost: a\r\naccept: b\r\n\r\n";
        let mut parser = MessageParser::request(ParserLimits::default());
        let mut events = Vec::new();
        for &b in raw.iter() {
            let input = [b];
            let mut slice = &input[..];
            loop {
                match parser.next_event(slice).unwrap() {
                    ParseStep::Event { consumed, event } => {
                        events.push(describe(&event));
                        slice = &slice[consumed..];
                    }
                    ParseStep::NeedMore { .. } => break,
                }
            }
        }
        assert_eq!(events, vec!["req GET /one reject=None", "end"]);
    }

    #[test]
    fn pipelined_requests() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let events = drive(
            &mut parser,
            b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n",
        );
        assert_eq!(
            events,
            vec![
                "req GET /a reject=None",
                "end",
                "req GET /b reject=None",
                "end"
            ]
        );
    }

    #[test]
    fn chunked_body_with_extensions() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let events = drive(
            &mut parser,
            b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n1\r\n \r\n0\r\n\r\n",
        );
        assert_eq!(
            events,
            vec![
                "req POST / reject=None",
                "body \"hello\" last=false",
                "body \" \" last=false",
                "end"
            ]
        );
    }

    #[test]
    fn chunked_trailers_are_reported() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let events = drive(
            &mut parser,
            b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Sum: 9\r\n\r\n",
        );
        assert_eq!(
            events,
            vec![
                "req POST / reject=None",
                "body \"abc\" last=false",
                "trailers [(\"x-sum\", \"9\")]",
                "end"
            ]
        );
    }

    #[test]
    fn chunk_size_hex_parsing() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let body = b"A\r\n0123456789\r\n0\r\n\r\n";
        let mut input = Vec::from(&b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n"[..]);
        input.extend_from_slice(body);
        let events = drive(&mut parser, &input);
        assert_eq!(events[1], "body \"0123456789\" last=false");
    }

    #[test]
    fn unknown_method_is_rejected_but_parsed() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let events = drive(&mut parser, b"BREW /pot HTTP/1.1\r\nhost: x\r\n\r\n");
        assert_eq!(events, vec!["req GET /pot reject=Some(405)", "end"]);
    }

    #[test]
    fn url_at_limit_accepted_one_over_rejected() {
        let limits = ParserLimits {
            max_url_size: 64,
            max_headers_size: 8192,
        };
        let path_ok = format!("/{}", "a".repeat(63));
        let req = format!("GET {path_ok} HTTP/1.1\r\n\r\n");
        let mut parser = MessageParser::request(limits);
        match parser.next_event(req.as_bytes()).unwrap() {
            ParseStep::Event {
                event: ParseEvent::NewRequest(head),
                ..
            } => {
                assert!(head.reject.is_none());
                assert_eq!(head.target.path.len(), 64);
            }
            other => panic!("{other:?}"),
        }

        let path_long = format!("/{}", "a".repeat(64));
        let req = format!("GET {path_long} HTTP/1.1\r\n\r\n");
        let mut parser = MessageParser::request(limits);
        match parser.next_event(req.as_bytes()).unwrap() {
            ParseStep::Event {
                event: ParseEvent::NewRequest(head),
                ..
            } => assert_eq!(head.reject, Some(Reject::UriTooLong)),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn header_block_budget_boundary() {
        // One header line "a: <v>\r\n" contributes name + colon + space +
        // value = 3 + v.len() counted bytes (the CRLF is framing).
        let limits = ParserLimits {
            max_url_size: 8175,
            max_headers_size: 32,
        };
        // Header section of exactly 32 counted bytes.
        let mut parser = MessageParser::request(limits);
        let head = {
            let req = format!("GET / HTTP/1.1\r\na: {}\r\n\r\n", "v".repeat(29));
            match parser.next_event(req.as_bytes()).unwrap() {
                ParseStep::Event {
                    event: ParseEvent::NewRequest(h),
                    ..
                } => h,
                other => panic!("{other:?}"),
            }
        };
        assert!(head.reject.is_none(), "{:?}", head.reject);

        // One more byte tips it over.
        let mut parser = MessageParser::request(limits);
        let req = format!("GET / HTTP/1.1\r\na: {}\r\n\r\n", "v".repeat(30));
        match parser.next_event(req.as_bytes()).unwrap() {
            ParseStep::Event {
                event: ParseEvent::NewRequest(h),
                ..
            } => assert_eq!(h.reject, Some(Reject::HeaderFieldsTooLarge)),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn absolute_form_with_scheme_is_accepted() {
        let head = parse_one_head(b"GET http://example.org/over/there?x=1 HTTP/1.1\r\n\r\n");
        assert_eq!(head.target.path, "/over/there");
        assert_eq!(head.target.query.as_deref(), Some("x=1"));
        assert!(head.redirect.is_none());
    }

    #[test]
    fn authority_form_without_scheme_redirects() {
        let head = parse_one_head(b"GET //example.org/over/there HTTP/1.1\r\n\r\n");
        assert_eq!(head.redirect.as_deref(), Some("/over/there"));
    }

    #[test]
    fn websocket_upgrade_hands_off() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let input =
            b"GET /chat HTTP/1.1\r\nconnection: Upgrade\r\nupgrade: websocket\r\n\r\n\x81\x05";
        match parser.next_event(input).unwrap() {
            ParseStep::Event {
                consumed,
                event: ParseEvent::NewRequest(head),
            } => {
                assert!(head.websocket_upgrade);
                // The frame bytes after the head are not consumed.
                match parser.next_event(&input[consumed..]).unwrap() {
                    ParseStep::NeedMore { consumed: 0 } => {}
                    other => panic!("{other:?}"),
                }
                assert!(parser.is_websocket_handoff());
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn bad_version_fails() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let err = parser
            .next_event(b"GET / HTTP/3.0\r\n\r\n")
            .unwrap_err();
        assert_eq!(err.status, 505);
    }

    #[test]
    fn conflicting_content_length_fails() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let err = parser
            .next_event(b"POST / HTTP/1.1\r\ncontent-length: 2\r\ncontent-length: 3\r\n\r\n")
            .unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[test]
    fn eof_between_messages_is_clean() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let _ = drive(&mut parser, b"GET / HTTP/1.1\r\n\r\n");
        assert!(matches!(parser.on_eof().unwrap(), ParseEvent::Eof));
    }

    #[test]
    fn eof_mid_message_is_an_error() {
        let mut parser = MessageParser::request(ParserLimits::default());
        let _ = drive(&mut parser, b"GET / HT");
        assert!(parser.on_eof().is_err());
    }

    #[test]
    fn response_mode_content_length() {
        let mut parser = MessageParser::response(ParserLimits::default());
        let events = drive(
            &mut parser,
            b"HTTP/1.1 200 OK\r\ncontent-length: 7\r\n\r\nHello 0",
        );
        assert_eq!(
            events,
            vec!["resp 200", "body \"Hello 0\" last=true", "end"]
        );
    }

    #[test]
    fn response_mode_eof_delimited() {
        let mut parser = MessageParser::response(ParserLimits::default());
        let events = drive(&mut parser, b"HTTP/1.1 200 OK\r\n\r\npartial");
        assert_eq!(events, vec!["resp 200", "body \"partial\" last=false"]);
        assert!(matches!(parser.on_eof().unwrap(), ParseEvent::EndOfBody));
    }

    #[test]
    fn response_204_has_no_body() {
        let mut parser = MessageParser::response(ParserLimits::default());
        let events = drive(&mut parser, b"HTTP/1.1 204 No Content\r\nhello: world\r\n\r\n");
        assert_eq!(events, vec!["resp 204", "end"]);
    }

    #[test]
    fn chunked_round_trip_arbitrary_bytes() {
        // Encode an arbitrary byte sequence as chunks, decode through the
        // parser, and compare.
        let payload: Vec<u8> = (0u32..4096).map(|i| (i % 251) as u8).collect();
        let mut wire = Vec::from(&b"POST / HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n"[..]);
        for chunk in payload.chunks(333) {
            wire.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            wire.extend_from_slice(chunk);
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(b"0\r\n\r\n");

        let mut parser = MessageParser::request(ParserLimits::default());
        let mut input = &wire[..];
        let mut decoded = Vec::new();
        let mut ended = false;
        while !input.is_empty() || !ended {
            match parser.next_event(input).unwrap() {
                ParseStep::Event { consumed, event } => {
                    match event {
                        ParseEvent::BodyChunk { data, .. } => decoded.extend_from_slice(data),
                        ParseEvent::EndOfBody => ended = true,
                        ParseEvent::NewRequest(_) => {}
                        other => panic!("{other:?}"),
                    }
                    input = &input[consumed..];
                }
                ParseStep::NeedMore { consumed } => {
                    input = &input[consumed..];
                    if input.is_empty() {
                        break;
                    }
                }
            }
        }
        assert!(ended);
        assert_eq!(decoded, payload);
    }
}
