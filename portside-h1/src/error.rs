//! Errors produced by the HTTP/1.1 codec.

use std::fmt;

/// An unrecoverable parse failure.
///
/// Recoverable problems (unknown method, oversized URL or header block) are
/// reported as rejections on the request head so the message can still be
/// consumed; a `ParseError` means the byte stream itself is broken and the
/// connection must be closed after the canned error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Response status to send before closing, when one can still be sent.
    pub status: u16,
    /// Short description for logs and the error body.
    pub message: &'static str,
}

impl ParseError {
    pub(crate) const fn new(status: u16, message: &'static str) -> Self {
        Self { status, message }
    }

    pub(crate) const fn bad_request(message: &'static str) -> Self {
        Self::new(400, message)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid HTTP message ({}): {}", self.status, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Errors from the response writer state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// A write was attempted after the response reached a terminal state.
    AlreadyCompleted,
    /// `start` was called twice, or a full write followed a streaming start.
    HeadersAlreadySent,
    /// Fewer body bytes were written than `Content-Length` declared.
    LengthMismatch { declared: u64, written: u64 },
    /// Trailers were supplied on a response that is not chunked.
    TrailersNotAllowed,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::AlreadyCompleted => write!(f, "response already completed"),
            WriteError::HeadersAlreadySent => write!(f, "response headers already sent"),
            WriteError::LengthMismatch { declared, written } => write!(
                f,
                "content-length declared {declared} bytes but {written} were written"
            ),
            WriteError::TrailersNotAllowed => {
                write!(f, "trailers are only valid on chunked responses")
            }
        }
    }
}

impl std::error::Error for WriteError {}
