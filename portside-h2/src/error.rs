//! HTTP/2 error codes and framing-layer errors.

use std::fmt;

/// Wire error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

/// Errors produced by the HTTP/2 layer.
///
/// Connection-level errors are fatal: the caller sends the already-queued
/// GOAWAY bytes and closes the transport. Stream-level conditions are
/// surfaced as events instead so the rest of the connection keeps going.
#[derive(Debug)]
pub enum H2Error {
    /// The client connection preface was malformed.
    BadPreface,
    /// Received a frame that violates the protocol.
    ProtocolError(String),
    /// HPACK compression state is broken; the connection cannot continue.
    CompressionError,
    /// Flow control accounting violation.
    FlowControlError,
    /// Frame size is out of bounds.
    FrameSizeError,
    /// A stream-level operation referenced a stream that no longer exists.
    StreamClosed(u32),
    /// Internal invariant failure.
    Internal(String),
}

impl H2Error {
    /// The wire error code reported in GOAWAY for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            H2Error::BadPreface | H2Error::ProtocolError(_) => ErrorCode::ProtocolError,
            H2Error::CompressionError => ErrorCode::CompressionError,
            H2Error::FlowControlError => ErrorCode::FlowControlError,
            H2Error::FrameSizeError => ErrorCode::FrameSizeError,
            H2Error::StreamClosed(_) => ErrorCode::StreamClosed,
            H2Error::Internal(_) => ErrorCode::InternalError,
        }
    }
}

impl fmt::Display for H2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadPreface => write!(f, "malformed connection preface"),
            Self::ProtocolError(s) => write!(f, "protocol error: {s}"),
            Self::CompressionError => write!(f, "HPACK compression error"),
            Self::FlowControlError => write!(f, "flow control error"),
            Self::FrameSizeError => write!(f, "frame size error"),
            Self::StreamClosed(id) => write!(f, "stream {id} is closed"),
            Self::Internal(s) => write!(f, "internal: {s}"),
        }
    }
}

impl std::error::Error for H2Error {}
