//! Server error taxonomy.
//!
//! These are error *kinds*, not transport details: each maps to a specific
//! wire-level reaction (a canned status page, a silent close, a retry
//! hint). The mapping lives with the connection drivers; handlers mostly
//! produce and consume [`Error`] values.

use std::io;

use thiserror::Error;

/// Errors produced and propagated by the server core.
#[derive(Debug, Error)]
pub enum Error {
    /// The request could not be accepted (400, 413, 414 or 431). The
    /// connection is answered with the canned page and closed.
    #[error("invalid request ({status}): {detail}")]
    InvalidRequest { status: u16, detail: String },

    /// The application executor queue is full; answered with 503.
    #[error("rejected due to overload")]
    RejectedOverload,

    /// The peer closed or reset the connection mid-exchange.
    #[error("client disconnected")]
    ClientDisconnected,

    /// An idle, request-read, or response-write deadline fired.
    #[error("timed out ({status})")]
    TimedOut { status: u16 },

    /// TLS handshake or record-layer failure.
    #[error("TLS failure: {0}")]
    TlsFailure(String),

    /// An absolute-form target must be re-requested at its relative form.
    #[error("redirect required to {target}")]
    RedirectRequired { target: String },

    /// A handler returned `NotHandled` after claiming the async handle.
    #[error("handler returned NotHandled after claiming async completion")]
    IllegalHandlerState,

    /// Handler or internal failure with an HTTP status mapping.
    #[error("{detail}")]
    Status { status: u16, detail: String },

    /// Unclassified internal failure; answered with 500.
    #[error("internal error: {0}")]
    Internal(String),

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration detected by `ConfigBuilder::build`.
    #[error("configuration: {0}")]
    Config(String),
}

impl Error {
    /// Construct an error that renders as a specific status page.
    pub fn with_status(status: u16, detail: impl Into<String>) -> Self {
        Error::Status {
            status,
            detail: detail.into(),
        }
    }

    /// The response status used when this error is reported to the client
    /// before any response bytes have been written.
    pub fn response_status(&self) -> u16 {
        match self {
            Error::InvalidRequest { status, .. } => *status,
            Error::RejectedOverload => 503,
            Error::ClientDisconnected => 499, // never sent; bookkeeping only
            Error::TimedOut { status } => *status,
            Error::TlsFailure(_) => 500,
            Error::RedirectRequired { .. } => 301,
            Error::IllegalHandlerState => 500,
            Error::Status { status, .. } => *status,
            Error::Internal(_) | Error::Io(_) | Error::Config(_) => 500,
        }
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn closes_connection(&self) -> bool {
        !matches!(self, Error::Status { .. } | Error::RedirectRequired { .. })
    }
}
