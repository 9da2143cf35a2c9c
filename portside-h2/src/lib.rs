//! Sans-IO server-side HTTP/2 (RFC 7540) with HPACK (RFC 7541).
//!
//! This crate is the framing half of an HTTP/2 server: a
//! [`ServerConnection`] consumes raw transport bytes, maintains the
//! SETTINGS/stream/flow-control state machines, and produces
//! [`ServerEvent`]s plus outgoing bytes. It never touches a socket; the
//! owning driver pumps bytes both ways:
//!
//! ```rust
//! use portside_h2::{ServerConnection, ServerEvent, Settings};
//!
//! let mut conn = ServerConnection::new(Settings::server_default());
//! // bytes from the socket:
//! //   conn.recv(&buf)?;
//! // events for the application:
//! //   while let Some(event) = conn.poll_event() { ... }
//! // bytes back to the socket:
//! //   socket.write_all(&conn.take_pending_send())?;
//! ```
//!
//! Inbound flow control is consumer-driven: every
//! [`ServerEvent::Data`] carries its flow-controlled cost, and the window
//! only refills when the application calls
//! [`ServerConnection::release_capacity`]. Outbound DATA is queued per
//! stream and split against the peer's windows, so a stream with a zero
//! window never blocks its siblings on the same connection.

pub mod connection;
pub mod error;
pub mod flowcontrol;
pub mod frame;
pub mod hpack;
mod huffman;
pub mod settings;
mod stream;

pub use connection::{CLIENT_PREFACE, ServerConnection, ServerEvent};
pub use error::{ErrorCode, H2Error};
pub use hpack::{Decoder, Encoder, HeaderField};
pub use settings::Settings;
pub use stream::StreamState;
