//! Sans-IO HTTP/1.1 message codec.
//!
//! `portside-h1` contains the byte-level HTTP/1.1 engine: an incremental
//! [`MessageParser`] that turns a possibly-fragmented byte stream into
//! [`ParseEvent`]s, and a [`ResponseWriter`] that serialises status line,
//! headers, fixed-length or chunked bodies, and trailers.
//!
//! Neither type performs I/O. The caller feeds slices in and copies bytes
//! out, which keeps the crate trivially testable and lets the server drive
//! the same state machines over plaintext sockets, TLS channels, or test
//! vectors.
//!
//! # Parsing
//!
//! ```rust
//! use portside_h1::{MessageParser, ParseEvent, ParserLimits, ParseStep};
//!
//! let mut parser = MessageParser::request(ParserLimits::default());
//! let input = b"GET /hello HTTP/1.1\r\nhost: example.org\r\n\r\n";
//! let step = parser.next_event(input).unwrap();
//! match step {
//!     ParseStep::Event { event: ParseEvent::NewRequest(head), .. } => {
//!         assert_eq!(head.target.path, "/hello");
//!     }
//!     other => panic!("expected a request head, got {other:?}"),
//! }
//! ```
//!
//! Body chunks are borrowed slices of the caller's input and must be
//! consumed before the underlying buffer is recycled.

pub mod date;
pub mod error;
pub mod method;
pub mod parser;
pub mod writer;

pub use error::{ParseError, WriteError};
pub use method::{Method, Version};
pub use parser::{
    BodyKind, MessageParser, ParseEvent, ParseStep, ParserLimits, Reject, RequestHead,
    ResponseHead, Target,
};
pub use writer::{BodyWriteOutcome, ResponseWriter, WriterState, reason_phrase};

/// Header fields in wire order. Names are lowercase ASCII.
pub type HeaderList = Vec<(String, String)>;
