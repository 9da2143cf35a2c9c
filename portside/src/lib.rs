//! portside — an embeddable HTTP/1.1 and HTTP/2 server library.
//!
//! The wire protocol engines are sans-IO crates (`portside-h1`,
//! `portside-h2`); this crate owns sockets and pumps them: an accept loop
//! per listener, one driver task per connection, a TLS channel over
//! rustls, and an application executor so blocking handler code never
//! stalls the I/O workers.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use portside::{ConfigBuilder, Server};
//!
//! let config = ConfigBuilder::new().http_port(8080).build().unwrap();
//! let server = Server::builder(config)
//!     .handler(|_req: &mut portside::Request, resp: &mut portside::Response| {
//!         resp.content_type("text/plain");
//!         resp.write("Hello 0")?;
//!         Ok(true)
//!     })
//!     .start()
//!     .unwrap();
//!
//! println!("listening on {}", server.http_addr().unwrap());
//! # server.stop(std::time::Duration::from_secs(5));
//! ```
//!
//! Handlers form a chain: each returns `Ok(true)` to claim the exchange
//! or `Ok(false)` to pass; an unclaimed request is answered 404. A
//! handler may claim asynchronous completion through
//! [`Request::handle_async`], after which the returned [`AsyncHandle`]
//! owns writes and completion from any thread.
//!
//! Backpressure is cooperative on both sides: request bodies are pulled
//! (each pull acknowledges the previous chunk back into flow control),
//! and streamed response writes block until their bytes reach the
//! socket.

pub mod config;
pub mod conn;
pub mod counter;
pub mod cursor;
pub mod error;
pub mod exchange;
pub mod exec;
pub mod handler;
pub mod headers;
pub mod metrics;
pub mod request;
pub mod response;
pub mod route;
pub mod server;
pub mod stats;
pub mod tls;

pub use portside_h1::{Method, Version};

pub use config::{BodyTooLargeAction, Config, ConfigBuilder, GzipConfig, HandlerQueue};
pub use conn::ConnectionView;
pub use error::Error;
pub use exchange::{
    AsyncHandle, BodyReader, CompletionListener, DoneAck, ExchangeOutcome, ExchangeState,
    RequestBodyListener,
};
pub use handler::{Handler, UnhandledErrorHandler};
pub use headers::HeaderMap;
pub use request::{Protocol, Request};
pub use response::Response;
pub use route::{PathParams, RouteHandler, RouteTemplate};
pub use server::{Server, ServerBuilder};
pub use stats::StatsSnapshot;
pub use tls::{TlsSessionInfo, TlsSettings};
