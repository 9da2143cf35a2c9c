//! Server configuration.
//!
//! Build a [`Config`] through [`ConfigBuilder`]; `build()` validates the
//! whole shape at once so a misconfigured server fails before binding a
//! socket.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::Error;
use crate::tls::TlsSettings;

/// What to do when a request body exceeds `max_request_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyTooLargeAction {
    /// Answer 413 and close once the current response allows it.
    SendResponse,
    /// Drop the connection immediately.
    KillConnection,
}

/// Application-executor queue policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerQueue {
    /// Never reject; queue grows without bound.
    Unbounded,
    /// Reject with 503 once this many jobs are waiting.
    Bounded(usize),
}

/// Response compression negotiation inputs, consumed by an output wrapper.
#[derive(Debug, Clone)]
pub struct GzipConfig {
    pub enabled: bool,
    /// Bodies below this size are never compressed.
    pub min_size: u64,
    /// Content-type prefixes eligible for compression.
    pub mime_allowlist: Vec<String>,
}

impl Default for GzipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 1400,
            mime_allowlist: vec![
                "text/".into(),
                "application/json".into(),
                "application/javascript".into(),
                "application/xml".into(),
                "image/svg+xml".into(),
            ],
        }
    }
}

/// Complete server configuration.
#[derive(Clone)]
pub struct Config {
    /// Cleartext HTTP/1.1 listener. `None` disables it; port 0 binds an
    /// ephemeral port.
    pub http_port: Option<u16>,
    /// TLS listener (H1 and, when enabled, H2 via ALPN). Requires `tls`.
    pub https_port: Option<u16>,
    /// Address both listeners bind to.
    pub bind_addr: IpAddr,

    /// Header-block budget; exceeding it answers 431.
    pub max_headers_size: usize,
    /// Request-target budget; exceeding it answers 414.
    pub max_url_size: usize,
    /// Request-body budget; exceeding it triggers `body_too_large_action`.
    pub max_request_size: u64,
    pub body_too_large_action: BodyTooLargeAction,

    /// Close connections with no socket activity for this long.
    pub idle_timeout: Duration,
    /// Deadline for progress while awaiting request-body bytes.
    pub request_read_timeout: Duration,
    /// Deadline for a single pending socket write.
    pub response_write_timeout: Duration,

    /// I/O worker threads. 0 = `min(16, 2 * cpus)`.
    pub io_threads: usize,
    /// Application executor threads.
    pub handler_threads: usize,
    pub handler_queue: HandlerQueue,

    /// Responses beyond this per-connection count carry `Connection: close`.
    pub max_keep_alive_requests: Option<u64>,

    /// Offer `h2` via ALPN on the TLS listener.
    pub h2_enabled: bool,
    pub h2_max_concurrent_streams: u32,

    pub gzip: GzipConfig,
    pub tls: Option<TlsSettings>,
    pub tcp_nodelay: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: None,
            https_port: None,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_headers_size: 8192,
            max_url_size: 8175,
            max_request_size: 24 * 1024 * 1024,
            body_too_large_action: BodyTooLargeAction::SendResponse,
            idle_timeout: Duration::from_secs(10 * 60),
            request_read_timeout: Duration::from_secs(2 * 60),
            response_write_timeout: Duration::from_secs(2 * 60),
            io_threads: 0,
            handler_threads: 8,
            handler_queue: HandlerQueue::Unbounded,
            max_keep_alive_requests: None,
            h2_enabled: true,
            h2_max_concurrent_streams: 256,
            gzip: GzipConfig::default(),
            tls: None,
            tcp_nodelay: true,
        }
    }
}

impl Config {
    /// Connection read-buffer capacity: one buffer must be able to hold
    /// the largest single token the parser accepts.
    pub fn read_buffer_size(&self) -> usize {
        self.max_url_size.max(self.max_headers_size)
    }

    /// Resolved I/O worker count.
    pub fn resolved_io_threads(&self) -> usize {
        if self.io_threads > 0 {
            return self.io_threads;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (2 * cpus).min(16)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.http_port.is_none() && self.https_port.is_none() {
            return Err(Error::Config("no listener configured".into()));
        }
        if self.https_port.is_some() && self.tls.is_none() {
            return Err(Error::Config("https_port requires tls settings".into()));
        }
        if self.max_headers_size == 0 || self.max_url_size == 0 {
            return Err(Error::Config("size limits must be positive".into()));
        }
        if self.max_request_size == 0 {
            return Err(Error::Config("max_request_size must be positive".into()));
        }
        if self.handler_threads == 0 {
            return Err(Error::Config("handler_threads must be positive".into()));
        }
        if let HandlerQueue::Bounded(0) = self.handler_queue {
            return Err(Error::Config("handler queue bound must be positive".into()));
        }
        if self.h2_max_concurrent_streams == 0 {
            return Err(Error::Config(
                "h2_max_concurrent_streams must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`Config`].
///
/// ```rust
/// use portside::ConfigBuilder;
///
/// let config = ConfigBuilder::new()
///     .http_port(0)
///     .max_headers_size(16 * 1024)
///     .idle_timeout(std::time::Duration::from_secs(60))
///     .build()
///     .expect("valid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Listeners ────────────────────────────────────────────────

    /// Enable the cleartext listener. Port 0 picks any free port.
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = Some(port);
        self
    }

    /// Enable the TLS listener. Port 0 picks any free port.
    pub fn https_port(mut self, port: u16) -> Self {
        self.config.https_port = Some(port);
        self
    }

    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.config.tls = Some(tls);
        self
    }

    // ── Limits ───────────────────────────────────────────────────

    pub fn max_headers_size(mut self, bytes: usize) -> Self {
        self.config.max_headers_size = bytes;
        self
    }

    pub fn max_url_size(mut self, bytes: usize) -> Self {
        self.config.max_url_size = bytes;
        self
    }

    pub fn max_request_size(mut self, bytes: u64) -> Self {
        self.config.max_request_size = bytes;
        self
    }

    pub fn body_too_large_action(mut self, action: BodyTooLargeAction) -> Self {
        self.config.body_too_large_action = action;
        self
    }

    pub fn max_keep_alive_requests(mut self, count: u64) -> Self {
        self.config.max_keep_alive_requests = Some(count);
        self
    }

    // ── Timeouts ─────────────────────────────────────────────────

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn request_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_read_timeout = timeout;
        self
    }

    pub fn response_write_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_write_timeout = timeout;
        self
    }

    // ── Executors ────────────────────────────────────────────────

    /// I/O worker threads. 0 = `min(16, 2 * cpus)`.
    pub fn io_threads(mut self, threads: usize) -> Self {
        self.config.io_threads = threads;
        self
    }

    pub fn handler_threads(mut self, threads: usize) -> Self {
        self.config.handler_threads = threads;
        self
    }

    pub fn handler_queue(mut self, queue: HandlerQueue) -> Self {
        self.config.handler_queue = queue;
        self
    }

    // ── Protocol ─────────────────────────────────────────────────

    pub fn h2_enabled(mut self, enabled: bool) -> Self {
        self.config.h2_enabled = enabled;
        self
    }

    pub fn h2_max_concurrent_streams(mut self, streams: u32) -> Self {
        self.config.h2_max_concurrent_streams = streams;
        self
    }

    pub fn gzip(mut self, gzip: GzipConfig) -> Self {
        self.config.gzip = gzip;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    // ── Terminal ─────────────────────────────────────────────────

    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = ConfigBuilder::new().http_port(0).build().unwrap();
        assert_eq!(config.max_headers_size, 8192);
        assert_eq!(config.max_url_size, 8175);
        assert_eq!(config.max_request_size, 24 * 1024 * 1024);
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.request_read_timeout, Duration::from_secs(120));
        assert_eq!(config.read_buffer_size(), 8192);
    }

    #[test]
    fn no_listener_is_invalid() {
        assert!(ConfigBuilder::new().build().is_err());
    }

    #[test]
    fn https_without_tls_is_invalid() {
        assert!(ConfigBuilder::new().https_port(0).build().is_err());
    }

    #[test]
    fn zero_limits_are_invalid() {
        assert!(
            ConfigBuilder::new()
                .http_port(0)
                .max_headers_size(0)
                .build()
                .is_err()
        );
        assert!(
            ConfigBuilder::new()
                .http_port(0)
                .handler_threads(0)
                .build()
                .is_err()
        );
    }

    #[test]
    fn io_thread_resolution() {
        let config = ConfigBuilder::new().http_port(0).io_threads(4).build().unwrap();
        assert_eq!(config.resolved_io_threads(), 4);
        let auto = ConfigBuilder::new().http_port(0).build().unwrap();
        assert!(auto.resolved_io_threads() >= 1);
        assert!(auto.resolved_io_threads() <= 16);
    }
}
