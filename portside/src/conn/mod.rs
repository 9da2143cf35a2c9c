//! Per-connection drivers.
//!
//! One task per connection owns the socket and the protocol engine, which
//! gives every exchange single-threaded cooperative ordering: parser
//! events, response commands, and timeouts are all serviced by the same
//! loop. Handlers live on the application executor and talk to the driver
//! exclusively through channels.

pub(crate) mod h1;
pub(crate) mod h2;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::time::SystemTime;

use tokio::sync::watch;

use crate::config::Config;
use crate::exec::ExecHandle;
use crate::handler::DispatchCtx;
use crate::request::Protocol;
use crate::stats::ServerStats;
use crate::tls::TlsSessionInfo;

/// Live, shared record of one connection, owned by the server registry
/// and updated by the driver.
pub(crate) struct ConnectionInfo {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub start_time: SystemTime,
    /// 0 = undecided, 1 = H1, 2 = H2 (settled after ALPN).
    protocol: AtomicU8,
    tls: std::sync::Mutex<Option<TlsSessionInfo>>,
    pub completed_requests: AtomicU64,
    pub active_requests: AtomicI64,
}

impl ConnectionInfo {
    pub fn new(id: u64, remote_addr: SocketAddr, local_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote_addr,
            local_addr,
            start_time: SystemTime::now(),
            protocol: AtomicU8::new(0),
            tls: std::sync::Mutex::new(None),
            completed_requests: AtomicU64::new(0),
            active_requests: AtomicI64::new(0),
        })
    }

    pub fn set_protocol(&self, protocol: Protocol) {
        let value = match protocol {
            Protocol::Http1 => 1,
            Protocol::Http2 => 2,
        };
        self.protocol.store(value, Ordering::Relaxed);
    }

    pub fn protocol(&self) -> Option<Protocol> {
        match self.protocol.load(Ordering::Relaxed) {
            1 => Some(Protocol::Http1),
            2 => Some(Protocol::Http2),
            _ => None,
        }
    }

    pub fn set_tls(&self, info: TlsSessionInfo) {
        *self.tls.lock().expect("tls info lock") = Some(info);
    }

    pub fn view(&self) -> ConnectionView {
        ConnectionView {
            id: self.id,
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
            start_time: self.start_time,
            protocol: self.protocol(),
            tls: self.tls.lock().expect("tls info lock").clone(),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            active_requests: self.active_requests.load(Ordering::Relaxed),
        }
    }

    pub fn on_request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_request_ended(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of one connection for `Server::active_connections`.
#[derive(Debug, Clone)]
pub struct ConnectionView {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub start_time: SystemTime,
    pub protocol: Option<Protocol>,
    pub tls: Option<TlsSessionInfo>,
    pub completed_requests: u64,
    pub active_requests: i64,
}

/// Everything a connection driver needs, cheap to clone per connection.
#[derive(Clone)]
pub(crate) struct ConnCtx {
    pub config: Arc<Config>,
    pub stats: Arc<ServerStats>,
    pub dispatch: Arc<DispatchCtx>,
    pub exec: ExecHandle,
    pub info: Arc<ConnectionInfo>,
    /// Flips to true when graceful shutdown begins.
    pub draining: watch::Receiver<bool>,
}

impl ConnCtx {
    pub fn is_draining(&self) -> bool {
        *self.draining.borrow()
    }
}
