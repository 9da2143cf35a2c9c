//! The embeddable server: listeners, connection registry, lifecycle.
//!
//! `Server::start` owns everything it needs (a tokio runtime sized to
//! the configured I/O thread count, the application executor, and one
//! accept loop per listener), so it embeds into synchronous programs
//! without ceremony. `stop(grace)` drains: accepting stops, idle
//! connections half-close, in-flight exchanges get the grace window, and
//! whatever remains is force-closed. `kill` skips straight to the end.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use portside_h1::Method;

use crate::config::Config;
use crate::conn::{ConnCtx, ConnectionInfo, ConnectionView, h1, h2};
use crate::error::Error;
use crate::exec::{ExecHandle, HandlerPool};
use crate::handler::{DispatchCtx, Handler, UnhandledErrorHandler};
use crate::response::Response;
use crate::route::{PathParams, RouteHandler};
use crate::request::Request;
use crate::stats::{ServerStats, StatsSnapshot};
use crate::tls::{ServerStream, TlsChannel};

struct RegistryEntry {
    info: Arc<ConnectionInfo>,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    entries: std::sync::Mutex<HashMap<u64, RegistryEntry>>,
}

impl Registry {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn insert(&self, id: u64, info: Arc<ConnectionInfo>) {
        self.entries
            .lock()
            .expect("registry lock")
            .insert(id, RegistryEntry { info, abort: None });
    }

    fn set_abort(&self, id: u64, abort: AbortHandle) {
        if let Some(entry) = self.entries.lock().expect("registry lock").get_mut(&id) {
            entry.abort = Some(abort);
        }
    }

    fn remove(&self, id: u64) {
        self.entries.lock().expect("registry lock").remove(&id);
    }

    fn len(&self) -> usize {
        self.entries.lock().expect("registry lock").len()
    }

    fn views(&self) -> Vec<ConnectionView> {
        self.entries
            .lock()
            .expect("registry lock")
            .values()
            .map(|e| e.info.view())
            .collect()
    }

    /// Abort every remaining connection task; returns how many there were.
    fn abort_all(&self) -> usize {
        let mut entries = self.entries.lock().expect("registry lock");
        let count = entries.len();
        for (_, entry) in entries.drain() {
            if let Some(abort) = entry.abort {
                abort.abort();
            }
        }
        count
    }
}

/// Builds a [`Server`]: configuration plus the handler chain.
pub struct ServerBuilder {
    config: Config,
    handlers: Vec<Arc<dyn Handler>>,
    error_handler: Option<Arc<dyn UnhandledErrorHandler>>,
}

impl ServerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            error_handler: None,
        }
    }

    /// Append a handler to the chain.
    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Append a shared handler to the chain.
    pub fn handler_arc(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Append a route handler. `method` of `None` matches every method.
    pub fn route(
        mut self,
        method: Option<Method>,
        template: &str,
        action: impl Fn(&mut Request, &mut Response, &PathParams) -> Result<(), Error>
        + Send
        + Sync
        + 'static,
    ) -> Result<Self, Error> {
        self.handlers.push(RouteHandler::new(method, template, action)?);
        Ok(self)
    }

    /// Hook consulted for handler errors before the default error page.
    pub fn unhandled_error_handler(mut self, hook: impl UnhandledErrorHandler) -> Self {
        self.error_handler = Some(Arc::new(hook));
        self
    }

    /// Bind the listeners and start serving.
    pub fn start(self) -> Result<Server, Error> {
        Server::start(self.config, self.handlers, self.error_handler)
    }
}

/// A running server.
pub struct Server {
    runtime: Option<tokio::runtime::Runtime>,
    pool: Option<HandlerPool>,
    stats: Arc<ServerStats>,
    registry: Arc<Registry>,
    drain_tx: watch::Sender<bool>,
    accept_tasks: Vec<AbortHandle>,
    http_addr: Option<SocketAddr>,
    https_addr: Option<SocketAddr>,
}

impl Server {
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    fn start(
        config: Config,
        handlers: Vec<Arc<dyn Handler>>,
        error_handler: Option<Arc<dyn UnhandledErrorHandler>>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let config = Arc::new(config);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.resolved_io_threads())
            .thread_name("portside-io")
            .enable_io()
            .enable_time()
            .build()?;

        let pool = HandlerPool::start(config.handler_threads, config.handler_queue);
        let stats = ServerStats::new();
        let registry = Arc::new(Registry::default());
        let dispatch = Arc::new(DispatchCtx {
            handlers,
            error_handler,
        });
        let (drain_tx, drain_rx) = watch::channel(false);

        let mut http_addr = None;
        let mut https_addr = None;
        let mut accept_tasks = Vec::new();

        if let Some(port) = config.http_port {
            let listener = runtime.block_on(TcpListener::bind((config.bind_addr, port)))?;
            let addr = listener.local_addr()?;
            http_addr = Some(addr);
            info!(%addr, "http listener bound");
            let task = runtime.spawn(accept_loop(
                listener,
                None,
                Arc::clone(&config),
                Arc::clone(&stats),
                Arc::clone(&registry),
                Arc::clone(&dispatch),
                pool.handle(),
                drain_rx.clone(),
            ));
            accept_tasks.push(task.abort_handle());
        }

        if let Some(port) = config.https_port {
            let tls = config
                .tls
                .as_ref()
                .expect("validated: https_port requires tls")
                .build(config.h2_enabled)?;
            let listener = runtime.block_on(TcpListener::bind((config.bind_addr, port)))?;
            let addr = listener.local_addr()?;
            https_addr = Some(addr);
            info!(%addr, "https listener bound");
            let task = runtime.spawn(accept_loop(
                listener,
                Some(tls),
                Arc::clone(&config),
                Arc::clone(&stats),
                Arc::clone(&registry),
                Arc::clone(&dispatch),
                pool.handle(),
                drain_rx.clone(),
            ));
            accept_tasks.push(task.abort_handle());
        }

        Ok(Self {
            runtime: Some(runtime),
            pool: Some(pool),
            stats,
            registry,
            drain_tx,
            accept_tasks,
            http_addr,
            https_addr,
        })
    }

    /// Address of the cleartext listener, when enabled.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Address of the TLS listener, when enabled.
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Snapshot views of every open connection.
    pub fn active_connections(&self) -> Vec<ConnectionView> {
        self.registry.views()
    }

    /// Graceful shutdown: stop accepting, drain for up to `grace`, then
    /// force-close whatever is left.
    pub fn stop(mut self, grace: Duration) {
        let _ = self.drain_tx.send(true);
        for task in self.accept_tasks.drain(..) {
            task.abort();
        }

        if let Some(runtime) = &self.runtime {
            let registry = Arc::clone(&self.registry);
            runtime.block_on(async move {
                let deadline = tokio::time::Instant::now() + grace;
                while registry.len() > 0 && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            });
        }

        let leftover = self.registry.abort_all();
        if leftover > 0 {
            warn!(leftover, "force-closed connections at end of grace period");
            for _ in 0..leftover {
                self.stats.on_connection_closed();
            }
        }
        self.teardown();
    }

    /// Forced shutdown: close every socket immediately.
    pub fn kill(mut self) {
        let _ = self.drain_tx.send(true);
        for task in self.accept_tasks.drain(..) {
            task.abort();
        }
        let killed = self.registry.abort_all();
        for _ in 0..killed {
            self.stats.on_connection_closed();
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.drain_tx.send(true);
        for task in self.accept_tasks.drain(..) {
            task.abort();
        }
        self.registry.abort_all();
        self.teardown();
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
    config: Arc<Config>,
    stats: Arc<ServerStats>,
    registry: Arc<Registry>,
    dispatch: Arc<DispatchCtx>,
    exec: ExecHandle,
    mut drain_rx: watch::Receiver<bool>,
) {
    let local_addr = listener.local_addr().ok();
    loop {
        let accepted = tokio::select! {
            _ = drain_rx.changed() => None,
            res = listener.accept() => Some(res),
        };
        let (stream, peer) = match accepted {
            None => {
                debug!(addr = ?local_addr, "listener stopped accepting");
                return;
            }
            Some(Ok(pair)) => pair,
            Some(Err(err)) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let _ = stream.set_nodelay(config.tcp_nodelay);
        let id = registry.allocate_id();
        let local = stream.local_addr().ok().or(local_addr).unwrap_or(peer);
        let info = ConnectionInfo::new(id, peer, local);
        stats.on_connection_opened();
        registry.insert(id, Arc::clone(&info));

        let ctx = ConnCtx {
            config: Arc::clone(&config),
            stats: Arc::clone(&stats),
            dispatch: Arc::clone(&dispatch),
            exec: exec.clone(),
            info,
            draining: drain_rx.clone(),
        };
        let tls = tls.clone();
        let registry_for_task = Arc::clone(&registry);
        let stats_for_task = Arc::clone(&stats);

        let handle = tokio::spawn(async move {
            connection_main(stream, tls, ctx).await;
            registry_for_task.remove(id);
            stats_for_task.on_connection_closed();
        });
        registry.set_abort(id, handle.abort_handle());
    }
}

async fn connection_main(
    stream: tokio::net::TcpStream,
    tls: Option<Arc<rustls::ServerConfig>>,
    ctx: ConnCtx,
) {
    match tls {
        None => h1::drive(ServerStream::Plain(stream), ctx).await,
        Some(tls_config) => {
            let handshake_timeout = ctx.config.request_read_timeout;
            match TlsChannel::accept(stream, tls_config, handshake_timeout).await {
                Ok(channel) => {
                    ctx.info.set_tls(channel.session_info());
                    let use_h2 = ctx.config.h2_enabled && channel.negotiated_h2();
                    let io = ServerStream::Tls(Box::new(channel));
                    if use_h2 {
                        h2::drive(io, ctx).await;
                    } else {
                        h1::drive(io, ctx).await;
                    }
                }
                Err(err) => {
                    ctx.stats.on_failed_to_connect();
                    debug!(conn = ctx.info.id, error = %err, "TLS handshake failed");
                }
            }
        }
    }
}
