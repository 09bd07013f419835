//! Server assembly, startup, accept loop and graceful shutdown.
//!
//! # Responsibilities
//! - Assemble config, router and services into a runnable server
//! - Bind the polyglot listener, classify each accepted socket, and hand
//!   it to the matching protocol front-end
//! - Track pending connections and requests for the drain step
//! - Run `stop(reason)` exactly once, in order
//!
//! # Design Decisions
//! - The server scope is the root `Operation`; every connection scope is a
//!   fork of it and every request scope a fork of its connection's
//! - Drain order answers in-flight requests before closing connections; a
//!   forced 503 needs an open socket to travel over
//! - The signal watcher triggers `stop` from a detached task, so stop can
//!   cancel the watcher without cancelling itself

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use crate::config::schema::ServerConfig;
use crate::config::validation::validate_config;
use crate::error::ServerError;
use crate::http::pipeline::Pipeline;
use crate::http::{h1, h2, ConnectionContext, PendingRequests};
use crate::net::listener::{ConnectionPermit, Listener};
use crate::net::sniff::{sniff, write_reject, Sniffed};
use crate::net::tls::load_tls_config;
use crate::operation::Operation;
use crate::routing::Router;
use crate::services::{HookController, ListenInfo, RegistrationError, Service};

/// Monotonic lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Starting = 0,
    Opened = 1,
    Stopping = 2,
    Stopped = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Starting,
            1 => State::Opened,
            2 => State::Stopping,
            _ => State::Stopped,
        }
    }
}

/// Why the server is going down; the first reason wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// An enabled OS signal fired.
    Signal(&'static str),
    /// The embedder asked.
    Requested,
    /// A handler failure under the internal-error shutdown policy.
    InternalError,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Signal(name) => write!(f, "signal {}", name),
            StopReason::Requested => f.write_str("stop requested"),
            StopReason::InternalError => f.write_str("internal error"),
        }
    }
}

/// Assembles a [`Server`]. Registration failures surface here, before
/// anything binds.
pub struct ServerBuilder {
    config: ServerConfig,
    router: Router,
    hooks: HookController,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        let timing = config.timing;
        Self {
            config,
            router: Router::new(),
            hooks: HookController::new(timing),
        }
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Append a service to the hook dispatch order.
    pub fn service(mut self, service: Arc<dyn Service>) -> Result<Self, RegistrationError> {
        self.hooks.register(service)?;
        Ok(self)
    }

    pub fn build(self) -> Result<Arc<Server>, ServerError> {
        if let Err(errors) = validate_config(&self.config) {
            let joined = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ServerError::Config(joined));
        }

        let hooks = Arc::new(self.hooks);
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(self.router),
            Arc::clone(&hooks),
            Duration::from_secs(self.config.timeouts.response_secs),
            self.config.errors.verbose,
            self.config.timing,
        ));

        let (stopped_tx, _) = watch::channel(false);
        let (stopping_tx, _) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Server {
            config: self.config,
            pipeline,
            scope: Operation::start(),
            state: AtomicU8::new(State::Starting as u8),
            pending_connections: Arc::new(DashMap::new()),
            pending_requests: Arc::new(DashMap::new()),
            local_addr: Mutex::new(None),
            stop_reason: Mutex::new(None),
            stopped_tx,
            stopping_tx,
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

/// The embeddable server runtime.
pub struct Server {
    config: ServerConfig,
    pipeline: Arc<Pipeline>,
    /// Root cancellation scope; connection scopes fork from it.
    scope: Operation,
    state: AtomicU8,
    pending_connections: Arc<DashMap<Uuid, Operation>>,
    pending_requests: PendingRequests,
    local_addr: Mutex<Option<SocketAddr>>,
    stop_reason: Mutex<Option<StopReason>>,
    stopped_tx: watch::Sender<bool>,
    stopping_tx: watch::Sender<bool>,
    fatal_tx: mpsc::UnboundedSender<String>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn advance(&self, to: State) {
        // States only move forward.
        self.state.fetch_max(to as u8, Ordering::SeqCst);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr lock poisoned")
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pending_connection_count(&self) -> usize {
        self.pending_connections.len()
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.len()
    }

    /// Bind, announce, and begin serving. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        let tls_acceptor = match &self.config.tls {
            Some(tls) => Some(
                load_tls_config(
                    std::path::Path::new(&tls.cert_path),
                    std::path::Path::new(&tls.key_path),
                    self.config.http2.enabled,
                )
                .map_err(|e| ServerError::Tls(e.to_string()))?,
            ),
            None => None,
        };

        let listener = Listener::bind(&self.config)
            .await
            .map_err(|e| ServerError::Io(std::io::Error::other(e)))?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().expect("addr lock poisoned") = Some(addr);
        self.advance(State::Opened);

        let info = ListenInfo {
            local_addr: addr,
            origins: compute_origins(
                if self.config.tls.is_some() { "https" } else { "http" },
                addr.ip(),
                addr.port(),
            ),
        };
        tracing::info!(address = %addr, origins = ?info.origins, "Server listening");
        self.pipeline.hooks().server_listening(&info).await;

        let mut tasks = self.tasks.lock().expect("task lock poisoned");

        let accept_server = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            accept_server.accept_loop(listener, tls_acceptor).await;
        }));

        if self.config.shutdown.sighup
            || self.config.shutdown.sigterm
            || (self.config.shutdown.sigint && !self.config.shutdown.worker)
        {
            let signal_server = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let reason =
                    crate::lifecycle::signals::wait_for_signal(&signal_server.config.shutdown)
                        .await;
                // Detach so stop can cancel the watcher without
                // cancelling itself.
                let server = Arc::clone(&signal_server);
                tokio::spawn(async move {
                    server.stop(StopReason::Signal(reason)).await;
                });
            }));
        }

        if self.config.errors.internal_error_shutdown {
            if let Some(mut fatal_rx) = self.fatal_rx.lock().expect("fatal lock poisoned").take()
            {
                let fatal_server = Arc::clone(self);
                tasks.push(tokio::spawn(async move {
                    if let Some(detail) = fatal_rx.recv().await {
                        tracing::error!(detail, "Handler failure under shutdown policy");
                        let server = Arc::clone(&fatal_server);
                        tokio::spawn(async move {
                            server.stop(StopReason::InternalError).await;
                        });
                    }
                }));
            }
        }

        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener, tls: Option<TlsAcceptor>) {
        let mut stopping = self.stopping_tx.subscribe();
        loop {
            tokio::select! {
                _ = stopping.changed() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer, permit)) => {
                            let server = Arc::clone(&self);
                            let tls = tls.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer, permit, tls).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                        }
                    }
                }
            }
        }
        tracing::debug!("Accept loop stopped");
    }

    fn connection_context(&self, conn_op: Operation, peer: IpAddr, tls: bool) -> ConnectionContext {
        ConnectionContext {
            pipeline: Arc::clone(&self.pipeline),
            connection_op: conn_op,
            pending_requests: Arc::clone(&self.pending_requests),
            client_ip: peer,
            tls,
            redirect_https: false,
            push_enabled: self.config.http2.push,
            body_abandon: Duration::from_secs(self.config.timeouts.body_abandon_secs),
            fatal: self
                .config
                .errors
                .internal_error_shutdown
                .then(|| self.fatal_tx.clone()),
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        permit: ConnectionPermit,
        tls: Option<TlsAcceptor>,
    ) {
        let conn_op = self.scope.fork();
        let conn_id = Uuid::new_v4();
        self.pending_connections.insert(conn_id, conn_op.clone());
        let pending = Arc::clone(&self.pending_connections);
        conn_op.on_end(move || {
            pending.remove(&conn_id);
        });

        let detect_preface = self.config.http2.allow_insecure;
        let sniffed = match sniff(&stream, detect_preface).await {
            Ok(sniffed) => sniffed,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "Sniff failed");
                conn_op.end(false);
                return;
            }
        };

        match sniffed {
            Sniffed::Closed => {}
            Sniffed::Rejected(byte) => {
                tracing::warn!(peer = %peer, first_byte = byte, "Unrecognized protocol");
                let _ = write_reject(&mut stream).await;
            }
            Sniffed::Tls => match &tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let is_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2");
                        let ctx =
                            Arc::new(self.connection_context(conn_op.clone(), peer.ip(), true));
                        let served = if is_h2 {
                            h2::serve(tls_stream, ctx).await
                        } else {
                            h1::serve(tls_stream, ctx).await
                        };
                        if let Err(e) = served {
                            tracing::debug!(peer = %peer, error = %e, "TLS connection failed");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
                    }
                },
                None => {
                    tracing::warn!(peer = %peer, "TLS bytes on a plaintext-only server");
                    let _ = write_reject(&mut stream).await;
                }
            },
            Sniffed::Http1 => {
                let mut ctx = self.connection_context(conn_op.clone(), peer.ip(), false);
                if self.config.tls.is_some() {
                    if self.config.redirect_plaintext {
                        ctx.redirect_https = true;
                    } else {
                        tracing::debug!(peer = %peer, "Plaintext refused on TLS server");
                        let _ = write_reject(&mut stream).await;
                        conn_op.end(false);
                        return;
                    }
                }
                if let Err(e) = h1::serve(stream, Arc::new(ctx)).await {
                    tracing::debug!(peer = %peer, error = %e, "HTTP/1 connection failed");
                }
            }
            Sniffed::H2Preface => {
                let ctx = Arc::new(self.connection_context(conn_op.clone(), peer.ip(), false));
                if let Err(e) = h2::serve(stream, ctx).await {
                    tracing::debug!(peer = %peer, error = %e, "HTTP/2 connection failed");
                }
            }
        }

        // The socket is gone; abort so any request scopes still forked off
        // this connection settle with it instead of lingering.
        conn_op.abort();
        drop(permit);
    }

    /// Shut down in order. Idempotent: the first reason wins, later calls
    /// wait for completion.
    pub async fn stop(&self, reason: StopReason) {
        let already_stopping = {
            let mut guard = self.stop_reason.lock().expect("reason lock poisoned");
            if guard.is_some() {
                true
            } else {
                *guard = Some(reason);
                false
            }
        };
        if already_stopping {
            self.stopped().await;
            return;
        }

        self.advance(State::Stopping);
        tracing::info!(reason = %reason, "Server stopping");

        // Stop accepting; the accept loop drops the listener on exit.
        let _ = self.stopping_tx.send(true);

        // Answer in-flight requests while their sockets still live.
        let status = if reason == StopReason::InternalError {
            http::StatusCode::INTERNAL_SERVER_ERROR
        } else {
            http::StatusCode::SERVICE_UNAVAILABLE
        };
        let ids: Vec<Uuid> = self.pending_requests.iter().map(|e| *e.key()).collect();
        let forced = ids.len();
        for id in ids {
            if let Some((_, tx)) = self.pending_requests.remove(&id) {
                let _ = tx.send(status);
            }
        }
        if forced > 0 {
            tracing::info!(requests = forced, status = %status, "Answered pending requests");
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.pending_requests.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Force-close whatever connections remain.
        let conns: Vec<Operation> = self
            .pending_connections
            .iter()
            .map(|e| e.value().clone())
            .collect();
        if !conns.is_empty() {
            tracing::info!(connections = conns.len(), "Closing pending connections");
        }
        for op in conns {
            op.abort();
        }
        self.scope.abort();

        // Cancel signal wiring and the accept task.
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }

        self.pipeline.hooks().server_stopped().await;
        self.advance(State::Stopped);
        let _ = self.stopped_tx.send(true);
        tracing::info!("Server stopped");
    }

    /// Resolves when shutdown has completed.
    pub async fn stopped(&self) {
        let mut rx = self.stopped_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

/// Externally-reportable origins for the bound address. An any-interface
/// bind reports loopback plus the machine's network-facing address.
fn compute_origins(proto: &str, ip: IpAddr, port: u16) -> Vec<String> {
    let render = |ip: IpAddr| {
        let default_port = if proto == "https" { 443 } else { 80 };
        let host = match ip {
            IpAddr::V6(v6) => format!("[{}]", v6),
            IpAddr::V4(v4) => v4.to_string(),
        };
        if port == default_port {
            format!("{}://{}", proto, host)
        } else {
            format!("{}://{}:{}", proto, host, port)
        }
    };

    if ip.is_unspecified() {
        let mut origins = vec![render(IpAddr::from([127, 0, 0, 1]))];
        if let Some(local) = local_network_ip() {
            origins.push(render(local));
        }
        origins
    } else {
        vec![render(ip)]
    }
}

/// The address the OS would route external traffic from. Connecting a UDP
/// socket performs the routing lookup without sending a packet.
fn local_network_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("198.51.100.1", 80)).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}
