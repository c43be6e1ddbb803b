//! TCP accept loop.

use crate::config::{Config, LimitsConfig};
use crate::error::ServerError;
use crate::processor::{ProcessorContext, RequestProcessor};
use crate::registry::SystemRegistry;
use burrow_net::{NetError, SocketOp};
use burrow_protocol::{IdGenerator, RandomIdGenerator, SessionKeyResolver, XorKeyResolver};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Listen backlog.
    pub listen_backlog: u32,
    /// Idle connection timeout.
    pub idle_timeout: Option<Duration>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Request and response limits.
    pub limits: LimitsConfig,
    /// Source of command-instance ids.
    pub id_generator: Arc<dyn IdGenerator>,
    /// Session id to key derivation.
    pub key_resolver: Arc<dyn SessionKeyResolver>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("listen_backlog", &self.listen_backlog)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("limits", &self.limits)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds a server configuration from loaded settings.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            listen_backlog: config.network.listen_backlog,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            limits: config.limits.clone(),
            id_generator: Arc::new(RandomIdGenerator),
            key_resolver: Arc::new(XorKeyResolver),
        }
    }

    /// Sets the id generator.
    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Sets the session key resolver.
    pub fn with_key_resolver(mut self, key_resolver: Arc<dyn SessionKeyResolver>) -> Self {
        self.key_resolver = key_resolver;
        self
    }

    /// Sets the request and response limits.
    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_refused: AtomicU64,
    pub requests_total: AtomicU64,
    pub requests_rejected: AtomicU64,
    pub commands_failed: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server for burrow.
pub struct Server {
    config: ServerConfig,
    ctx: Arc<ProcessorContext>,
    stats: Arc<ServerStats>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server dispatching to `registry`.
    pub fn new(config: ServerConfig, registry: SystemRegistry) -> Self {
        let stats = Arc::new(ServerStats::default());
        let ctx = Arc::new(ProcessorContext {
            registry,
            id_generator: config.id_generator.clone(),
            key_resolver: config.key_resolver.clone(),
            limits: config.limits.clone(),
            idle_timeout: config.idle_timeout,
            stats: stats.clone(),
        });
        Self {
            config,
            ctx,
            stats,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.bind_addr;
        let bind_err = |source| ServerError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        socket.listen(self.config.listen_backlog).map_err(bind_err)
    }

    /// Binds and serves until [`Server::shutdown`] is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} ({} systems)",
            local_addr,
            self.ctx.registry.len()
        );

        let accept_op = SocketOp::new(self.shutdown.clone());

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match accept_op.accept(&listener).await {
                Ok((tcp_stream, addr)) => {
                    if self.stats.connections_active.load(Ordering::Relaxed)
                        >= self.config.max_connections as u64
                    {
                        tracing::warn!("Connection limit reached, rejecting {}", addr);
                        self.stats
                            .connections_refused
                            .fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    if let Err(e) = tcp_stream.set_nodelay(true) {
                        tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
                    }

                    self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                    self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                    let ctx = self.ctx.clone();
                    let stats = self.stats.clone();
                    let cancel = self.shutdown.child_token();

                    tokio::spawn(async move {
                        tracing::info!("Client connected: {}", addr);
                        let mut processor = RequestProcessor::new(ctx, addr, cancel);
                        let result = processor.run(tcp_stream).await;

                        if let Err(e) = result {
                            tracing::debug!("Connection {} error: {}", addr, e);
                            stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        }

                        stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                        tracing::info!(
                            "Client disconnected: {} ({} requests)",
                            addr,
                            processor.session().request_count()
                        );
                    });
                }
                Err(NetError::Cancelled { .. }) => break,
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }

        tracing::info!("Server shutting down");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Initiates server shutdown. Open connections are cancelled as well.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Returns the token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
