//! Core TCP server implementation.
//!
//! [`Server`] wires the shared components together: the connection registry,
//! the routing table and worker pool, the frame codec and the connection id
//! pool. Starting it binds the listener and spawns the accept loop; stopping
//! it closes the listener, every live connection and the worker pool.

use super::acceptor::Acceptor;
use crate::backoff::BackoffDelay;
use crate::codec::{DataPack, FrameCodec};
use crate::config::{IpVersion, ServerConfig};
use crate::connection::{ConnectionContext, ConnectionManager};
use crate::error::ServerError;
use crate::id_pool::IdPool;
use crate::message::Request;
use crate::message_handler::MsgHandler;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Pending connections queued by the kernel before accept.
const LISTEN_BACKLOG: i32 = 1024;

/// The TCP server.
///
/// Each server owns its own registry, worker pool, id pool and accept
/// backoff; several servers can run side by side in one process.
pub struct Server {
    /// Server configuration settings
    config: ServerConfig,

    /// Routing table and worker pool
    msg_handler: Arc<MsgHandler>,

    /// Registry of live connections
    conn_mgr: Arc<ConnectionManager>,

    /// Wire format shared by all connections
    codec: Arc<dyn FrameCodec>,

    /// Recyclable connection ids, `1..=max_connections`
    id_pool: Arc<IdPool<u32>>,

    /// Flipped to `true` once stop is requested
    shutdown_sender: watch::Sender<bool>,

    started: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Creates a server using the default [`DataPack`] framing.
    ///
    /// # Arguments
    ///
    /// * `config` - Listen address, limits and pool sizing. It is validated
    ///   by [`start`](Self::start), not here.
    ///
    /// # Returns
    ///
    /// A server that is not yet listening.
    pub fn new(config: ServerConfig) -> Self {
        let codec = Arc::new(DataPack::new(config.max_packet_size));
        Self::with_codec(config, codec)
    }

    /// Creates a server with a custom frame codec.
    pub fn with_codec(config: ServerConfig, codec: Arc<dyn FrameCodec>) -> Self {
        let msg_handler = Arc::new(MsgHandler::new(
            config.worker_pool_size,
            config.max_worker_task_len,
        ));
        let id_pool = Arc::new(IdPool::sequential(config.max_connections));
        let (shutdown_sender, _) = watch::channel(false);

        Self {
            config,
            msg_handler,
            conn_mgr: Arc::new(ConnectionManager::new()),
            codec,
            id_pool,
            shutdown_sender,
            started: AtomicBool::new(false),
            local_addr: OnceLock::new(),
            accept_task: Mutex::new(None),
        }
    }

    /// Binds the listener, starts the worker pool and spawns the accept loop.
    ///
    /// A server can only be started once. Starting after [`stop`](Self::stop)
    /// fails, including when `stop` lands while the listener is being bound.
    ///
    /// # Returns
    ///
    /// The bound address, which differs from the configured one when port 0
    /// was requested.
    ///
    /// # Errors
    ///
    /// * [`ServerError::InvalidConfig`] if the configuration is rejected
    /// * [`ServerError::AlreadyStarted`] on a second call
    /// * [`ServerError::ServerStopped`] if `stop` was called first
    /// * [`ServerError::Bind`] if the address cannot be resolved or bound
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        self.config.validate()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyStarted);
        }
        if self.is_stopped() {
            return Err(ServerError::ServerStopped);
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                error!("Failed to start server: {}", e);
                return Err(e);
            }
        };
        if self.is_stopped() {
            info!("Server stopped while binding, closing listener");
            return Err(ServerError::ServerStopped);
        }
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        info!(
            "🚀 Server listening on {} (max connections: {}, workers: {})",
            local_addr, self.config.max_connections, self.config.worker_pool_size
        );

        if self.config.worker_pool_size > 0 {
            self.msg_handler.start_worker_pool();
        }

        let acceptor = Acceptor {
            listener,
            ctx: self.connection_context(),
            conn_mgr: self.conn_mgr.clone(),
            id_pool: self.id_pool.clone(),
            max_connections: self.config.max_connections as usize,
            backoff: BackoffDelay::from_config(&self.config.accept_backoff),
            shutdown: self.shutdown_sender.subscribe(),
        };
        *self.accept_task.lock().await = Some(tokio::spawn(acceptor.run()));

        // A concurrent stop may have run before the pool existed
        if self.is_stopped() {
            self.msg_handler.stop_worker_pool();
            return Err(ServerError::ServerStopped);
        }

        Ok(local_addr)
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown_sender.borrow()
    }

    async fn bind(&self) -> Result<TcpListener, ServerError> {
        let address = self.config.listen_address();
        let bind_error = |source: std::io::Error| ServerError::Bind {
            address: address.clone(),
            source,
        };

        let candidates: Vec<SocketAddr> = tokio::net::lookup_host(address.as_str())
            .await
            .map_err(bind_error)?
            .collect();
        let ip_version = self.config.ip_version;
        let addr = match ip_version {
            IpVersion::V4 => candidates.iter().find(|a| a.is_ipv4()),
            IpVersion::V6 => candidates.iter().find(|a| a.is_ipv6()),
            IpVersion::Dual => candidates
                .iter()
                .find(|a| a.is_ipv6())
                .or_else(|| candidates.first()),
        }
        .copied()
        .ok_or_else(|| {
            bind_error(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no {ip_version:?} address for host"),
            ))
        })?;

        if ip_version == IpVersion::Dual && addr.is_ipv4() {
            warn!("Dual-stack requested but {} is IPv4; IPv6 peers will be refused", addr);
        }

        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_error)?;
        socket.set_reuse_address(true).ok();
        if addr.is_ipv6() {
            socket
                .set_only_v6(ip_version == IpVersion::V6)
                .map_err(bind_error)?;
        }
        socket.bind(&addr.into()).map_err(bind_error)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;

        let std_listener: StdTcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener).map_err(bind_error)?;

        info!("✅ Listener bound on {} ({:?})", addr, ip_version);
        Ok(listener)
    }

    fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            conn_mgr: Arc::downgrade(&self.conn_mgr),
            msg_handler: self.msg_handler.clone(),
            codec: self.codec.clone(),
            id_pool: self.id_pool.clone(),
            worker_pool_size: self.config.worker_pool_size,
            max_msg_buff_chan_len: self.config.max_msg_buff_chan_len,
            send_buff_timeout: self.config.send_buff_timeout(),
        }
    }

    /// Stops accepting, closes every connection and stops the worker pool.
    ///
    /// Idempotent; calls after the first return immediately. Waits for the
    /// accept loop to exit but not for connections to finish closing.
    pub async fn stop(&self) {
        if self.shutdown_sender.send_replace(true) {
            return;
        }
        info!("🛑 Shutting down server...");

        let accept_task = self.accept_task.lock().await.take();
        if let Some(accept_task) = accept_task {
            if let Err(e) = accept_task.await {
                error!("Accept loop terminated abnormally: {}", e);
            }
        }

        self.conn_mgr.stop_all_conn();
        self.msg_handler.stop_worker_pool();
        info!("✅ Server stopped");
    }

    /// Registers the handler for `msg_id`.
    ///
    /// # Arguments
    ///
    /// * `msg_id` - Message id the handler serves
    /// * `handler` - Async function invoked with each matching [`Request`]
    ///
    /// # Errors
    ///
    /// [`ServerError::DuplicateRouter`] if `msg_id` already has a handler.
    pub fn add_router<F, Fut>(&self, msg_id: u32, handler: F) -> Result<(), ServerError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.msg_handler.add_router(msg_id, handler)
    }

    /// Installs the handler for message ids without a dedicated router.
    pub fn set_default_router<F, Fut>(&self, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.msg_handler.set_default_router(handler)
    }

    pub fn conn_mgr(&self) -> Arc<ConnectionManager> {
        self.conn_mgr.clone()
    }

    pub fn msg_handler(&self) -> Arc<MsgHandler> {
        self.msg_handler.clone()
    }

    pub fn codec(&self) -> Arc<dyn FrameCodec> {
        self.codec.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Returns a connection id to the pool.
    ///
    /// Connections recycle their own id on close; this is only for ids taken
    /// out of band.
    pub fn recycle_id(&self, conn_id: u32) {
        self.id_pool.set(conn_id);
    }

    /// Number of connection ids currently free.
    pub fn available_ids(&self) -> usize {
        self.id_pool.len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Workers hold the handler alive through their own queue
        if !self.shutdown_sender.send_replace(true) {
            self.conn_mgr.stop_all_conn();
            self.msg_handler.stop_worker_pool();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.config.address())
            .field("local_addr", &self.local_addr())
            .field("connections", &self.conn_mgr.len())
            .finish()
    }
}
