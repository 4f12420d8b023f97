//! Per-client TCP connections.
//!
//! A [`Connection`] owns one accepted socket. Starting it spawns a reader task
//! that decodes frames and hands them to the worker pool; the first buffered
//! send lazily spawns a writer task draining the outbound queue. Stopping is
//! idempotent and the teardown (registry removal, socket close, id recycling)
//! runs exactly once, from whichever task notices the close first.

pub mod manager;

pub use manager::ConnectionManager;

use crate::codec::FrameCodec;
use crate::error::ServerError;
use crate::id_pool::IdPool;
use crate::message::{Message, Request};
use crate::message_handler::MsgHandler;
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Server-side collaborators shared by every connection of one server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub conn_mgr: Weak<ConnectionManager>,
    pub msg_handler: Arc<MsgHandler>,
    pub codec: Arc<dyn FrameCodec>,
    pub id_pool: Arc<IdPool<u32>>,
    /// 0 dispatches every request on its own task
    pub worker_pool_size: u32,
    pub max_msg_buff_chan_len: u32,
    pub send_buff_timeout: Duration,
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, reader not started
    Idle,
    /// Reader running, no outbound queue yet
    ReaderOnly,
    /// Reader and buffered writer running
    ReaderAndWriter,
    /// Stop requested or observed
    Closed,
}

struct Lifecycle {
    state: ConnectionState,
    outbound: Option<mpsc::Sender<Vec<u8>>>,
}

type PropertyValue = Arc<dyn Any + Send + Sync>;

/// One accepted client socket.
pub struct Connection {
    conn_id: u32,
    remote_addr: SocketAddr,
    ctx: ConnectionContext,
    this: Weak<Connection>,

    /// Taken by the reader task on start
    reader: Mutex<Option<OwnedReadHalf>>,

    /// `None` once the socket is closed
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,

    lifecycle: Mutex<Lifecycle>,
    closing: watch::Sender<bool>,
    finalized: AtomicBool,
    properties: RwLock<HashMap<String, PropertyValue>>,
}

impl Connection {
    /// Wraps an accepted stream and registers it with the manager.
    pub fn new(
        ctx: ConnectionContext,
        stream: TcpStream,
        remote_addr: SocketAddr,
        conn_id: u32,
    ) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(conn_id, "Failed to set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();
        let (closing, _) = watch::channel(false);

        let conn = Arc::new_cyclic(|this| Self {
            conn_id,
            remote_addr,
            ctx,
            this: this.clone(),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Idle,
                outbound: None,
            }),
            closing,
            finalized: AtomicBool::new(false),
            properties: RwLock::new(HashMap::new()),
        });

        if let Some(conn_mgr) = conn.ctx.conn_mgr.upgrade() {
            conn_mgr.add(Arc::clone(&conn));
        }
        conn
    }

    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_lifecycle().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the reader task. Only an idle connection can be started.
    pub fn start(&self) {
        let (reader, conn) = {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.state != ConnectionState::Idle {
                warn!(conn_id = self.conn_id, state = ?lifecycle.state, "Ignoring start of non-idle connection");
                return;
            }
            let Some(conn) = self.this.upgrade() else {
                return;
            };
            let Some(reader) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() else {
                return;
            };
            lifecycle.state = ConnectionState::ReaderOnly;
            (reader, conn)
        };

        tokio::spawn(conn.run_reader(reader));
    }

    /// Requests the connection to close.
    ///
    /// Safe to call any number of times from any task. The reader performs the
    /// teardown; a connection that was never started is torn down on a
    /// background task instead.
    pub fn stop(&self) {
        let previous = {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.state == ConnectionState::Closed {
                return;
            }
            std::mem::replace(&mut lifecycle.state, ConnectionState::Closed)
        };

        self.closing.send_replace(true);
        debug!(conn_id = self.conn_id, "Connection stop requested");

        if previous == ConnectionState::Idle {
            let Some(conn) = self.this.upgrade() else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { conn.finalize().await });
                }
                Err(_) => {
                    warn!(conn_id = self.conn_id, "No runtime to finalize idle connection");
                }
            }
        }
    }

    async fn run_reader(self: Arc<Self>, mut reader: OwnedReadHalf) {
        info!(conn_id = self.conn_id, remote_addr = %self.remote_addr, "Connection reader started");
        let mut closing = self.closing.subscribe();

        loop {
            let message = tokio::select! {
                biased;
                _ = wait_closed(&mut closing) => break,
                message = self.read_message(&mut reader) => message,
            };

            match message {
                Ok(message) => {
                    self.dispatch(Request::new(Arc::clone(&self), message)).await;
                }
                Err(ServerError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(conn_id = self.conn_id, "Peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(conn_id = self.conn_id, remote_addr = %self.remote_addr, "Read failed: {}", e);
                    break;
                }
            }
        }

        drop(reader);
        debug!(conn_id = self.conn_id, "Connection reader exited");
        self.stop();
        self.finalize().await;
    }

    async fn read_message(&self, reader: &mut OwnedReadHalf) -> Result<Message, ServerError> {
        let mut head = vec![0u8; self.ctx.codec.head_len()];
        reader.read_exact(&mut head).await?;

        let mut message = self.ctx.codec.unpack(&head)?;
        if message.data_len() > 0 {
            let mut data = vec![0u8; message.data_len() as usize];
            reader.read_exact(&mut data).await?;
            message.set_data(data);
        }
        Ok(message)
    }

    async fn dispatch(&self, request: Request) {
        let msg_id = request.msg_id();
        if self.ctx.worker_pool_size > 0 {
            if let Err(e) = self.ctx.msg_handler.send_msg_to_task_queue(request).await {
                warn!(conn_id = self.conn_id, msg_id, "Dropping request: {}", e);
            }
        } else {
            let msg_handler = Arc::clone(&self.ctx.msg_handler);
            tokio::spawn(async move { msg_handler.do_msg_handler(request).await });
        }
    }

    /// Teardown, run once: unregister, close the socket, close the outbound
    /// queue, recycle the id. The id goes back to the pool only after the
    /// registry entry is gone.
    async fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(conn_mgr) = self.ctx.conn_mgr.upgrade() {
            conn_mgr.remove_conn(self).await;
        }
        self.close_socket().await;
        self.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.lock_lifecycle().outbound.take();
        self.ctx.id_pool.set(self.conn_id);

        info!(conn_id = self.conn_id, remote_addr = %self.remote_addr, "Connection closed");
    }

    /// Shuts down and drops the write half, closing the socket.
    pub(crate) async fn close_socket(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // The peer may already be gone
            let _ = writer.shutdown().await;
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), ServerError> {
        let mut closing = self.closing.subscribe();
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(ServerError::ConnectionClosed(self.conn_id));
        };

        tokio::select! {
            biased;
            _ = wait_closed(&mut closing) => Err(ServerError::ConnectionClosed(self.conn_id)),
            result = writer.write_all(frame) => result.map_err(ServerError::from),
        }
    }

    fn pack(&self, msg_id: u32, serial: u32, err_code: u16, data: Vec<u8>) -> Result<Vec<u8>, ServerError> {
        self.ctx
            .codec
            .pack(&Message::new(msg_id, serial, err_code, data))
            .map_err(|e| {
                error!(conn_id = self.conn_id, msg_id, "Failed to pack message: {}", e);
                ServerError::from(e)
            })
    }

    /// Encodes and writes one frame straight to the socket.
    ///
    /// Concurrent callers are serialized on the write half, so frames never
    /// interleave. A write still pending when the connection stops is
    /// abandoned.
    ///
    /// # Arguments
    ///
    /// * `msg_id` - Message id placed in the header
    /// * `serial` - Serial echoed back to the client, usually the request's
    /// * `err_code` - Application error code, 0 for success
    /// * `data` - Frame body
    ///
    /// # Errors
    ///
    /// * [`ServerError::ConnectionClosed`] once the connection is stopping
    /// * [`ServerError::Codec`] if the body exceeds the codec's size limit
    /// * [`ServerError::Io`] if the write fails; the connection is stopped
    pub async fn send_msg(
        &self,
        msg_id: u32,
        serial: u32,
        err_code: u16,
        data: Vec<u8>,
    ) -> Result<(), ServerError> {
        if self.is_closed() {
            return Err(ServerError::ConnectionClosed(self.conn_id));
        }

        let frame = self.pack(msg_id, serial, err_code, data)?;
        match self.write_frame(&frame).await {
            Err(ServerError::Io(e)) => {
                error!(conn_id = self.conn_id, msg_id, "Write failed: {}", e);
                self.stop();
                Err(ServerError::Io(e))
            }
            other => other,
        }
    }

    /// Encodes one frame and queues it on the connection's outbound queue.
    ///
    /// The first call spawns the writer task. Waits at most
    /// `send_buff_timeout` for queue space before failing with
    /// [`ServerError::SendBuffTimeout`].
    ///
    /// # Errors
    ///
    /// * [`ServerError::ConnectionNotStarted`] before [`start`](Self::start)
    /// * [`ServerError::ConnectionClosed`] once the connection is stopping
    /// * [`ServerError::SendBuffTimeout`] if the queue stayed full
    pub async fn send_buff_msg(
        &self,
        msg_id: u32,
        serial: u32,
        err_code: u16,
        data: Vec<u8>,
    ) -> Result<(), ServerError> {
        let outbound = self.outbound_sender()?;
        let frame = self.pack(msg_id, serial, err_code, data)?;

        match outbound.send_timeout(frame, self.ctx.send_buff_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(conn_id = self.conn_id, msg_id, "Outbound queue full, send timed out");
                Err(ServerError::SendBuffTimeout {
                    conn_id: self.conn_id,
                    timeout_ms: self.ctx.send_buff_timeout.as_millis() as u64,
                })
            }
            Err(SendTimeoutError::Closed(_)) => Err(ServerError::ConnectionClosed(self.conn_id)),
        }
    }

    fn outbound_sender(&self) -> Result<mpsc::Sender<Vec<u8>>, ServerError> {
        let mut lifecycle = self.lock_lifecycle();
        match lifecycle.state {
            ConnectionState::Closed => Err(ServerError::ConnectionClosed(self.conn_id)),
            ConnectionState::Idle => Err(ServerError::ConnectionNotStarted(self.conn_id)),
            ConnectionState::ReaderAndWriter => lifecycle
                .outbound
                .clone()
                .ok_or(ServerError::ConnectionClosed(self.conn_id)),
            ConnectionState::ReaderOnly => {
                let conn = self
                    .this
                    .upgrade()
                    .ok_or(ServerError::ConnectionClosed(self.conn_id))?;
                let (sender, receiver) =
                    mpsc::channel(self.ctx.max_msg_buff_chan_len.max(1) as usize);
                lifecycle.outbound = Some(sender.clone());
                lifecycle.state = ConnectionState::ReaderAndWriter;
                tokio::spawn(conn.run_writer(receiver));
                Ok(sender)
            }
        }
    }

    async fn run_writer(self: Arc<Self>, mut outbound: mpsc::Receiver<Vec<u8>>) {
        debug!(conn_id = self.conn_id, "Connection writer started");
        let mut closing = self.closing.subscribe();

        loop {
            let frame = tokio::select! {
                biased;
                _ = wait_closed(&mut closing) => break,
                frame = outbound.recv() => frame,
            };
            let Some(frame) = frame else {
                break;
            };

            match self.write_frame(&frame).await {
                Ok(()) => {}
                Err(ServerError::ConnectionClosed(_)) => break,
                Err(e) => {
                    error!(conn_id = self.conn_id, "Buffered write failed: {}", e);
                    self.stop();
                    break;
                }
            }
        }

        debug!(conn_id = self.conn_id, "Connection writer exited");
    }

    /// Attaches a value to the connection under `key`, replacing any previous
    /// value.
    pub fn set_property<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Arc::new(value));
    }

    /// Looks up a property stored with [`Connection::set_property`].
    pub fn get_property<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>, ServerError> {
        let value = self
            .properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| ServerError::PropertyNotFound(key.to_string()))?;

        value
            .downcast::<T>()
            .map_err(|_| ServerError::PropertyTypeMismatch(key.to_string()))
    }

    /// Removes a property; returns whether it existed.
    pub fn remove_property(&self, key: &str) -> bool {
        self.properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

async fn wait_closed(closing: &mut watch::Receiver<bool>) {
    // A dropped sender also ends the wait
    let _ = closing.wait_for(|closed| *closed).await;
}
