//! Loopback socket fixtures for unit tests.

use crate::codec::DataPack;
use crate::connection::{Connection, ConnectionContext, ConnectionManager};
use crate::id_pool::IdPool;
use crate::message_handler::MsgHandler;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Hands out server-side connections backed by real loopback sockets.
///
/// The id pool starts drained, as if every id were in use, so tests can count
/// the ids that come back.
pub(crate) struct TestConnections {
    listener: TcpListener,
    pub conn_mgr: Arc<ConnectionManager>,
    pub id_pool: Arc<IdPool<u32>>,
    pub msg_handler: Arc<MsgHandler>,
    clients: Mutex<Vec<TcpStream>>,
}

impl TestConnections {
    pub async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let id_pool = Arc::new(IdPool::sequential(16));
        while id_pool.try_get().is_some() {}

        Self {
            listener,
            conn_mgr: Arc::new(ConnectionManager::new()),
            id_pool,
            msg_handler: Arc::new(MsgHandler::new(0, 0)),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> ConnectionContext {
        ConnectionContext {
            conn_mgr: Arc::downgrade(&self.conn_mgr),
            msg_handler: self.msg_handler.clone(),
            codec: Arc::new(DataPack::new(4096)),
            id_pool: self.id_pool.clone(),
            worker_pool_size: 0,
            max_msg_buff_chan_len: 8,
            send_buff_timeout: Duration::from_millis(50),
        }
    }

    /// Connects a client and wraps the accepted side. The client end stays
    /// open for the fixture's lifetime.
    pub async fn connection(&self, conn_id: u32) -> Arc<Connection> {
        let addr = self.listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, remote_addr) = self.listener.accept().await.unwrap();
        self.clients.lock().unwrap().push(client);

        Connection::new(self.context(), stream, remote_addr, conn_id)
    }

    pub async fn wait_until(&self, condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached within 5s");
    }
}
