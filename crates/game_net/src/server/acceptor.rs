//! Accept loop.

use crate::backoff::BackoffDelay;
use crate::connection::{Connection, ConnectionContext, ConnectionManager};
use crate::id_pool::IdPool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Owns the listener for the lifetime of the accept loop. Dropping it closes
/// the listening socket.
pub(super) struct Acceptor {
    pub listener: TcpListener,
    pub ctx: ConnectionContext,
    pub conn_mgr: Arc<ConnectionManager>,
    pub id_pool: Arc<IdPool<u32>>,
    pub max_connections: usize,
    pub backoff: BackoffDelay,
    pub shutdown: watch::Receiver<bool>,
}

impl Acceptor {
    /// Accepts until shutdown.
    ///
    /// A connection id is reserved before each accept, so an accepted socket
    /// always has a unique id. While the server is at capacity or out of ids,
    /// the loop backs off instead of accepting.
    pub async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if self.conn_mgr.len() >= self.max_connections {
                debug!(
                    connections = self.conn_mgr.len(),
                    max = self.max_connections,
                    "At connection limit, holding off accept"
                );
                if self.pause().await {
                    break;
                }
                continue;
            }

            let Some(conn_id) = self.id_pool.try_get() else {
                warn!("No free connection id, holding off accept");
                if self.pause().await {
                    break;
                }
                continue;
            };

            let accepted = tokio::select! {
                biased;
                _ = wait_shutdown(&mut self.shutdown) => None,
                accepted = self.listener.accept() => Some(accepted),
            };
            let Some(accepted) = accepted else {
                self.id_pool.set(conn_id);
                break;
            };

            match accepted {
                Ok((stream, remote_addr)) => {
                    if *self.shutdown.borrow() {
                        debug!(%remote_addr, "Dropping connection accepted during shutdown");
                        drop(stream);
                        self.id_pool.set(conn_id);
                        break;
                    }

                    self.backoff.reset();
                    debug!(conn_id, %remote_addr, "Accepted connection");
                    let conn = Connection::new(self.ctx.clone(), stream, remote_addr, conn_id);
                    conn.start();
                }
                Err(e) => {
                    self.id_pool.set(conn_id);
                    error!("Failed to accept connection: {}", e);
                    if self.pause().await {
                        break;
                    }
                }
            }
        }

        info!("Accept loop stopped, listener closed");
    }

    /// Sleeps for the next backoff step. Returns `true` if shutdown was
    /// requested meanwhile.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = wait_shutdown(&mut self.shutdown) => true,
            _ = self.backoff.delay() => false,
        }
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}
