//! Registry of live connections.

use super::Connection;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Thread-safe map of connection id to connection.
///
/// `len` is exact; `approx_len` reads a counter maintained alongside the map
/// and may lag behind concurrent inserts and removals.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<u32, Arc<Connection>>,
    count: AtomicUsize,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection under its id.
    pub fn add(&self, conn: Arc<Connection>) {
        let conn_id = conn.conn_id();
        if self.connections.insert(conn_id, conn).is_some() {
            warn!(conn_id, "Replaced connection registered under the same id");
        } else {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        debug!(conn_id, total = self.len(), "Connection registered");
    }

    /// Unregisters, stops and closes the connection with `conn_id`.
    ///
    /// Returns `false` when no such connection is registered.
    pub async fn remove(&self, conn_id: u32) -> bool {
        let Some((_, conn)) = self.connections.remove(&conn_id) else {
            return false;
        };
        self.count.fetch_sub(1, Ordering::Relaxed);

        conn.stop();
        conn.close_socket().await;
        debug!(conn_id, total = self.len(), "Connection removed");
        true
    }

    /// Like [`ConnectionManager::remove`], but only when the registered entry
    /// is this exact connection.
    pub async fn remove_conn(&self, conn: &Connection) -> bool {
        let removed = self
            .connections
            .remove_if(&conn.conn_id(), |_, registered| {
                std::ptr::eq(Arc::as_ptr(registered), conn)
            });
        let Some((conn_id, conn)) = removed else {
            return false;
        };
        self.count.fetch_sub(1, Ordering::Relaxed);

        conn.stop();
        conn.close_socket().await;
        debug!(conn_id, total = self.len(), "Connection removed");
        true
    }

    pub fn get(&self, conn_id: u32) -> Option<Arc<Connection>> {
        self.connections
            .get(&conn_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Exact number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Lock-free, possibly stale count.
    pub fn approx_len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Ids of every registered connection.
    pub fn conn_ids(&self) -> Vec<u32> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Stops every registered connection. Each connection unregisters itself
    /// as its teardown completes.
    pub fn stop_all_conn(&self) {
        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        info!(count = connections.len(), "Stopping all connections");
        for conn in connections {
            conn.stop();
        }
    }
}
