//! Error types for the connection core.
//!
//! Errors are grouped the way callers react to them:
//!
//! * **Setup errors** - bind failures, invalid configuration and duplicate
//!   routes. These surface immediately and are never retried.
//! * **Connection errors** - I/O and codec failures scoped to one connection.
//!   They terminate that connection only.
//! * **Capacity errors** - a full outbound queue. The caller gets a typed
//!   result instead of blocking.

use crate::codec::CodecError;

/// Errors produced by the server, its connections and the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address could not be resolved or bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `start` was called on a server that is already running
    #[error("Server already started")]
    AlreadyStarted,

    /// `start` was called after `stop`; a server cannot be restarted
    #[error("Server has been stopped")]
    ServerStopped,

    /// Socket level failure
    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The connection was stopped before or during the operation
    #[error("Connection {0} is closed")]
    ConnectionClosed(u32),

    /// Buffered sends need the connection to be started first
    #[error("Connection {0} has not been started")]
    ConnectionNotStarted(u32),

    /// The outbound queue stayed full for longer than the send timeout
    #[error("Buffered send on connection {conn_id} timed out after {timeout_ms}ms")]
    SendBuffTimeout { conn_id: u32, timeout_ms: u64 },

    /// A handler is already registered for this message id
    #[error("Router for message id {0} is already registered")]
    DuplicateRouter(u32),

    /// Requests were submitted while no worker pool is running
    #[error("Worker pool is not running")]
    WorkerPoolNotRunning,

    /// No property stored under the given key
    #[error("Property not found: {0}")]
    PropertyNotFound(String),

    /// A property exists under the key but holds a different type
    #[error("Property {0} holds a different type")]
    PropertyTypeMismatch(String),
}
