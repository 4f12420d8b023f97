//! # Game Net - TCP Connection Core
//!
//! The networking layer of the game server: it accepts TCP clients, frames
//! their byte streams into discrete messages, routes each message to a
//! handler by message id and lets handlers reply on the originating
//! connection.
//!
//! ## Architecture Overview
//!
//! * **Server** - binds the listener and runs the accept loop, refusing to
//!   grow past `max_connections` by backing off exponentially
//! * **Connection** - one reader task per client plus a lazily spawned writer
//!   for buffered sends, with idempotent stop and exactly-once teardown
//! * **Connection Manager** - concurrent registry of live connections
//! * **Message Handler** - routing table and a sharded worker pool; requests
//!   from one connection are always handled in order on the same worker
//! * **Frame Codec** - pluggable wire format, [`DataPack`] by default
//!
//! ## Message Flow
//!
//! 1. The reader decodes a fixed-size header, then reads the declared body
//! 2. The message is wrapped in a [`Request`] bound to its connection
//! 3. The request is queued on worker `conn_id % worker_pool_size`
//! 4. The worker runs the handler registered for the message id
//! 5. The handler replies via [`Connection::send_msg`] or
//!    [`Connection::send_buff_msg`]
//!
//! ```no_run
//! use game_net::{Server, ServerConfig};
//!
//! # async fn run() -> Result<(), game_net::ServerError> {
//! let server = Server::new(ServerConfig::default());
//! server.add_router(1, |req| async move {
//!     let data = req.data().to_vec();
//!     let _ = req.connection().send_msg(req.msg_id(), req.serial(), 0, data).await;
//! })?;
//! let addr = server.start().await?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

pub use backoff::BackoffDelay;
pub use codec::{CodecError, DataPack, FrameCodec, DATA_PACK_HEAD_LEN};
pub use config::{BackoffConfig, IpVersion, ServerConfig};
pub use connection::{Connection, ConnectionManager, ConnectionState};
pub use error::ServerError;
pub use id_pool::IdPool;
pub use message::{Message, Request};
pub use message_handler::{MsgHandler, RouterHandler};
pub use server::Server;
pub use utils::{create_server, create_server_with_config};

pub mod backoff;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod id_pool;
pub mod message;
pub mod message_handler;
pub mod server;
pub mod utils;

#[cfg(test)]
mod test_utils;
