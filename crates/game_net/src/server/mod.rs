//! Server orchestration: listener setup, the accept loop and shutdown.

mod acceptor;
pub mod core;

pub use self::core::Server;
