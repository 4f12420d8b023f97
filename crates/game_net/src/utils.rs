//! Convenience constructors.

use crate::config::ServerConfig;
use crate::server::Server;

/// Creates a server with default configuration.
pub fn create_server() -> Server {
    Server::new(ServerConfig::default())
}

/// Creates a server with the given configuration.
pub fn create_server_with_config(config: ServerConfig) -> Server {
    Server::new(config)
}
