//! Server configuration types and defaults.
//!
//! This module contains the configuration consumed when constructing a
//! [`Server`](crate::Server): listen address, connection limits, worker pool
//! sizing, queue capacities and the accept-loop backoff policy.

use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::warn;

/// Address family the listener binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    /// IPv4 only
    #[default]
    V4,
    /// IPv6 only
    V6,
    /// IPv6 socket that also accepts IPv4-mapped peers
    Dual,
}

impl std::str::FromStr for IpVersion {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v4" | "tcp4" => Ok(Self::V4),
            "v6" | "tcp6" => Ok(Self::V6),
            "dual" | "tcp" => Ok(Self::Dual),
            other => Err(ServerError::InvalidConfig(format!(
                "unknown ip version '{other}' (expected v4, v6 or dual)"
            ))),
        }
    }
}

/// Exponential backoff applied by the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after a reset, in milliseconds
    pub floor_ms: u64,
    /// Upper bound for the delay, in milliseconds
    pub ceiling_ms: u64,
    /// Growth factor applied on every step
    pub multiplier: u32,
}

impl BackoffConfig {
    pub fn floor(&self) -> Duration {
        Duration::from_millis(self.floor_ms)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.ceiling_ms)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            floor_ms: 5,
            ceiling_ms: 1000,
            multiplier: 2,
        }
    }
}

/// Configuration structure for the TCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name or IP address to listen on
    pub host: String,

    /// Port to listen on (0 picks an ephemeral port)
    pub port: u16,

    /// Address family of the listener
    pub ip_version: IpVersion,

    /// Maximum number of concurrently registered connections
    pub max_connections: u32,

    /// Number of worker shards; 0 runs every request on its own task
    pub worker_pool_size: u32,

    /// Capacity of each worker's request queue
    pub max_worker_task_len: u32,

    /// Capacity of each connection's buffered outbound queue
    pub max_msg_buff_chan_len: u32,

    /// Largest accepted frame body in bytes.
    ///
    /// 0 disables the check, which lets a peer's header alone size the read
    /// buffer (up to 4 GiB). Only use it on trusted listeners.
    pub max_packet_size: u32,

    /// How long a buffered send waits for queue space, in milliseconds
    pub send_buff_timeout_ms: u64,

    /// Accept loop backoff policy
    pub accept_backoff: BackoffConfig,
}

impl ServerConfig {
    /// Host and port joined for logging and resolution.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Address the listener resolves and binds.
    ///
    /// Same as [`address`](Self::address), except that `dual` turns the IPv4
    /// wildcard `0.0.0.0` into `::` so both families are accepted.
    pub fn listen_address(&self) -> String {
        let v4_wildcard = self
            .host
            .parse::<Ipv4Addr>()
            .is_ok_and(|ip| ip.is_unspecified());
        if self.ip_version == IpVersion::Dual && v4_wildcard {
            format!("[::]:{}", self.port)
        } else {
            self.address()
        }
    }

    pub fn send_buff_timeout(&self) -> Duration {
        Duration::from_millis(self.send_buff_timeout_ms)
    }

    /// Checks the configuration for values the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.host.is_empty() {
            return Err(ServerError::InvalidConfig("host must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::InvalidConfig(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.worker_pool_size > 0 && self.max_worker_task_len == 0 {
            return Err(ServerError::InvalidConfig(
                "max_worker_task_len must be greater than 0 when a worker pool is configured".into(),
            ));
        }
        if self.max_msg_buff_chan_len == 0 {
            return Err(ServerError::InvalidConfig(
                "max_msg_buff_chan_len must be greater than 0".into(),
            ));
        }
        if self.accept_backoff.multiplier == 0 {
            return Err(ServerError::InvalidConfig(
                "accept_backoff.multiplier must be at least 1".into(),
            ));
        }
        if self.accept_backoff.floor_ms == 0 {
            return Err(ServerError::InvalidConfig(
                "accept_backoff.floor_ms must be greater than 0".into(),
            ));
        }
        if self.accept_backoff.floor_ms > self.accept_backoff.ceiling_ms {
            return Err(ServerError::InvalidConfig(
                "accept_backoff.floor_ms must not exceed ceiling_ms".into(),
            ));
        }
        if self.max_packet_size == 0 {
            warn!("max_packet_size is 0: frame sizes are unbounded, do not expose this listener publicly");
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8999,
            ip_version: IpVersion::V4,
            max_connections: 12000,
            worker_pool_size: num_cpus::get() as u32,
            max_worker_task_len: 1024,
            max_msg_buff_chan_len: 1024,
            max_packet_size: 4096,
            send_buff_timeout_ms: 5,
            accept_backoff: BackoffConfig::default(),
        }
    }
}
