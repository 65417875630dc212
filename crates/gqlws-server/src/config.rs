//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the GraphQL WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind when the server owns its TCP listener
    pub bind_address: SocketAddr,
    /// How long a client may stay unacknowledged before the connection is
    /// closed with `4408`. `None` or zero disables the deadline.
    pub connection_init_wait_timeout: Option<Duration>,
    /// Interval between server pings once acknowledged. A client that sends
    /// nothing for a whole interval after a ping is closed. `None` or zero
    /// disables keep-alive.
    pub keep_alive_interval: Option<Duration>,
    /// Capacity of each connection's outbound message queue
    pub outbound_buffer_size: usize,
    /// Upper bound for the HTTP upgrade handshake on TCP connections
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 4000)),
            connection_init_wait_timeout: Some(Duration::from_secs(3)),
            keep_alive_interval: Some(Duration::from_secs(12)),
            outbound_buffer_size: 1000,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub(crate) fn init_wait_timeout(&self) -> Option<Duration> {
        enabled(self.connection_init_wait_timeout)
    }

    pub(crate) fn keep_alive(&self) -> Option<Duration> {
        enabled(self.keep_alive_interval)
    }
}

fn enabled(duration: Option<Duration>) -> Option<Duration> {
    duration.filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address.port(), 4000);
        assert_eq!(config.init_wait_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.keep_alive(), Some(Duration::from_secs(12)));
        assert_eq!(config.outbound_buffer_size, 1000);
    }

    #[test]
    fn test_zero_duration_disables_timer() {
        let config = ServerConfig {
            connection_init_wait_timeout: Some(Duration::ZERO),
            keep_alive_interval: None,
            ..Default::default()
        };
        assert_eq!(config.init_wait_timeout(), None);
        assert_eq!(config.keep_alive(), None);
    }
}
