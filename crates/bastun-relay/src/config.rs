//! Relay tuning knobs.

use std::time::Duration;

/// Runtime configuration for a [`TunnelServer`](crate::TunnelServer).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upper bound on connecting to the gateway plus the handshake exchange.
    pub handshake_timeout: Duration,
    /// WebSocket ping interval while forwarding. `None` or a zero
    /// interval disables keepalive.
    pub keepalive_interval: Option<Duration>,
    /// Read buffer size for the local→gateway direction.
    pub buffer_size: usize,
    /// Capacity of the [`TunnelEvent`](crate::TunnelEvent) broadcast channel.
    pub event_capacity: usize,
    /// How long teardown may spend flushing close frames before giving up.
    pub close_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            keepalive_interval: Some(Duration::from_secs(30)),
            buffer_size: 16 * 1024,
            event_capacity: 256,
            close_grace: Duration::from_secs(2),
        }
    }
}
