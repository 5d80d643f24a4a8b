//! bastun-relay: the local side of a gateway tunnel.
//!
//! A [`TunnelServer`] listens on a local TCP port. Every accepted connection
//! is paired with its own WebSocket [`TransportSession`] to the gateway,
//! which forwards the bytes to a fixed target resource port. A
//! [`LifecycleController`] ties the server to operator interrupts and an
//! optional timeout.

pub mod config;
pub mod forwarder;
pub mod lifecycle;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::RelayConfig;
pub use forwarder::ConnectionForwarder;
pub use lifecycle::{LifecycleController, StopReason};
pub use server::TunnelServer;
pub use session::{SessionId, SessionInfo, SessionState, SessionStatus, TunnelEvent};
pub use transport::{
    GatewayConnector, HandshakeRequest, TransportReader, TransportSession, TransportWriter,
    WebSocketConnector,
};
