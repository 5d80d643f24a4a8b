//! Tunnel session bookkeeping: identifiers, lifecycle state, counters, and
//! the events the server publishes about them.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

/// Unique identifier of one tunnel session (32 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a tunnel session.
///
/// `Handshaking → Forwarding → Closing → Closed`; a rejected handshake goes
/// straight from `Handshaking` to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Handshaking = 0,
    Forwarding = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Handshaking,
            1 => Self::Forwarding,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Live state and byte counters of a session, shared between the
/// forwarder that drives it and the server that reports on it.
#[derive(Debug)]
pub struct SessionStatus {
    state: AtomicU8,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Handshaking as u8),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Bytes relayed local → gateway.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes relayed gateway → local.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub(crate) fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of an active session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub state: SessionState,
    pub age_secs: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl SessionInfo {
    pub(crate) fn snapshot(id: &SessionId, peer: SocketAddr, opened_at: Instant, status: &SessionStatus) -> Self {
        Self {
            id: id.clone(),
            peer,
            state: status.state(),
            age_secs: opened_at.elapsed().as_secs(),
            bytes_sent: status.bytes_sent(),
            bytes_received: status.bytes_received(),
        }
    }
}

/// Events published by a [`TunnelServer`](crate::TunnelServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Listening { port: u16 },
    SessionOpened { session_id: SessionId, peer: SocketAddr },
    SessionForwarding { session_id: SessionId, node_id: Option<String> },
    /// The gateway refused the handshake; the local connection was closed
    /// without relaying any bytes.
    SessionRejected { session_id: SessionId, code: u32, reason: String },
    SessionFailed { session_id: SessionId, error: String },
    SessionClosed { session_id: SessionId, bytes_sent: u64, bytes_received: u64 },
    ServerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_hex() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn status_tracks_state_and_bytes() {
        let status = SessionStatus::new();
        assert_eq!(status.state(), SessionState::Handshaking);
        status.set_state(SessionState::Forwarding);
        status.add_sent(10);
        status.add_received(4);
        status.add_received(4);
        assert_eq!(status.state(), SessionState::Forwarding);
        assert_eq!(status.bytes_sent(), 10);
        assert_eq!(status.bytes_received(), 8);
        status.set_state(SessionState::Closed);
        assert_eq!(status.state(), SessionState::Closed);
    }
}
