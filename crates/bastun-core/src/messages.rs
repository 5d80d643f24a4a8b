//! Control messages exchanged with the gateway.
//!
//! Control messages travel CBOR-encoded inside `CONTROL` frames (see
//! [`crate::codec`]). Everything else on the wire is opaque tunnel data.

use serde::{Deserialize, Serialize};

/// Tunnel protocol version sent in the handshake.
pub const PROTOCOL_VERSION: u32 = 2;

/// Protocol name for raw TCP tunnels.
pub const PROTOCOL_TCP_TUNNEL: &str = "tcptunnel";

/// Numeric rejection codes carried in [`ControlMessage::HandshakeReject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RejectCode {
    Unspecified = 0,
    AuthFailed = 1,
    TargetUnreachable = 2,
    QuotaExceeded = 3,
    Forbidden = 4,
}

impl From<u32> for RejectCode {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::AuthFailed,
            2 => Self::TargetUnreachable,
            3 => Self::QuotaExceeded,
            4 => Self::Forbidden,
            _ => Self::Unspecified,
        }
    }
}

impl From<RejectCode> for u32 {
    fn from(c: RejectCode) -> u32 {
        c as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First message from the client: which resource and port to reach,
    /// and the credential that authorizes it.
    Handshake {
        version: u32,
        protocol: String,
        session_id: String,
        target_resource_id: String,
        target_port: u16,
        access_token: String,
    },
    HandshakeOk {
        #[serde(default)]
        node_id: Option<String>,
        #[serde(default)]
        tunnel_token: Option<String>,
    },
    HandshakeReject {
        code: u32,
        reason: String,
    },
    /// Orderly end of the tunnel, sent by either side.
    Close {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ControlMessage {
    pub fn close(reason: impl Into<String>) -> Self {
        ControlMessage::Close {
            reason: Some(reason.into()),
        }
    }

    pub fn reject(code: RejectCode, reason: impl Into<String>) -> Self {
        ControlMessage::HandshakeReject {
            code: code.into(),
            reason: reason.into(),
        }
    }
}
