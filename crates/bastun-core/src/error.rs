use thiserror::Error;

/// Errors produced by the tunnel relay and its collaborators.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Invalid target, invalid port, or a gateway that cannot tunnel.
    /// Raised before any network I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel rejected by gateway (code {code}): {reason}")]
    TunnelRejected { code: u32, reason: String },

    #[error("forwarding error: {0}")]
    Forwarding(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("gateway lookup failed: {0}")]
    Lookup(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Whether this error is local to a single session (the server keeps
    /// accepting) rather than fatal to the whole invocation.
    pub fn is_session_local(&self) -> bool {
        matches!(
            self,
            TunnelError::TunnelRejected { .. }
                | TunnelError::Forwarding(_)
                | TunnelError::Transport(_)
                | TunnelError::Codec(_)
                | TunnelError::Timeout
                | TunnelError::Io(_)
        )
    }
}

impl From<ciborium::de::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(e: serde_json::Error) -> Self {
        TunnelError::Lookup(format!("invalid gateway document: {e}"))
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_local_classification() {
        assert!(TunnelError::TunnelRejected {
            code: 1,
            reason: "auth-failed".into()
        }
        .is_session_local());
        assert!(TunnelError::Forwarding("reset".into()).is_session_local());
        assert!(!TunnelError::Configuration("bad port".into()).is_session_local());
        assert!(!TunnelError::Bind {
            addr: "127.0.0.1:22".into(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        }
        .is_session_local());
    }

    #[test]
    fn rejected_display_carries_reason() {
        let e = TunnelError::TunnelRejected {
            code: 1,
            reason: "auth-failed".into(),
        };
        assert_eq!(e.to_string(), "tunnel rejected by gateway (code 1): auth-failed");
    }
}
