//! Access tokens and the credential provider collaborator.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use sha2::{Digest, Sha256};

use crate::error::{TunnelError, TunnelResult};

/// A bearer-style access token presented to the gateway during the
/// handshake. `Debug` and `Display` never reveal the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> TunnelResult<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(TunnelError::Credential("access token is empty".into()));
        }
        Ok(Self(token))
    }

    /// The raw secret, for the handshake payload only.
    pub fn secret(&self) -> &str {
        &self.0
    }

    /// Short SHA-256 fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken({})", self.fingerprint())
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token:{}", self.fingerprint())
    }
}

/// Supplies the access token for each new tunnel session.
///
/// Called once per handshake, so a provider backed by a refreshing token
/// cache always hands out a live credential.
pub trait CredentialProvider: Send + Sync {
    fn access_token(&self) -> Pin<Box<dyn Future<Output = TunnelResult<AccessToken>> + Send + '_>>;
}

/// A provider that always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticCredential {
    token: AccessToken,
}

impl StaticCredential {
    pub fn new(token: AccessToken) -> Self {
        Self { token }
    }
}

impl CredentialProvider for StaticCredential {
    fn access_token(&self) -> Pin<Box<dyn Future<Output = TunnelResult<AccessToken>> + Send + '_>> {
        let token = self.token.clone();
        Box::pin(async move { Ok(token) })
    }
}
