//! Access token from the command line or the environment.

use std::future::Future;
use std::pin::Pin;

use bastun_core::{AccessToken, CredentialProvider, TunnelError, TunnelResult};

/// Environment variable consulted when `--access-token` is not given.
pub const TOKEN_ENV: &str = "BASTUN_ACCESS_TOKEN";

/// Resolves the token from `--access-token`, else from the environment.
/// The environment is read on every call, so a token refreshed by an
/// outer tool is picked up by later sessions.
#[derive(Debug, Clone)]
pub struct CliCredential {
    flag: Option<String>,
    env_var: String,
}

impl CliCredential {
    pub fn new(flag: Option<String>) -> Self {
        Self {
            flag,
            env_var: TOKEN_ENV.to_string(),
        }
    }

    pub fn with_env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var = name.into();
        self
    }

    pub fn resolve(&self) -> TunnelResult<AccessToken> {
        if let Some(token) = &self.flag {
            return AccessToken::new(token.trim());
        }
        match std::env::var(&self.env_var) {
            Ok(token) if !token.trim().is_empty() => AccessToken::new(token.trim()),
            _ => Err(TunnelError::Credential(format!(
                "no access token: pass --access-token or set {}",
                self.env_var
            ))),
        }
    }
}

impl CredentialProvider for CliCredential {
    fn access_token(&self) -> Pin<Box<dyn Future<Output = TunnelResult<AccessToken>> + Send + '_>> {
        let token = self.resolve();
        Box::pin(async move { token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins() {
        let cred = CliCredential::new(Some(" abc ".into())).with_env_var("BASTUN_TEST_UNSET_1");
        assert_eq!(cred.resolve().unwrap().secret(), "abc");
    }

    #[test]
    fn missing_token_is_a_credential_error() {
        let cred = CliCredential::new(None).with_env_var("BASTUN_TEST_UNSET_2");
        let err = cred.resolve().unwrap_err();
        assert!(matches!(err, TunnelError::Credential(ref m) if m.contains("BASTUN_TEST_UNSET_2")));
    }

    #[test]
    fn empty_flag_is_rejected() {
        let cred = CliCredential::new(Some("  ".into())).with_env_var("BASTUN_TEST_UNSET_3");
        assert!(matches!(cred.resolve(), Err(TunnelError::Credential(_))));
    }

    #[tokio::test]
    async fn reads_environment() {
        std::env::set_var("BASTUN_TEST_TOKEN_ENV", "from-env");
        let cred = CliCredential::new(None).with_env_var("BASTUN_TEST_TOKEN_ENV");
        let token = cred.access_token().await.unwrap();
        assert_eq!(token.secret(), "from-env");
    }
}
