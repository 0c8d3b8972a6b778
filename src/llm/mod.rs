mod executor;
mod retry;
mod wire;

pub mod cancel;
pub mod openai;

pub use cancel::{CancelHandle, CancelSignal};
pub use executor::RequestExecutor;
pub use retry::RetryPolicy;

use crate::error::TransportError;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

/// Performs one HTTP exchange. Implementations own the per-attempt timeout;
/// they never retry and never interpret the status code.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        endpoint: &str,
        payload: &serde_json::Value,
        credentials: &Credentials,
    ) -> Result<RawResponse, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, if the server sent one.
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Opaque bearer token. `Debug` never prints the secret.
#[derive(Clone)]
pub struct Credentials(SecretString);

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    pub(crate) fn bearer(&self) -> String {
        format!("Bearer {}", self.0.expose_secret())
    }
}

impl From<SecretString> for Credentials {
    fn from(secret: SecretString) -> Self {
        Self(secret)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credentials([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = Credentials::new("sk-live-secret");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("sk-live-secret"));
        assert_eq!(creds.bearer(), "Bearer sk-live-secret");
    }
}
