//! Upstream credential acquisition: AWS SigV4 signing and cached OAuth2-style bearer tokens.

pub mod oauth;
pub mod sigv4;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::error::{ErrorKind, ProviderError};

pub use oauth::{
    CachedToken, GoogleAdcSource, IbmIamSource, OAuthClientCredentials, OAuthToken, StaticToken,
    TOKEN_EXPIRY_SKEW, TokenSource,
};
pub use sigv4::{SigV4Headers, SigV4Signer, SigV4SigningResult, SigV4Timestamp};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential: {0}")]
    Missing(String),
    #[error("invalid credential: {0}")]
    Invalid(String),
    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to read credentials file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse credentials: {0}")]
    Json(#[from] serde_json::Error),
}

impl AuthError {
    /// Token endpoint outages stay retryable; everything else is an auth failure.
    pub fn into_provider_error(self, provider: &str) -> ProviderError {
        let kind = match &self {
            Self::TokenEndpoint { status, .. } if *status >= 500 => ErrorKind::Upstream5xx,
            Self::Http(_) => ErrorKind::TransientNetwork,
            _ => ErrorKind::Auth,
        };
        ProviderError::new(provider, kind, self.to_string())
    }
}

/// Per-credential [`CachedToken`]s, keyed by whatever identifies the credential
/// (a credentials file path, an API key fingerprint).
#[derive(Debug, Default)]
pub struct TokenPool {
    http: reqwest::Client,
    tokens: Mutex<HashMap<String, Arc<CachedToken>>>,
}

impl TokenPool {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            tokens: Default::default(),
        }
    }

    pub async fn token(
        &self,
        key: &str,
        make: impl FnOnce() -> CachedToken,
    ) -> Result<OAuthToken, AuthError> {
        let cached = {
            let mut tokens = self
                .tokens
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tokens
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(make()))
                .clone()
        };
        cached.get(&self.http).await
    }
}
