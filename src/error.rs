use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::policy::PolicyError;
use crate::router::RouterError;

/// Normalized failure classes shared by every provider adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    RateLimit,
    ContextOverflow,
    ContentPolicy,
    BadRequest,
    #[serde(rename = "upstream_5xx", alias = "server_error")]
    Upstream5xx,
    Timeout,
    TransientNetwork,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::ContextOverflow => "context_overflow",
            Self::ContentPolicy => "content_policy",
            Self::BadRequest => "bad_request",
            Self::Upstream5xx => "upstream_5xx",
            Self::Timeout => "timeout",
            Self::TransientNetwork => "transient_network",
            Self::Internal => "internal",
        }
    }

    /// Kinds the router handles locally by retrying or falling back.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Upstream5xx | Self::Timeout | Self::TransientNetwork
        )
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            408 => Self::Timeout,
            413 => Self::ContextOverflow,
            429 => Self::RateLimit,
            400..=499 => Self::BadRequest,
            500..=599 => Self::Upstream5xx,
            _ => Self::Internal,
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            Self::Auth => 401,
            Self::RateLimit => 429,
            Self::ContextOverflow | Self::ContentPolicy | Self::BadRequest => 400,
            Self::Upstream5xx => 502,
            Self::Timeout => 408,
            Self::TransientNetwork => 503,
            Self::Internal => 500,
        }
    }

    /// OpenAI-style `error.type` string.
    pub fn openai_type(self) -> &'static str {
        match self {
            Self::Auth => "authentication_error",
            Self::RateLimit => "rate_limit_error",
            Self::ContextOverflow => "context_length_exceeded",
            Self::ContentPolicy => "content_policy_violation",
            Self::BadRequest => "invalid_request_error",
            Self::Upstream5xx => "api_error",
            Self::Timeout => "timeout",
            Self::TransientNetwork => "api_connection_error",
            Self::Internal => "internal_server_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified upstream failure. The original status and message are kept verbatim.
#[derive(Clone, Debug, Error)]
#[error("{provider} {kind} error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct ProviderError {
    pub provider: String,
    pub status: Option<u16>,
    pub kind: ErrorKind,
    pub message: String,
    pub error_type: Option<String>,
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            status: None,
            kind,
            message: message.into(),
            error_type: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn bad_request(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ErrorKind::BadRequest, message)
    }

    pub fn internal(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ErrorKind::Internal, message)
    }

    pub fn unsupported(provider: impl Into<String>, operation: &str) -> Self {
        let provider = provider.into();
        let message = format!("{provider} does not support {operation}");
        Self::new(provider, ErrorKind::BadRequest, message)
    }
}

#[derive(Debug, Error)]
pub enum TianjiError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, TianjiError>;
