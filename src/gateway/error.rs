use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::callbacks::EventError;
use crate::error::{ErrorKind, ProviderError};
use crate::router::{Attempt, RouterError};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttemptSummary {
    pub deployment: String,
    pub kind: String,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts: Option<Vec<AttemptSummary>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// An error returned to the client as `{error:{message,type,code}}`.
#[derive(Clone, Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub error_type: &'static str,
    pub code: String,
    pub message: String,
    /// Only filled for privileged callers.
    pub attempts: Option<Vec<AttemptSummary>>,
    pub upstream_status: Option<u16>,
    /// Every attempt, for callbacks; never serialized.
    pub trail: Vec<Attempt>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: status_for(kind),
            kind,
            error_type: kind.openai_type(),
            code: kind.as_str().to_string(),
            message: message.into(),
            attempts: None,
            upstream_status: None,
            trail: Vec::new(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorKind::Auth, "missing or invalid api key")
    }

    pub fn forbidden_model(model: &str) -> Self {
        let mut err = Self::new(ErrorKind::Auth, format!("key is not allowed to call model {model}"));
        err.status = StatusCode::FORBIDDEN;
        err
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn policy_violation(message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::ContentPolicy, message);
        err.status = StatusCode::BAD_REQUEST;
        err.error_type = "policy_violation";
        err.code = "policy_violation".to_string();
        err
    }

    pub fn from_provider(err: &ProviderError) -> Self {
        let mut out = Self::new(err.kind, err.message.clone());
        out.upstream_status = err.status;
        out
    }

    /// The last upstream error, with the attempt list when `privileged`.
    pub fn from_router(err: &RouterError, privileged: bool) -> Self {
        let mut out = match err.provider_error() {
            Some(provider) => Self::from_provider(provider),
            None => Self::new(err.kind(), err.to_string()),
        };
        if matches!(err, RouterError::UnknownModel(_)) {
            out.status = StatusCode::NOT_FOUND;
            out.code = "model_not_found".to_string();
        }
        out.trail = err.attempts().to_vec();
        if privileged && !err.attempts().is_empty() {
            out.attempts = Some(
                err.attempts()
                    .iter()
                    .map(|attempt| AttemptSummary {
                        deployment: attempt.deployment.clone(),
                        kind: attempt.outcome().to_string(),
                    })
                    .collect(),
            );
        }
        out
    }

    pub fn event_error(&self) -> EventError {
        EventError {
            kind: self.kind,
            message: self.message.clone(),
            status: self.upstream_status.or(Some(self.status.as_u16())),
        }
    }

    /// JSON payload for an SSE `data:` error frame.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.body()).unwrap_or(serde_json::Value::Null)
    }

    fn body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                message: self.message.clone(),
                kind: self.error_type,
                code: self.code.clone(),
                attempts: self.attempts.clone(),
            },
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.status, self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exhausted() -> RouterError {
        RouterError::Exhausted {
            last: ProviderError::new("openai", ErrorKind::Upstream5xx, "boom").with_status(503),
            attempts: vec![Attempt {
                deployment: "A/d1".to_string(),
                model_group: "A".to_string(),
                kind: Some(ErrorKind::Upstream5xx),
                latency_ms: 3,
            }],
        }
    }

    #[test]
    fn router_errors_mirror_last_upstream_kind() {
        let err = ApiError::from_router(&exhausted(), false);
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(err.code, "upstream_5xx");
        assert_eq!(err.message, "boom");
        assert!(err.attempts.is_none());
    }

    #[test]
    fn privileged_callers_see_attempts() {
        let err = ApiError::from_router(&exhausted(), true);
        let body = err.to_json();
        assert_eq!(body["error"]["attempts"][0]["deployment"], "A/d1");
        assert_eq!(body["error"]["attempts"][0]["kind"], "upstream_5xx");
        assert_eq!(body["error"]["type"], "api_error");
    }

    #[test]
    fn policy_violation_is_a_400() {
        let err = ApiError::policy_violation("blocked by pii");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.to_json()["error"]["type"], "policy_violation");
    }

    #[test]
    fn unknown_model_is_not_found() {
        let err = ApiError::from_router(&RouterError::UnknownModel("nope".to_string()), true);
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.code, "model_not_found");
    }
}
