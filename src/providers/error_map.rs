//! Maps upstream error envelopes onto the normalized [`ErrorKind`] taxonomy.

use std::time::Duration;

use serde_json::Value;

use super::UpstreamResponse;
use crate::error::{ErrorKind, ProviderError};

const MAX_MESSAGE_CHARS: usize = 4096;

const CONTEXT_OVERFLOW_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "maximum context length",
    "prompt is too long",
    "exceeds the context window",
    "context window",
    "too many tokens",
    "input is too long",
];

const CONTENT_POLICY_MARKERS: &[&str] = &[
    "content_filter",
    "content_policy_violation",
    "content management policy",
    "responsibleaipolicyviolation",
    "safety",
];

pub fn classify(provider: &str, response: &UpstreamResponse) -> ProviderError {
    let parsed: Option<Value> = serde_json::from_slice(&response.body).ok();
    let (message, error_type, code) = parsed
        .as_ref()
        .map(extract_envelope)
        .unwrap_or((None, None, None));
    let message = message.unwrap_or_else(|| truncated_body(&response.body));

    let mut kind = ErrorKind::from_status(response.status);
    let haystack = format!(
        "{} {} {}",
        message,
        error_type.as_deref().unwrap_or_default(),
        code.as_deref().unwrap_or_default()
    )
    .to_ascii_lowercase();
    if matches!(kind, ErrorKind::BadRequest | ErrorKind::ContextOverflow) {
        if contains_any(&haystack, CONTEXT_OVERFLOW_MARKERS) {
            kind = ErrorKind::ContextOverflow;
        } else if contains_any(&haystack, CONTENT_POLICY_MARKERS) {
            kind = ErrorKind::ContentPolicy;
        }
    }
    if error_type.as_deref() == Some("overloaded_error") {
        kind = ErrorKind::Upstream5xx;
    }

    let mut err = ProviderError::new(provider, kind, message).with_status(response.status);
    if let Some(error_type) = error_type {
        err = err.with_error_type(error_type);
    }
    if let Some(retry_after) = retry_after(response) {
        err = err.with_retry_after(retry_after);
    }
    err
}

fn contains_any(haystack: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| haystack.contains(marker))
}

/// Pulls `(message, type, code)` out of the common OpenAI, Anthropic, and Google envelopes.
fn extract_envelope(value: &Value) -> (Option<String>, Option<String>, Option<String>) {
    let as_string = |value: Option<&Value>| -> Option<String> {
        match value? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };

    match value.get("error") {
        Some(Value::Object(error)) => (
            as_string(error.get("message")),
            as_string(error.get("type")).or_else(|| as_string(error.get("status"))),
            as_string(error.get("code")),
        ),
        Some(Value::String(message)) => (Some(message.clone()), None, None),
        _ => (
            as_string(value.get("message")).or_else(|| as_string(value.get("detail"))),
            as_string(value.get("type")),
            as_string(value.get("code")),
        ),
    }
}

fn truncated_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return "upstream returned an empty error body".to_string();
    }
    text.chars().take(MAX_MESSAGE_CHARS).collect()
}

/// `retry-after-ms` wins over `retry-after`; HTTP-date values are ignored.
pub fn retry_after(response: &UpstreamResponse) -> Option<Duration> {
    if let Some(ms) = response
        .header("retry-after-ms")
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
    {
        return Some(Duration::from_secs_f64(ms / 1000.0));
    }
    response
        .header("retry-after")
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn response(status: u16, body: Value, headers: &[(&str, &str)]) -> UpstreamResponse {
        UpstreamResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn openai_context_overflow_is_detected_from_code() {
        let err = classify(
            "openai",
            &response(
                400,
                json!({"error": {"message": "This model's maximum context length is 8192 tokens", "type": "invalid_request_error", "code": "context_length_exceeded"}}),
                &[],
            ),
        );
        assert_eq!(err.kind, ErrorKind::ContextOverflow);
        assert_eq!(err.status, Some(400));
        assert_eq!(err.error_type.as_deref(), Some("invalid_request_error"));
    }

    #[test]
    fn anthropic_prompt_too_long_is_context_overflow() {
        let err = classify(
            "anthropic",
            &response(
                400,
                json!({"type": "error", "error": {"type": "invalid_request_error", "message": "prompt is too long: 210000 tokens > 200000 maximum"}}),
                &[],
            ),
        );
        assert_eq!(err.kind, ErrorKind::ContextOverflow);
    }

    #[test]
    fn azure_content_filter_is_content_policy() {
        let err = classify(
            "azure",
            &response(
                400,
                json!({"error": {"message": "The response was filtered", "code": "content_filter"}}),
                &[],
            ),
        );
        assert_eq!(err.kind, ErrorKind::ContentPolicy);
    }

    #[test]
    fn rate_limit_keeps_retry_after() {
        let err = classify(
            "openai",
            &response(429, json!({"error": {"message": "slow"}}), &[("retry-after", "2")]),
        );
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.retry_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn anthropic_overloaded_is_server_error() {
        let err = classify(
            "anthropic",
            &response(
                529,
                json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
                &[],
            ),
        );
        assert_eq!(err.kind, ErrorKind::Upstream5xx);
    }

    #[test]
    fn non_json_bodies_become_the_message() {
        let err = classify(
            "openai",
            &UpstreamResponse {
                status: 502,
                headers: BTreeMap::new(),
                body: Bytes::from_static(b"Bad Gateway"),
            },
        );
        assert_eq!(err.kind, ErrorKind::Upstream5xx);
        assert_eq!(err.message, "Bad Gateway");
    }
}
