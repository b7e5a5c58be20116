use async_trait::async_trait;

use super::{Callback, RequestEvent};

/// Emits one structured `tracing` record per request.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

#[async_trait]
impl Callback for TracingLogger {
    fn name(&self) -> &'static str {
        "logger"
    }

    async fn log_success(&self, event: &RequestEvent) {
        tracing::info!(
            request_id = %event.request_id,
            call_type = ?event.call_type,
            model_group = %event.model_group,
            deployment = event.deployment.as_deref().unwrap_or("-"),
            key_id = event.key_id.as_deref().unwrap_or("-"),
            attempts = event.attempts.len(),
            total_tokens = event.total_tokens(),
            cost_usd = event.cost_usd,
            latency_ms = event.latency_ms,
            cache_hit = event.cache_hit,
            stream = event.stream,
            "request completed"
        );
    }

    async fn log_failure(&self, event: &RequestEvent) {
        let (kind, status, message) = event
            .error
            .as_ref()
            .map(|error| (error.kind.as_str(), error.status.unwrap_or_default(), error.message.as_str()))
            .unwrap_or(("internal", 0, ""));
        let attempts = event
            .attempts
            .iter()
            .map(|attempt| format!("{}:{}", attempt.deployment, attempt.outcome()))
            .collect::<Vec<_>>()
            .join(",");
        tracing::warn!(
            request_id = %event.request_id,
            call_type = ?event.call_type,
            model_group = %event.model_group,
            key_id = event.key_id.as_deref().unwrap_or("-"),
            kind,
            status,
            attempts = %attempts,
            latency_ms = event.latency_ms,
            "request failed: {message}"
        );
    }
}
