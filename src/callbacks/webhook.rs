use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;

use super::{Callback, RequestEvent};

/// POSTs each event as JSON. Delivery failures are logged and dropped.
#[derive(Clone)]
pub struct WebhookCallback {
    http: reqwest::Client,
    url: url::Url,
    headers: BTreeMap<String, String>,
}

impl std::fmt::Debug for WebhookCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookCallback")
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WebhookCallback {
    pub fn new(http: reqwest::Client, url: url::Url, headers: BTreeMap<String, String>) -> Self {
        Self { http, url, headers }
    }

    async fn deliver(&self, status: &str, event: &RequestEvent) {
        let body = json!({ "status": status, "event": event });
        let mut request = self.http.post(self.url.clone()).json(&body);
        for (name, value) in &self.headers {
            if let Some(value) = crate::utils::env::resolve_env_ref(value) {
                request = request.header(name, value);
            }
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => tracing::warn!(
                request_id = %event.request_id,
                status = response.status().as_u16(),
                "webhook callback rejected event"
            ),
            Err(err) => tracing::warn!(
                request_id = %event.request_id,
                "webhook callback failed: {err}"
            ),
        }
    }
}

#[async_trait]
impl Callback for WebhookCallback {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn log_success(&self, event: &RequestEvent) {
        self.deliver("success", event).await;
    }

    async fn log_failure(&self, event: &RequestEvent) {
        self.deliver("failure", event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::CallType;
    use crate::utils::test_support::should_skip_httpmock;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn posts_event_json_with_configured_headers() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hook")
                    .header("x-hook-token", "t0k")
                    .body_includes("\"status\":\"success\"")
                    .body_includes("\"request_id\":\"req-1\"")
                    .body_includes("\"model_group\":\"gpt-4o\"");
                then.status(204);
            })
            .await;
        let mut headers = BTreeMap::new();
        headers.insert("x-hook-token".to_string(), "t0k".to_string());
        let hook = WebhookCallback::new(
            reqwest::Client::new(),
            url::Url::parse(&server.url("/hook")).unwrap(),
            headers,
        );
        hook.log_success(&RequestEvent::new("req-1", CallType::Chat, "gpt-4o"))
            .await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn delivery_errors_do_not_panic() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(500);
            })
            .await;
        let hook = WebhookCallback::new(
            reqwest::Client::new(),
            url::Url::parse(&server.url("/hook")).unwrap(),
            BTreeMap::new(),
        );
        hook.log_failure(&RequestEvent::new("req-2", CallType::Embedding, "emb"))
            .await;
        mock.assert_async().await;
    }
}
