//! IBM watsonx.ai chat: IAM API-key exchange, project-scoped OpenAI-like body.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    Credentials, ProviderAdapter, StreamEvent, UpstreamRequest, UpstreamResponse,
    default_map_params, parse_json_body, parse_json_value,
};
use crate::auth::{CachedToken, IbmIamSource, TokenPool};
use crate::error::{ErrorKind, ProviderError};
use crate::types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::utils::env::env_var;

const API_VERSION: &str = "2024-03-13";

const SUPPORTED_PARAMS: &[&str] = &[
    "max_tokens",
    "max_completion_tokens",
    "temperature",
    "top_p",
    "frequency_penalty",
    "presence_penalty",
    "stop",
    "n",
    "seed",
    "tools",
    "tool_choice",
    "response_format",
];

#[derive(Debug)]
pub struct Watsonx {
    params: BTreeSet<String>,
    tokens: TokenPool,
    iam_url: Option<String>,
}

impl Default for Watsonx {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl Watsonx {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            params: SUPPORTED_PARAMS.iter().map(|p| p.to_string()).collect(),
            tokens: TokenPool::new(http),
            iam_url: None,
        }
    }

    pub fn with_iam_url(mut self, url: impl Into<String>) -> Self {
        self.iam_url = Some(url.into());
        self
    }

    fn base_url(credentials: &Credentials) -> Result<String, ProviderError> {
        credentials
            .api_base
            .clone()
            .filter(|base| !base.trim().is_empty())
            .or_else(|| env_var("WATSONX_URL"))
            .or_else(|| env_var("WATSONX_API_BASE"))
            .ok_or_else(|| ProviderError::bad_request("watsonx", "watsonx url is not set"))
    }

    fn project_id(credentials: &Credentials) -> Result<String, ProviderError> {
        credentials
            .project
            .clone()
            .or_else(|| env_var("WATSONX_PROJECT_ID"))
            .ok_or_else(|| ProviderError::bad_request("watsonx", "watsonx project_id is not set"))
    }

    async fn bearer(&self, credentials: &Credentials) -> Result<String, ProviderError> {
        let api_key = credentials
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| env_var("WATSONX_APIKEY"))
            .or_else(|| env_var("WATSONX_API_KEY"))
            .ok_or_else(|| {
                ProviderError::new(self.provider(), ErrorKind::Auth, "missing watsonx api key")
            })?;
        let key = format!("iam:{:016x}", crate::utils::hash64_fnv1a(api_key.as_bytes()));
        let iam_url = self.iam_url.clone();
        let token = self
            .tokens
            .token(&key, move || {
                let source = IbmIamSource::new(api_key);
                CachedToken::new(match iam_url {
                    Some(url) => source.with_token_url(url),
                    None => source,
                })
            })
            .await
            .map_err(|err| err.into_provider_error(self.provider()))?;
        Ok(token.authorization_header_value())
    }
}

/// watsonx answers with `model_id` where OpenAI uses `model`.
fn normalize_model_field(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        if let Some(model_id) = obj.remove("model_id") {
            obj.entry("model").or_insert(model_id);
        }
    }
    value
}

#[async_trait]
impl ProviderAdapter for Watsonx {
    fn provider(&self) -> &str {
        "watsonx"
    }

    fn supported_params(&self) -> Option<&BTreeSet<String>> {
        Some(&self.params)
    }

    fn map_params(&self, params: serde_json::Map<String, Value>) -> serde_json::Map<String, Value> {
        default_map_params(params, self.supported_params(), false)
    }

    async fn build_request(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        let mut body = self.map_params(request.to_params());
        body.remove("model");
        body.remove("stream");
        body.insert("model_id".to_string(), Value::String(model.to_string()));
        body.insert(
            "project_id".to_string(),
            Value::String(Self::project_id(credentials)?),
        );

        let stream = request.is_stream();
        let method = if stream { "chat_stream" } else { "chat" };
        let base = Self::base_url(credentials)?;
        let url = format!(
            "{}/ml/v1/text/{method}?version={API_VERSION}",
            base.trim_end_matches('/')
        );
        let authorization = self.bearer(credentials).await?;
        Ok(UpstreamRequest::post_json(url, &Value::Object(body))
            .with_stream(stream)
            .with_header("authorization", authorization)
            .with_headers(&credentials.extra_headers))
    }

    fn parse_response(
        &self,
        response: &UpstreamResponse,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let raw: Value = parse_json_body(self.provider(), response)?;
        serde_json::from_value(normalize_model_field(raw))
            .map_err(|err| ProviderError::internal(self.provider(), err.to_string()))
    }

    fn parse_stream_event(&self, data: &str) -> Result<StreamEvent, ProviderError> {
        let raw = parse_json_value(self.provider(), data)?;
        let chunk: ChatCompletionChunk = serde_json::from_value(normalize_model_field(raw))
            .map_err(|err| ProviderError::internal(self.provider(), err.to_string()))?;
        Ok(StreamEvent::chunk(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    #[tokio::test]
    async fn exchanges_api_key_once_and_targets_project_chat() {
        if crate::utils::test_support::should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        let iam = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/identity/token")
                    .body_includes("apikey=ibm-key");
                then.status(200)
                    .json_body(json!({"access_token": "iam-tok", "token_type": "Bearer", "expires_in": 3600}));
            })
            .await;

        let adapter = Watsonx::default().with_iam_url(server.url("/identity/token"));
        let credentials = Credentials {
            api_key: Some("ibm-key".to_string()),
            api_base: Some("https://us-south.ml.cloud.ibm.com".to_string()),
            project: Some("proj-9".to_string()),
            ..Credentials::default()
        };
        let request = ChatCompletionRequest::new("ibm/granite", vec![ChatMessage::user("hi")]);
        for _ in 0..2 {
            let upstream = adapter
                .build_request(&request, "ibm/granite-13b-chat-v2", &credentials)
                .await
                .unwrap();
            assert_eq!(
                upstream.url,
                "https://us-south.ml.cloud.ibm.com/ml/v1/text/chat?version=2024-03-13"
            );
            assert_eq!(upstream.headers["authorization"], "Bearer iam-tok");
            let body = upstream.body_json().unwrap();
            assert_eq!(body["model_id"], "ibm/granite-13b-chat-v2");
            assert_eq!(body["project_id"], "proj-9");
            assert!(body.get("model").is_none());
        }
        iam.assert_calls_async(1).await;
    }

    #[test]
    fn parses_model_id_responses() {
        let response = UpstreamResponse::json(
            200,
            &json!({
                "id": "chat-1", "model_id": "ibm/granite", "created": 5,
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
            }),
        );
        let parsed = Watsonx::default().parse_response(&response).unwrap();
        assert_eq!(parsed.model, "ibm/granite");
        assert_eq!(parsed.first_content(), Some("ok"));
    }
}
