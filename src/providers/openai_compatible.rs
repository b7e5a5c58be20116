//! One parameterized adapter for every OpenAI-compatible upstream.
//!
//! A dialect is a [`ProviderProfile`] data record: base URL, auth header shape,
//! parameter support and renames, numeric constraints, and URL style. Adding a
//! provider is a new profile (built-in or from the providers JSON), not new code.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    Credentials, ProviderAdapter, StreamEvent, UpstreamRequest, UpstreamResponse,
    default_map_params, error_map, join_url, parse_json_body, parse_json_value,
};
use crate::error::{ErrorKind, ProviderError};
use crate::types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest,
    GATEWAY_ONLY_PARAMS, MediaOperation, MediaPayload,
};
use crate::utils::env::env_var;
use crate::utils::multipart::encode_multipart_form;
use crate::utils::sse::DONE_SENTINEL;

pub const AZURE_DEFAULT_API_VERSION: &str = "2024-10-21";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamConstraint {
    pub param: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ParamConstraint {
    fn apply(&self, params: &mut Map<String, Value>) {
        let Some(value) = params.get(&self.param).and_then(Value::as_f64) else {
            return;
        };
        let mut clamped = value;
        if let Some(min) = self.min {
            clamped = clamped.max(min);
        }
        if let Some(max) = self.max {
            clamped = clamped.min(max);
        }
        if clamped != value {
            if let Some(number) = serde_json::Number::from_f64(clamped) {
                params.insert(self.param.clone(), Value::Number(number));
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UrlStyle {
    /// `{base}/chat/completions` with `model` in the body.
    Base,
    /// `{base}/openai/deployments/{model}/...?api-version=` with no body `model`.
    AzureDeployment { default_api_version: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub embeddings: bool,
    pub images: bool,
    pub speech: bool,
    pub transcription: bool,
}

impl Capabilities {
    pub const ALL: Self = Self {
        embeddings: true,
        images: true,
        speech: true,
        transcription: true,
    };
    pub const CHAT_ONLY: Self = Self {
        embeddings: false,
        images: false,
        speech: false,
        transcription: false,
    };

    fn allows(&self, operation: MediaOperation) -> bool {
        match operation {
            MediaOperation::ImageGeneration => self.images,
            MediaOperation::Speech => self.speech,
            MediaOperation::Transcription => self.transcription,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProviderProfile {
    pub name: String,
    pub base_url: String,
    pub base_url_env: Option<String>,
    pub auth_header: String,
    pub auth_prefix: String,
    pub api_key_env: Vec<String>,
    pub extra_headers: BTreeMap<String, String>,
    pub supported_params: Option<BTreeSet<String>>,
    pub param_mappings: BTreeMap<String, String>,
    pub constraints: Vec<ParamConstraint>,
    pub url_style: UrlStyle,
    pub knows_max_completion_tokens: bool,
    pub capabilities: Capabilities,
}

const COMMON_PARAMS: &[&str] = &[
    "temperature",
    "top_p",
    "max_tokens",
    "stop",
    "n",
    "seed",
    "frequency_penalty",
    "presence_penalty",
    "stream_options",
    "tools",
    "tool_choice",
    "response_format",
    "user",
    "logprobs",
    "top_logprobs",
    "logit_bias",
    "parallel_tool_calls",
];

impl ProviderProfile {
    pub fn bearer(name: &str, base_url: &str, api_key_env: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            base_url_env: None,
            auth_header: "authorization".to_string(),
            auth_prefix: "Bearer ".to_string(),
            api_key_env: api_key_env.iter().map(|key| key.to_string()).collect(),
            extra_headers: BTreeMap::new(),
            supported_params: Some(COMMON_PARAMS.iter().map(|p| p.to_string()).collect()),
            param_mappings: BTreeMap::new(),
            constraints: Vec::new(),
            url_style: UrlStyle::Base,
            knows_max_completion_tokens: false,
            capabilities: Capabilities::CHAT_ONLY,
        }
    }

    pub fn with_all_params(mut self) -> Self {
        self.supported_params = None;
        self.knows_max_completion_tokens = true;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_base_url_env(mut self, env: &str) -> Self {
        self.base_url_env = Some(env.to_string());
        self
    }

    pub fn with_param_mapping(mut self, from: &str, to: &str) -> Self {
        self.param_mappings.insert(from.to_string(), to.to_string());
        self
    }

    pub fn with_constraint(mut self, param: &str, min: Option<f64>, max: Option<f64>) -> Self {
        self.constraints.push(ParamConstraint {
            param: param.to_string(),
            min,
            max,
        });
        self
    }

    pub fn with_extra_param(mut self, param: &str) -> Self {
        if let Some(params) = self.supported_params.as_mut() {
            params.insert(param.to_string());
        }
        self
    }

    /// Built-in OpenAI-compatible dialects.
    pub fn builtins() -> Vec<Self> {
        vec![
            Self::bearer("openai", "https://api.openai.com/v1", &["OPENAI_API_KEY"])
                .with_base_url_env("OPENAI_API_BASE")
                .with_all_params()
                .with_capabilities(Capabilities::ALL),
            Self::azure(),
            Self::bearer("groq", "https://api.groq.com/openai/v1", &["GROQ_API_KEY"])
                .with_extra_param("reasoning_effort")
                .with_capabilities(Capabilities {
                    transcription: true,
                    ..Capabilities::CHAT_ONLY
                }),
            Self::bearer("deepseek", "https://api.deepseek.com/v1", &["DEEPSEEK_API_KEY"]),
            Self::bearer("mistral", "https://api.mistral.ai/v1", &["MISTRAL_API_KEY"])
                .with_param_mapping("seed", "random_seed")
                .with_constraint("temperature", Some(0.0), Some(1.5))
                .with_capabilities(Capabilities {
                    embeddings: true,
                    ..Capabilities::CHAT_ONLY
                }),
            Self::bearer(
                "together_ai",
                "https://api.together.xyz/v1",
                &["TOGETHERAI_API_KEY", "TOGETHER_API_KEY"],
            )
            .with_extra_param("repetition_penalty")
            .with_capabilities(Capabilities {
                embeddings: true,
                images: true,
                ..Capabilities::CHAT_ONLY
            }),
            Self::bearer(
                "fireworks_ai",
                "https://api.fireworks.ai/inference/v1",
                &["FIREWORKS_AI_API_KEY", "FIREWORKS_API_KEY"],
            )
            .with_capabilities(Capabilities {
                embeddings: true,
                ..Capabilities::CHAT_ONLY
            }),
            Self::bearer("openrouter", "https://openrouter.ai/api/v1", &["OPENROUTER_API_KEY"])
                .with_all_params(),
            Self::bearer("xai", "https://api.x.ai/v1", &["XAI_API_KEY"])
                .with_extra_param("reasoning_effort")
                .with_capabilities(Capabilities {
                    images: true,
                    ..Capabilities::CHAT_ONLY
                }),
            Self::bearer(
                "perplexity",
                "https://api.perplexity.ai",
                &["PERPLEXITYAI_API_KEY", "PERPLEXITY_API_KEY"],
            )
            .with_extra_param("search_domain_filter")
            .with_extra_param("return_images"),
            Self::bearer(
                "deepinfra",
                "https://api.deepinfra.com/v1/openai",
                &["DEEPINFRA_API_KEY"],
            )
            .with_capabilities(Capabilities {
                embeddings: true,
                ..Capabilities::CHAT_ONLY
            }),
            Self::bearer("hosted_vllm", "http://localhost:8000/v1", &["HOSTED_VLLM_API_KEY"])
                .with_base_url_env("HOSTED_VLLM_API_BASE")
                .with_all_params()
                .with_capabilities(Capabilities {
                    embeddings: true,
                    transcription: true,
                    ..Capabilities::CHAT_ONLY
                }),
            Self::bearer("ollama_chat", "http://localhost:11434/v1", &["OLLAMA_API_KEY"])
                .with_base_url_env("OLLAMA_API_BASE")
                .with_capabilities(Capabilities {
                    embeddings: true,
                    ..Capabilities::CHAT_ONLY
                }),
        ]
    }

    pub fn azure() -> Self {
        Self {
            auth_header: "api-key".to_string(),
            auth_prefix: String::new(),
            url_style: UrlStyle::AzureDeployment {
                default_api_version: AZURE_DEFAULT_API_VERSION.to_string(),
            },
            ..Self::bearer("azure", "", &["AZURE_API_KEY", "AZURE_OPENAI_API_KEY"])
                .with_base_url_env("AZURE_API_BASE")
                .with_all_params()
                .with_capabilities(Capabilities::ALL)
        }
    }
}

#[derive(Clone, Debug)]
pub struct OpenAICompatible {
    profile: ProviderProfile,
}

impl OpenAICompatible {
    pub fn new(profile: ProviderProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    fn base_url(&self, credentials: &Credentials) -> Result<String, ProviderError> {
        let base = credentials
            .api_base
            .clone()
            .filter(|base| !base.trim().is_empty())
            .or_else(|| self.profile.base_url_env.as_deref().and_then(env_var))
            .unwrap_or_else(|| self.profile.base_url.clone());
        if base.trim().is_empty() {
            return Err(ProviderError::bad_request(
                &self.profile.name,
                "api_base is required for this provider",
            ));
        }
        Ok(base.trim_end_matches('/').to_string())
    }

    fn api_key(&self, credentials: &Credentials) -> Option<String> {
        credentials
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| {
                self.profile
                    .api_key_env
                    .iter()
                    .find_map(|name| env_var(name))
            })
    }

    fn auth_headers(&self, credentials: &Credentials) -> BTreeMap<String, String> {
        let mut headers = self.profile.extra_headers.clone();
        if let Some(key) = self.api_key(credentials) {
            if !self.profile.auth_header.trim().is_empty() {
                headers.insert(
                    self.profile.auth_header.to_ascii_lowercase(),
                    format!("{}{}", self.profile.auth_prefix, key),
                );
            }
        }
        for (name, value) in &credentials.extra_headers {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }
        headers
    }

    /// URL for `path` (e.g. `chat/completions`), plus whether `model` belongs in the body.
    fn endpoint(
        &self,
        path: &str,
        model: &str,
        credentials: &Credentials,
    ) -> Result<(String, bool), ProviderError> {
        let base = self.base_url(credentials)?;
        match &self.profile.url_style {
            UrlStyle::Base => {
                if base.ends_with(path) {
                    Ok((base, true))
                } else {
                    Ok((join_url(&base, path), true))
                }
            }
            UrlStyle::AzureDeployment {
                default_api_version,
            } => {
                let api_version = credentials
                    .api_version
                    .clone()
                    .filter(|version| !version.trim().is_empty())
                    .unwrap_or_else(|| default_api_version.clone());
                let base = base.trim_end_matches("/openai");
                Ok((
                    format!("{base}/openai/deployments/{model}/{path}?api-version={api_version}"),
                    false,
                ))
            }
        }
    }

    fn upstream(
        &self,
        url: String,
        body: &Value,
        credentials: &Credentials,
    ) -> UpstreamRequest {
        UpstreamRequest::post_json(url, body).with_headers(&self.auth_headers(credentials))
    }
}

#[async_trait]
impl ProviderAdapter for OpenAICompatible {
    fn provider(&self) -> &str {
        &self.profile.name
    }

    fn supported_params(&self) -> Option<&BTreeSet<String>> {
        self.profile.supported_params.as_ref()
    }

    fn map_params(&self, params: Map<String, Value>) -> Map<String, Value> {
        let mut params = default_map_params(
            params,
            self.supported_params(),
            self.profile.knows_max_completion_tokens,
        );
        for (from, to) in &self.profile.param_mappings {
            if let Some(value) = params.remove(from) {
                params.insert(to.clone(), value);
            }
        }
        for constraint in &self.profile.constraints {
            constraint.apply(&mut params);
        }
        params
    }

    async fn build_request(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        let (url, model_in_body) = self.endpoint("chat/completions", model, credentials)?;
        let mut params = self.map_params(request.to_params());
        if model_in_body {
            params.insert("model".to_string(), Value::String(model.to_string()));
        } else {
            params.remove("model");
        }
        let stream = request.is_stream();
        if stream {
            params.insert("stream".to_string(), Value::Bool(true));
            let forwards_stream_options = self
                .supported_params()
                .is_none_or(|supported| supported.contains("stream_options"));
            if forwards_stream_options && !params.contains_key("stream_options") {
                params.insert(
                    "stream_options".to_string(),
                    serde_json::json!({ "include_usage": true }),
                );
            }
        } else {
            params.remove("stream");
            params.remove("stream_options");
        }
        Ok(self
            .upstream(url, &Value::Object(params), credentials)
            .with_stream(stream))
    }

    fn parse_response(
        &self,
        response: &UpstreamResponse,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        parse_json_body(self.provider(), response)
    }

    fn parse_stream_event(&self, data: &str) -> Result<StreamEvent, ProviderError> {
        let data = data.trim();
        if data == DONE_SENTINEL {
            return Ok(StreamEvent::done());
        }
        let value = parse_json_value(self.provider(), data)?;
        if value.get("error").is_some() {
            let status = value
                .pointer("/error/code")
                .and_then(Value::as_u64)
                .and_then(|code| u16::try_from(code).ok())
                .filter(|code| (400..600).contains(code))
                .unwrap_or(500);
            return Err(error_map::classify(
                self.provider(),
                &UpstreamResponse::json(status, &value),
            ));
        }
        let chunk: ChatCompletionChunk = serde_json::from_value(value).map_err(|err| {
            ProviderError::new(
                self.provider(),
                ErrorKind::Internal,
                format!("invalid stream chunk: {err}"),
            )
        })?;
        Ok(StreamEvent::chunk(chunk))
    }

    async fn build_embedding_request(
        &self,
        request: &EmbeddingRequest,
        model: &str,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        if !self.profile.capabilities.embeddings {
            return Err(ProviderError::unsupported(self.provider(), "embeddings"));
        }
        let (url, model_in_body) = self.endpoint("embeddings", model, credentials)?;
        let Value::Object(mut body) = serde_json::to_value(request).map_err(|err| {
            ProviderError::internal(self.provider(), format!("invalid embedding request: {err}"))
        })?
        else {
            return Err(ProviderError::internal(
                self.provider(),
                "embedding request did not serialize to an object",
            ));
        };
        for key in GATEWAY_ONLY_PARAMS {
            body.remove(*key);
        }
        if model_in_body {
            body.insert("model".to_string(), Value::String(model.to_string()));
        } else {
            body.remove("model");
        }
        Ok(self.upstream(url, &Value::Object(body), credentials))
    }

    async fn build_media_request(
        &self,
        operation: MediaOperation,
        payload: &MediaPayload,
        model: &str,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        if !self.profile.capabilities.allows(operation) {
            return Err(ProviderError::unsupported(
                self.provider(),
                operation.as_str(),
            ));
        }
        let (url, model_in_body) = self.endpoint(operation.openai_path(), model, credentials)?;
        let mut payload = payload.clone();
        payload.set_model(model_in_body.then_some(model));
        match payload {
            MediaPayload::Json(mut body) => {
                for key in GATEWAY_ONLY_PARAMS {
                    body.remove(*key);
                }
                Ok(self.upstream(url, &Value::Object(body), credentials))
            }
            MediaPayload::Multipart(parts) => {
                let (content_type, body) = encode_multipart_form(&parts);
                let mut upstream = UpstreamRequest::post_json(url, &Value::Null)
                    .with_headers(&self.auth_headers(credentials))
                    .with_header("content-type", content_type);
                upstream.body = body;
                Ok(upstream)
            }
        }
    }

    async fn build_passthrough(
        &self,
        path_and_query: &str,
        body: Bytes,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        let url = join_url(&self.base_url(credentials)?, path_and_query);
        let mut upstream = UpstreamRequest::post_json(url, &Value::Null)
            .with_headers(&self.auth_headers(credentials));
        upstream.body = body;
        Ok(upstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;
    use serde_json::json;

    fn profile(name: &str) -> ProviderProfile {
        ProviderProfile::builtins()
            .into_iter()
            .find(|profile| profile.name == name)
            .unwrap()
    }

    fn credentials(key: &str, base: Option<&str>) -> Credentials {
        Credentials {
            api_key: Some(key.to_string()),
            api_base: base.map(str::to_string),
            ..Credentials::default()
        }
    }

    #[tokio::test]
    async fn openai_request_targets_chat_completions_with_bearer() {
        let adapter = OpenAICompatible::new(profile("openai"));
        let request = ChatCompletionRequest::new("gpt-4o", vec![ChatMessage::user("Hello")]);
        let upstream = adapter
            .build_request(&request, "gpt-4o", &credentials("sk-test", None))
            .await
            .unwrap();
        assert_eq!(upstream.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(upstream.headers["authorization"], "Bearer sk-test");
        let body = upstream.body_json().unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["content"], "Hello");
        assert!(body.get("stream").is_none());
    }

    #[tokio::test]
    async fn azure_uses_deployment_url_and_api_key_header() {
        let adapter = OpenAICompatible::new(ProviderProfile::azure());
        let request = ChatCompletionRequest::new("gpt-4o", vec![ChatMessage::user("Hello")]);
        let upstream = adapter
            .build_request(
                &request,
                "gpt-4o",
                &credentials("azure-key", Some("https://res.openai.azure.com")),
            )
            .await
            .unwrap();
        assert_eq!(
            upstream.url,
            "https://res.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-10-21"
        );
        assert_eq!(upstream.headers["api-key"], "azure-key");
        assert!(!upstream.headers.contains_key("authorization"));
        assert!(upstream.body_json().unwrap().get("model").is_none());
    }

    #[tokio::test]
    async fn streaming_requests_ask_for_usage() {
        let adapter = OpenAICompatible::new(profile("openai"));
        let mut request = ChatCompletionRequest::new("gpt-4o", vec![ChatMessage::user("Hi")]);
        request.stream = Some(true);
        let upstream = adapter
            .build_request(&request, "gpt-4o", &credentials("k", None))
            .await
            .unwrap();
        assert!(upstream.stream);
        let body = upstream.body_json().unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn mistral_renames_seed_and_clamps_temperature() {
        let adapter = OpenAICompatible::new(profile("mistral"));
        let Value::Object(params) = json!({
            "model": "m",
            "seed": 1,
            "temperature": 3.0,
            "max_completion_tokens": 10,
            "tags": ["x"]
        }) else {
            unreachable!()
        };
        let mapped = adapter.map_params(params);
        assert_eq!(mapped.get("random_seed"), Some(&json!(1)));
        assert_eq!(mapped.get("temperature"), Some(&json!(1.5)));
        assert_eq!(mapped.get("max_tokens"), Some(&json!(10)));
        assert!(!mapped.contains_key("tags"));
    }

    #[test]
    fn stream_events_terminate_on_done_and_finish_reason() {
        let adapter = OpenAICompatible::new(profile("openai"));
        let delta = adapter
            .parse_stream_event(r#"{"id":"c","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#)
            .unwrap();
        assert!(!delta.terminal);
        assert_eq!(
            delta.chunk.unwrap().choices[0].delta.content.as_deref(),
            Some("Hi")
        );
        let finish = adapter
            .parse_stream_event(r#"{"choices":[{"index":0,"delta":{},"finish_reason":"length"}]}"#)
            .unwrap();
        assert!(finish.terminal);
        assert!(adapter.parse_stream_event("[DONE]").unwrap().terminal);
    }

    #[test]
    fn in_stream_error_is_classified() {
        let adapter = OpenAICompatible::new(profile("openai"));
        let err = adapter
            .parse_stream_event(r#"{"error":{"message":"overloaded","code":503}}"#)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Upstream5xx);
    }

    #[tokio::test]
    async fn transcription_multipart_model_is_rewritten() {
        use crate::utils::multipart::{MultipartPart, parse_multipart_form};

        let adapter = OpenAICompatible::new(profile("openai"));
        let payload = MediaPayload::Multipart(vec![
            MultipartPart::text("model", "my-whisper"),
            MultipartPart::file("file", "a.wav", None, Bytes::from_static(b"RIFF")),
        ]);
        let upstream = adapter
            .build_media_request(
                MediaOperation::Transcription,
                &payload,
                "whisper-1",
                &credentials("k", None),
            )
            .await
            .unwrap();
        assert_eq!(upstream.url, "https://api.openai.com/v1/audio/transcriptions");
        let parts = parse_multipart_form(&upstream.headers["content-type"], &upstream.body).unwrap();
        let model = parts.iter().find(|part| part.name == "model").unwrap();
        assert_eq!(model.data.as_ref(), b"whisper-1");
    }

    #[tokio::test]
    async fn chat_only_profiles_reject_images() {
        let adapter = OpenAICompatible::new(profile("deepseek"));
        let err = adapter
            .build_media_request(
                MediaOperation::ImageGeneration,
                &MediaPayload::Json(Map::new()),
                "m",
                &credentials("k", None),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }
}
