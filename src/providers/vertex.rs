//! Vertex AI: the Gemini dialect behind project/location URLs and Google OAuth.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::gemini;
use super::{Credentials, ProviderAdapter, StreamEvent, UpstreamRequest, UpstreamResponse};
use crate::auth::{CachedToken, GoogleAdcSource, StaticToken, TokenPool};
use crate::error::{ErrorKind, ProviderError};
use crate::types::{
    ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest, EmbeddingResponse,
};
use crate::utils::env::env_var;

const DEFAULT_LOCATION: &str = "us-central1";

#[derive(Debug)]
pub struct Vertex {
    params: BTreeSet<String>,
    tokens: TokenPool,
}

impl Default for Vertex {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl Vertex {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            params: gemini::supported_params(),
            tokens: TokenPool::new(http),
        }
    }

    fn project(credentials: &Credentials) -> Result<String, ProviderError> {
        credentials
            .project
            .clone()
            .or_else(|| env_var("VERTEX_PROJECT"))
            .or_else(|| env_var("GOOGLE_CLOUD_PROJECT"))
            .ok_or_else(|| ProviderError::bad_request("vertex_ai", "vertex project is not set"))
    }

    fn location(credentials: &Credentials) -> String {
        credentials
            .location
            .clone()
            .or_else(|| env_var("VERTEX_LOCATION"))
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string())
    }

    fn host(credentials: &Credentials, location: &str) -> String {
        if let Some(base) = credentials.api_base.as_ref().filter(|b| !b.trim().is_empty()) {
            return base.trim_end_matches('/').to_string();
        }
        if location == "global" {
            "https://aiplatform.googleapis.com".to_string()
        } else {
            format!("https://{location}-aiplatform.googleapis.com")
        }
    }

    pub(crate) fn model_url(
        credentials: &Credentials,
        model: &str,
        method: &str,
    ) -> Result<String, ProviderError> {
        let project = Self::project(credentials)?;
        let location = Self::location(credentials);
        let host = Self::host(credentials, &location);
        Ok(format!(
            "{host}/v1/projects/{project}/locations/{location}/publishers/google/models/{model}:{method}"
        ))
    }

    async fn authorize(
        &self,
        upstream: UpstreamRequest,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        let token = match credentials.api_key.clone().filter(|key| !key.trim().is_empty()) {
            Some(key) => {
                let fingerprint = format!("static:{:016x}", crate::utils::hash64_fnv1a(key.as_bytes()));
                self.tokens
                    .token(&fingerprint, || CachedToken::new(StaticToken(key)))
                    .await
            }
            None => {
                let file = credentials
                    .credentials_file
                    .clone()
                    .or_else(|| env_var("VERTEX_CREDENTIALS"));
                let key = format!("adc:{}", file.as_deref().unwrap_or("default"));
                self.tokens
                    .token(&key, || {
                        let source = GoogleAdcSource::default();
                        CachedToken::new(match file {
                            Some(path) => source.with_credentials_file(path),
                            None => source,
                        })
                    })
                    .await
            }
        }
        .map_err(|err| err.into_provider_error(self.provider()))?;

        Ok(upstream
            .with_header("authorization", token.authorization_header_value())
            .with_headers(&credentials.extra_headers))
    }
}

#[async_trait]
impl ProviderAdapter for Vertex {
    fn provider(&self) -> &str {
        "vertex_ai"
    }

    fn supported_params(&self) -> Option<&BTreeSet<String>> {
        Some(&self.params)
    }

    async fn build_request(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        let body = gemini::build_generate_body(request)?;
        let stream = request.is_stream();
        let url = if stream {
            format!(
                "{}?alt=sse",
                Self::model_url(credentials, model, "streamGenerateContent")?
            )
        } else {
            Self::model_url(credentials, model, "generateContent")?
        };
        let upstream = UpstreamRequest::post_json(url, &body).with_stream(stream);
        self.authorize(upstream, credentials).await
    }

    fn parse_response(
        &self,
        response: &UpstreamResponse,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        gemini::parse_generate_response(self.provider(), response)
    }

    fn parse_stream_event(&self, data: &str) -> Result<StreamEvent, ProviderError> {
        gemini::parse_generate_event(self.provider(), data)
    }

    async fn build_embedding_request(
        &self,
        request: &EmbeddingRequest,
        model: &str,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        let instances = request
            .input
            .texts()
            .into_iter()
            .map(|content| json!({ "content": content }))
            .collect::<Vec<_>>();
        let mut body = json!({ "instances": instances });
        if let Some(dimensions) = request.dimensions {
            body["parameters"] = json!({ "outputDimensionality": dimensions });
        }
        let url = Self::model_url(credentials, model, "predict")?;
        self.authorize(UpstreamRequest::post_json(url, &body), credentials)
            .await
    }

    fn parse_embedding_response(
        &self,
        response: &UpstreamResponse,
    ) -> Result<EmbeddingResponse, ProviderError> {
        let raw: Value = super::parse_json_body(self.provider(), response)?;
        let predictions = raw
            .get("predictions")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ProviderError::new(
                    self.provider(),
                    ErrorKind::Internal,
                    "embedding response has no predictions",
                )
            })?;
        let vectors = predictions
            .iter()
            .map(|prediction| {
                prediction
                    .pointer("/embeddings/values")
                    .and_then(Value::as_array)
                    .map(|values| values.iter().filter_map(Value::as_f64).map(|v| v as f32).collect())
                    .unwrap_or_default()
            })
            .collect();
        Ok(EmbeddingResponse::from_vectors("", vectors))
    }
}
