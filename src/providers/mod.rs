//! Provider translation layer.
//!
//! Every upstream dialect implements [`ProviderAdapter`]: it turns the canonical
//! OpenAI-shaped request into an [`UpstreamRequest`] and turns upstream bytes back
//! into canonical responses. Adapters never perform I/O for the request itself;
//! the [`Transport`] does, which keeps translation testable without a network.

pub mod anthropic;
pub mod configurable;
pub mod elevenlabs;
pub mod error_map;
pub mod gemini;
pub mod openai_compatible;
pub mod registry;
pub mod sagemaker;
pub mod transport;
pub mod vertex;
pub mod watsonx;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::alphabet;
use base64::engine::DecodePaddingMode;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};

use crate::error::{ErrorKind, ProviderError};
use crate::types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, EmbeddingRequest,
    EmbeddingResponse, GATEWAY_ONLY_PARAMS, MediaOperation, MediaPayload, MediaResponse,
};
use crate::utils::sse::DONE_SENTINEL;

pub use configurable::{ParamConstraint, ProviderProfileConfig, ProvidersFile};
pub use openai_compatible::{OpenAICompatible, ProviderProfile, UrlStyle};
pub use registry::{ProviderRegistry, split_model};
pub use transport::{ReqwestTransport, StreamingReply, Transport};

pub type ChunkStream = BoxStream<'static, Result<ChatCompletionChunk, ProviderError>>;

/// Per-deployment credential material. Values are already resolved from the environment.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub api_version: Option<String>,
    pub region: Option<String>,
    pub project: Option<String>,
    pub location: Option<String>,
    pub credentials_file: Option<String>,
    pub extra_headers: BTreeMap<String, String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .field("api_version", &self.api_version)
            .field("region", &self.region)
            .field("project", &self.project)
            .field("location", &self.location)
            .field("credentials_file", &self.credentials_file)
            .field("extra_headers", &self.extra_headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub stream: bool,
}

impl UpstreamRequest {
    pub fn post_json(url: impl Into<String>, body: &Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            method: reqwest::Method::POST,
            url: url.into(),
            headers,
            body: Bytes::from(body.to_string()),
            stream: false,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: &BTreeMap<String, String>) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.to_ascii_lowercase(), value.clone());
        }
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            headers: BTreeMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("application/octet-stream")
    }
}

/// One decoded upstream stream event.
#[derive(Clone, Debug, Default)]
pub struct StreamEvent {
    pub chunk: Option<ChatCompletionChunk>,
    pub terminal: bool,
}

impl StreamEvent {
    pub fn chunk(chunk: ChatCompletionChunk) -> Self {
        let terminal = chunk.is_terminal();
        Self {
            chunk: Some(chunk),
            terminal,
        }
    }

    pub fn skip() -> Self {
        Self::default()
    }

    pub fn done() -> Self {
        Self {
            chunk: None,
            terminal: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// Upstream speaks SSE and events are translated one by one.
    Sse,
    /// Upstream has no streaming; the full response is replayed as chunks.
    Synthesized,
}

/// The fixed translation contract every upstream dialect implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> &str;

    /// Request parameters the dialect understands. `None` forwards everything.
    fn supported_params(&self) -> Option<&BTreeSet<String>>;

    /// Renames and clamps canonical parameters into the dialect's idioms.
    fn map_params(&self, params: Map<String, Value>) -> Map<String, Value> {
        default_map_params(params, self.supported_params(), true)
    }

    async fn build_request(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError>;

    /// Parses a successful upstream body.
    fn parse_response(
        &self,
        response: &UpstreamResponse,
    ) -> Result<ChatCompletionResponse, ProviderError>;

    /// Decodes one SSE `data:` payload. Stateless across events.
    fn parse_stream_event(&self, data: &str) -> Result<StreamEvent, ProviderError>;

    fn stream_mode(&self) -> StreamMode {
        StreamMode::Sse
    }

    fn parse_error(&self, response: &UpstreamResponse) -> ProviderError {
        error_map::classify(self.provider(), response)
    }

    async fn build_embedding_request(
        &self,
        _request: &EmbeddingRequest,
        _model: &str,
        _credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        Err(ProviderError::unsupported(self.provider(), "embeddings"))
    }

    fn parse_embedding_response(
        &self,
        response: &UpstreamResponse,
    ) -> Result<EmbeddingResponse, ProviderError> {
        parse_json_body(self.provider(), response)
    }

    async fn build_media_request(
        &self,
        operation: MediaOperation,
        _payload: &MediaPayload,
        _model: &str,
        _credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        Err(ProviderError::unsupported(
            self.provider(),
            operation.as_str(),
        ))
    }

    fn parse_media_response(
        &self,
        _operation: MediaOperation,
        response: &UpstreamResponse,
    ) -> Result<MediaResponse, ProviderError> {
        Ok(MediaResponse {
            content_type: response.content_type().to_string(),
            body: response.body.clone(),
        })
    }

    /// Builds a raw forwarded request for `POST /v1/{provider}/*path`.
    async fn build_passthrough(
        &self,
        _path_and_query: &str,
        _body: Bytes,
        _credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        Err(ProviderError::unsupported(self.provider(), "pass-through"))
    }
}

/// Shared parameter mapping: drops gateway-only keys, collapses
/// `max_completion_tokens` when the dialect predates it, and filters to `supported`.
pub fn default_map_params(
    mut params: Map<String, Value>,
    supported: Option<&BTreeSet<String>>,
    knows_max_completion_tokens: bool,
) -> Map<String, Value> {
    for key in GATEWAY_ONLY_PARAMS {
        params.remove(*key);
    }
    if !knows_max_completion_tokens {
        if let Some(value) = params.remove("max_completion_tokens") {
            params.insert("max_tokens".to_string(), value);
        }
    }
    if let Some(supported) = supported {
        params.retain(|key, _| {
            matches!(key.as_str(), "model" | "messages" | "stream") || supported.contains(key)
        });
    }
    params
}

pub(crate) fn parse_json_body<T: serde::de::DeserializeOwned>(
    provider: &str,
    response: &UpstreamResponse,
) -> Result<T, ProviderError> {
    serde_json::from_slice(&response.body).map_err(|err| {
        ProviderError::new(
            provider,
            ErrorKind::Internal,
            format!("failed to decode upstream response: {err}"),
        )
        .with_status(response.status)
    })
}

pub(crate) fn parse_json_value(provider: &str, data: &str) -> Result<Value, ProviderError> {
    serde_json::from_str(data).map_err(|err| {
        ProviderError::new(
            provider,
            ErrorKind::Internal,
            format!("failed to decode upstream stream event: {err}"),
        )
    })
}

const LENIENT_STANDARD: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);
const LENIENT_URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Splits a `data:` URL into `(mime_type, base64_payload)`. The payload comes
/// back as padded standard base64 whatever the URL used; non-base64 URLs are
/// encoded, and undecodable payloads yield `None`.
pub(crate) fn split_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (meta, bytes) = match meta.strip_suffix(";base64") {
        Some(meta) => {
            let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            let bytes = LENIENT_STANDARD
                .decode(&compact)
                .or_else(|_| LENIENT_URL_SAFE.decode(&compact))
                .ok()?;
            (meta, bytes)
        }
        None => (meta, data.as_bytes().to_vec()),
    };
    let mime = meta.split(';').next().unwrap_or_default().trim();
    let mime = if mime.is_empty() { "application/octet-stream" } else { mime };
    Some((mime.to_string(), STANDARD.encode(bytes)))
}

pub(crate) fn guess_mime_from_url(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".pdf") {
        "application/pdf"
    } else if path.ends_with(".mp3") {
        "audio/mpeg"
    } else if path.ends_with(".wav") {
        "audio/wav"
    } else {
        "image/jpeg"
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Dispatches a non-streaming chat request through `transport`.
pub async fn execute_chat(
    adapter: &dyn ProviderAdapter,
    transport: &dyn Transport,
    request: &ChatCompletionRequest,
    model: &str,
    credentials: &Credentials,
    timeout: Option<Duration>,
) -> Result<ChatCompletionResponse, ProviderError> {
    let mut request = request.clone();
    request.stream = None;
    request.stream_options = None;
    let upstream = adapter.build_request(&request, model, credentials).await?;
    let response = transport
        .send(upstream, timeout)
        .await
        .map_err(|err| with_provider(err, adapter.provider()))?;
    if !response.is_success() {
        return Err(adapter.parse_error(&response));
    }
    adapter.parse_response(&response)
}

/// Dispatches a streaming chat request. The returned stream ends after the
/// terminal event, trailing usage-only chunks included.
pub async fn execute_chat_stream(
    adapter: Arc<dyn ProviderAdapter>,
    transport: &dyn Transport,
    request: &ChatCompletionRequest,
    model: &str,
    credentials: &Credentials,
    timeout: Option<Duration>,
) -> Result<ChunkStream, ProviderError> {
    if adapter.stream_mode() == StreamMode::Synthesized {
        let response =
            execute_chat(adapter.as_ref(), transport, request, model, credentials, timeout)
                .await?;
        let chunks = synthesize_chunks(&response);
        return Ok(futures_util::stream::iter(chunks.into_iter().map(Ok)).boxed());
    }

    let upstream = adapter
        .build_request(request, model, credentials)
        .await?
        .with_stream(true);
    let reply = transport
        .send_streaming(upstream, timeout)
        .await
        .map_err(|err| with_provider(err, adapter.provider()))?;
    match reply {
        StreamingReply::Events(events) => Ok(translate_stream(events, adapter)),
        StreamingReply::Failed(response) => Err(adapter.parse_error(&response)),
    }
}

struct TranslateState {
    events: transport::SseStream,
    adapter: Arc<dyn ProviderAdapter>,
    finished: bool,
    draining: bool,
}

fn translate_stream(events: transport::SseStream, adapter: Arc<dyn ProviderAdapter>) -> ChunkStream {
    let state = TranslateState {
        events,
        adapter,
        finished: false,
        draining: false,
    };
    futures_util::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            let Some(next) = state.events.next().await else {
                return None;
            };
            let data = match next {
                Ok(data) => data,
                Err(err) => {
                    state.finished = true;
                    let err = ProviderError::new(
                        state.adapter.provider(),
                        ErrorKind::TransientNetwork,
                        err.to_string(),
                    );
                    return Some((Err(err), state));
                }
            };
            if data.trim() == DONE_SENTINEL {
                return None;
            }
            let event = match state.adapter.parse_stream_event(&data) {
                Ok(event) => event,
                Err(err) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
            };
            if state.draining {
                match event.chunk {
                    Some(chunk) if chunk.choices.is_empty() && chunk.usage.is_some() => {
                        return Some((Ok(chunk), state));
                    }
                    _ => continue,
                }
            }
            if event.terminal {
                state.draining = true;
            }
            if let Some(chunk) = event.chunk {
                return Some((Ok(chunk), state));
            }
        }
    })
    .boxed()
}

/// Replays a complete response as a role chunk, one content chunk, and a finish chunk.
pub fn synthesize_chunks(response: &ChatCompletionResponse) -> Vec<ChatCompletionChunk> {
    use crate::types::{ChunkChoice, ChunkDelta, FunctionCallDelta, ToolCallDelta};

    let mut out = Vec::new();
    for choice in &response.choices {
        let tool_calls = choice.message.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(index, call)| ToolCallDelta {
                    index: index as u32,
                    id: Some(call.id.clone()),
                    kind: Some(call.kind.clone()),
                    function: Some(FunctionCallDelta {
                        name: Some(call.function.name.clone()),
                        arguments: Some(call.function.arguments.clone()),
                    }),
                })
                .collect::<Vec<_>>()
        });
        out.push(ChatCompletionChunk::new(vec![ChunkChoice {
            index: choice.index,
            delta: ChunkDelta {
                role: Some(choice.message.role.clone()),
                content: choice.message.content.clone(),
                tool_calls,
                images: choice.message.images.clone(),
                reasoning_content: choice.message.reasoning_content.clone(),
                extra: Map::new(),
            },
            finish_reason: None,
            extra: Map::new(),
        }]));
        out.push(ChatCompletionChunk::new(vec![ChunkChoice {
            index: choice.index,
            finish_reason: Some(
                choice
                    .finish_reason
                    .clone()
                    .unwrap_or_else(|| "stop".to_string()),
            ),
            ..ChunkChoice::default()
        }]));
    }
    if let Some(usage) = response.usage.clone() {
        out.push(ChatCompletionChunk::usage_only(usage));
    }
    for chunk in &mut out {
        chunk.id = response.id.clone();
        chunk.created = response.created;
        chunk.model = response.model.clone();
    }
    out
}

pub async fn execute_embedding(
    adapter: &dyn ProviderAdapter,
    transport: &dyn Transport,
    request: &EmbeddingRequest,
    model: &str,
    credentials: &Credentials,
    timeout: Option<Duration>,
) -> Result<EmbeddingResponse, ProviderError> {
    let upstream = adapter
        .build_embedding_request(request, model, credentials)
        .await?;
    let response = transport
        .send(upstream, timeout)
        .await
        .map_err(|err| with_provider(err, adapter.provider()))?;
    if !response.is_success() {
        return Err(adapter.parse_error(&response));
    }
    let mut parsed = adapter.parse_embedding_response(&response)?;
    if parsed.model.is_empty() {
        parsed.model = model.to_string();
    }
    Ok(parsed)
}

pub async fn execute_media(
    adapter: &dyn ProviderAdapter,
    transport: &dyn Transport,
    operation: MediaOperation,
    payload: &MediaPayload,
    model: &str,
    credentials: &Credentials,
    timeout: Option<Duration>,
) -> Result<MediaResponse, ProviderError> {
    let upstream = adapter
        .build_media_request(operation, payload, model, credentials)
        .await?;
    let response = transport
        .send(upstream, timeout)
        .await
        .map_err(|err| with_provider(err, adapter.provider()))?;
    if !response.is_success() {
        return Err(adapter.parse_error(&response));
    }
    adapter.parse_media_response(operation, &response)
}

fn with_provider(mut err: ProviderError, provider: &str) -> ProviderError {
    err.provider = provider.to_string();
    err
}
