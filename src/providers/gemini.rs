//! Gemini `generateContent` dialect, shared by Google AI Studio and Vertex AI.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{
    Credentials, ProviderAdapter, StreamEvent, UpstreamRequest, UpstreamResponse,
    guess_mime_from_url, parse_json_body, parse_json_value, split_data_url,
};
use crate::error::{ErrorKind, ProviderError};
use crate::types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ChunkChoice, ChunkDelta, ContentPart, EmbeddingRequest, EmbeddingResponse, FunctionCall,
    FunctionCallDelta, ResponseMessage, Role, Tool, ToolCall, ToolCallDelta, ToolChoice, Usage,
};
use crate::utils::env::env_var;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const SUPPORTED_PARAMS: &[&str] = &[
    "max_tokens",
    "max_completion_tokens",
    "temperature",
    "top_p",
    "stop",
    "n",
    "seed",
    "presence_penalty",
    "frequency_penalty",
    "response_format",
    "modalities",
    "tools",
    "tool_choice",
];

pub(crate) fn supported_params() -> BTreeSet<String> {
    SUPPORTED_PARAMS.iter().map(|p| p.to_string()).collect()
}

fn model_path(model: &str) -> String {
    let model = model.trim();
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

fn tool_name_map(messages: &[ChatMessage]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for message in messages {
        for call in message.tool_calls.iter().flatten() {
            map.insert(call.id.clone(), call.function.name.clone());
        }
    }
    map
}

fn media_part(url: &str) -> Value {
    match split_data_url(url) {
        Some((mime_type, data)) => json!({ "inlineData": { "mimeType": mime_type, "data": data } }),
        None => json!({ "fileData": { "mimeType": guess_mime_from_url(url), "fileUri": url } }),
    }
}

fn user_parts(message: &ChatMessage) -> Vec<Value> {
    let Some(content) = message.content.as_ref() else {
        return Vec::new();
    };
    let mut parts = Vec::new();
    for part in content.parts() {
        match part {
            ContentPart::Text { text } => {
                if !text.is_empty() {
                    parts.push(json!({ "text": text }));
                }
            }
            ContentPart::ImageUrl { image_url } => parts.push(media_part(&image_url.url)),
            ContentPart::InputAudio { input_audio } => parts.push(json!({
                "inlineData": {
                    "mimeType": format!("audio/{}", input_audio.format),
                    "data": input_audio.data,
                }
            })),
            ContentPart::File { file } => {
                if let Some(url) = file
                    .get("file_data")
                    .or_else(|| file.get("file_id"))
                    .and_then(Value::as_str)
                {
                    parts.push(media_part(url));
                }
            }
        }
    }
    parts
}

/// Converts canonical messages into `(contents, systemInstruction)`.
pub(crate) fn convert_messages(messages: &[ChatMessage]) -> (Vec<Value>, Option<Value>) {
    let tool_names = tool_name_map(messages);
    let mut system = Vec::<String>::new();
    let mut contents = Vec::<Value>::new();

    for message in messages {
        let (role, parts) = match message.role {
            Role::System | Role::Developer => {
                let text = message.text();
                if !text.trim().is_empty() {
                    system.push(text);
                }
                continue;
            }
            Role::User => ("user", user_parts(message)),
            Role::Assistant => {
                let mut parts = Vec::new();
                let text = message.text();
                if !text.is_empty() {
                    parts.push(json!({ "text": text }));
                }
                for call in message.tool_calls.iter().flatten() {
                    let args = serde_json::from_str::<Value>(&call.function.arguments)
                        .unwrap_or_else(|_| json!({}));
                    parts.push(json!({
                        "functionCall": { "name": call.function.name, "args": args }
                    }));
                }
                ("model", parts)
            }
            Role::Tool | Role::Function => {
                let name = message
                    .tool_call_id
                    .as_ref()
                    .and_then(|id| tool_names.get(id).cloned())
                    .or_else(|| message.name.clone())
                    .unwrap_or_default();
                let text = message.text();
                let response = serde_json::from_str::<Value>(&text)
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| json!({ "content": text }));
                (
                    "user",
                    vec![json!({ "functionResponse": { "name": name, "response": response } })],
                )
            }
        };
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.get("role").and_then(Value::as_str) == Some(role) => {
                if let Some(existing) = last.get_mut("parts").and_then(Value::as_array_mut) {
                    existing.extend(parts);
                }
            }
            _ => contents.push(json!({ "role": role, "parts": parts })),
        }
    }

    let system_instruction = (!system.is_empty()).then(|| {
        json!({ "parts": system.iter().map(|text| json!({ "text": text })).collect::<Vec<_>>() })
    });
    (contents, system_instruction)
}

fn tool_to_gemini(tool: &Tool) -> Value {
    let mut out = Map::<String, Value>::new();
    out.insert("name".to_string(), Value::String(tool.function.name.clone()));
    out.insert(
        "description".to_string(),
        Value::String(tool.function.description.clone().unwrap_or_default()),
    );
    if let Some(parameters) = tool.function.parameters.clone() {
        out.insert("parameters".to_string(), strip_unsupported_schema_keys(parameters));
    }
    Value::Object(out)
}

/// Gemini rejects JSON-schema keywords outside its OpenAPI subset.
fn strip_unsupported_schema_keys(mut schema: Value) -> Value {
    if let Value::Object(map) = &mut schema {
        map.remove("$schema");
        map.remove("additionalProperties");
        map.remove("strict");
        for value in map.values_mut() {
            *value = strip_unsupported_schema_keys(value.take());
        }
    } else if let Value::Array(items) = &mut schema {
        for item in items.iter_mut() {
            *item = strip_unsupported_schema_keys(item.take());
        }
    }
    schema
}

fn tool_config(choice: &ToolChoice) -> Option<Value> {
    let config = match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => json!({ "functionCallingConfig": { "mode": "AUTO" } }),
            "none" => json!({ "functionCallingConfig": { "mode": "NONE" } }),
            "required" | "any" => json!({ "functionCallingConfig": { "mode": "ANY" } }),
            _ => return None,
        },
        ToolChoice::Function(function) => json!({
            "functionCallingConfig": {
                "mode": "ANY",
                "allowedFunctionNames": [function.function.name],
            }
        }),
    };
    Some(config)
}

fn generation_config(request: &ChatCompletionRequest) -> Map<String, Value> {
    let mut config = Map::<String, Value>::new();
    if let Some(max_tokens) = request.effective_max_tokens() {
        config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(stop) = request.stop.as_ref() {
        config.insert("stopSequences".to_string(), json!(stop.to_vec()));
    }
    if let Some(n) = request.n {
        config.insert("candidateCount".to_string(), json!(n));
    }
    if let Some(seed) = request.seed {
        config.insert("seed".to_string(), json!(seed));
    }
    if let Some(penalty) = request.presence_penalty {
        config.insert("presencePenalty".to_string(), json!(penalty));
    }
    if let Some(penalty) = request.frequency_penalty {
        config.insert("frequencyPenalty".to_string(), json!(penalty));
    }
    if let Some(format) = request.response_format.as_ref() {
        match format.get("type").and_then(Value::as_str) {
            Some("json_object") => {
                config.insert(
                    "responseMimeType".to_string(),
                    Value::String("application/json".to_string()),
                );
            }
            Some("json_schema") => {
                config.insert(
                    "responseMimeType".to_string(),
                    Value::String("application/json".to_string()),
                );
                if let Some(schema) = format.pointer("/json_schema/schema") {
                    config.insert(
                        "responseSchema".to_string(),
                        strip_unsupported_schema_keys(schema.clone()),
                    );
                }
            }
            _ => {}
        }
    }
    if let Some(modalities) = request.modalities.as_ref().filter(|m| !m.is_empty()) {
        let modalities = modalities
            .iter()
            .map(|modality| Value::String(modality.to_ascii_uppercase()))
            .collect();
        config.insert("responseModalities".to_string(), Value::Array(modalities));
    }
    config
}

pub(crate) fn build_generate_body(request: &ChatCompletionRequest) -> Result<Value, ProviderError> {
    let (contents, system_instruction) = convert_messages(&request.messages);
    if contents.is_empty() {
        return Err(ProviderError::bad_request(
            "gemini",
            "at least one non-system message is required",
        ));
    }
    let mut body = Map::<String, Value>::new();
    body.insert("contents".to_string(), Value::Array(contents));
    if let Some(system_instruction) = system_instruction {
        body.insert("systemInstruction".to_string(), system_instruction);
    }
    let config = generation_config(request);
    if !config.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(config));
    }
    if let Some(tools) = request.tools.as_ref().filter(|tools| !tools.is_empty()) {
        body.insert(
            "tools".to_string(),
            json!([{ "functionDeclarations": tools.iter().map(tool_to_gemini).collect::<Vec<_>>() }]),
        );
        if let Some(config) = request.tool_choice.as_ref().and_then(tool_config) {
            body.insert("toolConfig".to_string(), config);
        }
    }
    Ok(Value::Object(body))
}

pub(crate) fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> Option<&'static str> {
    let reason = reason?;
    Some(match reason {
        "STOP" if has_tool_calls => "tool_calls",
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY" => {
            "content_filter"
        }
        _ if has_tool_calls => "tool_calls",
        _ => "stop",
    })
}

fn parse_usage(value: &Value) -> Usage {
    let field = |name: &str| value.get(name).and_then(Value::as_u64).unwrap_or(0);
    let completion = field("candidatesTokenCount") + field("thoughtsTokenCount");
    let mut usage = Usage::new(field("promptTokenCount"), completion);
    let total = field("totalTokenCount");
    if total > 0 {
        usage.total_tokens = total;
    }
    let cached = field("cachedContentTokenCount");
    if cached > 0 {
        usage.extra.insert(
            "prompt_tokens_details".to_string(),
            json!({ "cached_tokens": cached }),
        );
    }
    usage
}

#[derive(Default)]
struct CandidateParts {
    text: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    images: Vec<Value>,
}

fn collect_parts(candidate: &Value) -> CandidateParts {
    let mut out = CandidateParts::default();
    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            if part.get("thought").and_then(Value::as_bool) == Some(true) {
                out.reasoning.push_str(text);
            } else {
                out.text.push_str(text);
            }
        } else if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            out.tool_calls.push(ToolCall {
                id: format!("call_{}", crate::utils::random_hex(12)),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.to_string(),
                    arguments: args.to_string(),
                },
            });
        } else if let Some(inline) = part.get("inlineData") {
            let mime = inline
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            out.images.push(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{mime};base64,{data}") }
            }));
        }
    }
    out
}

fn blocked_prompt(provider: &str, value: &Value) -> Option<ProviderError> {
    let reason = value
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)?;
    Some(
        ProviderError::new(
            provider,
            ErrorKind::ContentPolicy,
            format!("prompt was blocked: {reason}"),
        )
        .with_error_type(reason),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Value>,
    #[serde(default)]
    usage_metadata: Option<Value>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    response_id: Option<String>,
}

pub(crate) fn parse_generate_response(
    provider: &str,
    response: &UpstreamResponse,
) -> Result<ChatCompletionResponse, ProviderError> {
    let raw: Value = parse_json_body(provider, response)?;
    if let Some(err) = blocked_prompt(provider, &raw) {
        return Err(err);
    }
    let parsed: GenerateContentResponse = serde_json::from_value(raw)
        .map_err(|err| ProviderError::internal(provider, err.to_string()))?;

    let choices = parsed
        .candidates
        .iter()
        .enumerate()
        .map(|(position, candidate)| {
            let parts = collect_parts(candidate);
            let finish_reason = map_finish_reason(
                candidate.get("finishReason").and_then(Value::as_str),
                !parts.tool_calls.is_empty(),
            )
            .unwrap_or("stop");
            Choice {
                index: candidate
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|index| index as u32)
                    .unwrap_or(position as u32),
                message: ResponseMessage {
                    content: (!parts.text.is_empty() || parts.tool_calls.is_empty())
                        .then_some(parts.text),
                    tool_calls: (!parts.tool_calls.is_empty()).then_some(parts.tool_calls),
                    images: (!parts.images.is_empty()).then_some(parts.images),
                    reasoning_content: (!parts.reasoning.is_empty()).then_some(parts.reasoning),
                    ..ResponseMessage::default()
                },
                finish_reason: Some(finish_reason.to_string()),
                extra: Map::new(),
            }
        })
        .collect();

    Ok(ChatCompletionResponse {
        id: parsed
            .response_id
            .unwrap_or_else(|| format!("chatcmpl-{}", crate::utils::random_hex(12))),
        object: "chat.completion".to_string(),
        created: crate::types::unix_now(),
        model: parsed.model_version.unwrap_or_default(),
        choices,
        usage: parsed.usage_metadata.as_ref().map(parse_usage),
        extra: Map::new(),
    })
}

/// Each Gemini SSE event is a partial `GenerateContentResponse`.
pub(crate) fn parse_generate_event(provider: &str, data: &str) -> Result<StreamEvent, ProviderError> {
    let value = parse_json_value(provider, data)?;
    if let Some(err) = blocked_prompt(provider, &value) {
        return Err(err);
    }
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("gemini stream error");
        let status = error.get("code").and_then(Value::as_u64).unwrap_or(500) as u16;
        return Err(
            ProviderError::new(provider, ErrorKind::from_status(status), message).with_status(status),
        );
    }

    let mut choices = Vec::new();
    for (position, candidate) in value
        .get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
    {
        let parts = collect_parts(candidate);
        let has_tool_calls = !parts.tool_calls.is_empty();
        let tool_calls = has_tool_calls.then(|| {
            parts
                .tool_calls
                .into_iter()
                .enumerate()
                .map(|(index, call)| ToolCallDelta {
                    index: index as u32,
                    id: Some(call.id),
                    kind: Some(call.kind),
                    function: Some(FunctionCallDelta {
                        name: Some(call.function.name),
                        arguments: Some(call.function.arguments),
                    }),
                })
                .collect()
        });
        choices.push(ChunkChoice {
            index: candidate
                .get("index")
                .and_then(Value::as_u64)
                .map(|index| index as u32)
                .unwrap_or(position as u32),
            delta: ChunkDelta {
                content: (!parts.text.is_empty()).then_some(parts.text),
                tool_calls,
                images: (!parts.images.is_empty()).then_some(parts.images),
                reasoning_content: (!parts.reasoning.is_empty()).then_some(parts.reasoning),
                ..ChunkDelta::default()
            },
            finish_reason: map_finish_reason(
                candidate.get("finishReason").and_then(Value::as_str),
                has_tool_calls,
            )
            .map(str::to_string),
            extra: Map::new(),
        });
    }

    let usage = value.get("usageMetadata").map(parse_usage);
    if choices.is_empty() && usage.is_none() {
        return Ok(StreamEvent::skip());
    }
    let mut chunk = ChatCompletionChunk::new(choices);
    chunk.usage = usage;
    if let Some(id) = value.get("responseId").and_then(Value::as_str) {
        chunk.id = id.to_string();
    }
    if let Some(model) = value.get("modelVersion").and_then(Value::as_str) {
        chunk.model = model.to_string();
    }
    Ok(StreamEvent::chunk(chunk))
}

pub(crate) fn build_embed_body(request: &EmbeddingRequest, model: &str) -> Value {
    let model = model_path(model);
    let requests = request
        .input
        .texts()
        .into_iter()
        .map(|text| {
            let mut entry = json!({
                "model": model,
                "content": { "parts": [{ "text": text }] },
            });
            if let (Some(dimensions), Some(obj)) = (request.dimensions, entry.as_object_mut()) {
                obj.insert("outputDimensionality".to_string(), json!(dimensions));
            }
            entry
        })
        .collect::<Vec<_>>();
    json!({ "requests": requests })
}

pub(crate) fn parse_embed_response(
    provider: &str,
    response: &UpstreamResponse,
    model: &str,
) -> Result<EmbeddingResponse, ProviderError> {
    let raw: Value = parse_json_body(provider, response)?;
    let vectors = raw
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::internal(provider, "embedding response has no embeddings"))?
        .iter()
        .map(|embedding| {
            embedding
                .get("values")
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_f64)
                        .map(|v| v as f32)
                        .collect::<Vec<f32>>()
                })
                .unwrap_or_default()
        })
        .collect();
    Ok(EmbeddingResponse::from_vectors(model, vectors))
}

/// Google AI Studio (`generativelanguage.googleapis.com`), authenticated with an API key.
#[derive(Clone, Debug)]
pub struct Gemini {
    params: BTreeSet<String>,
}

impl Default for Gemini {
    fn default() -> Self {
        Self {
            params: supported_params(),
        }
    }
}

impl Gemini {
    fn base_url(credentials: &Credentials) -> String {
        credentials
            .api_base
            .clone()
            .filter(|base| !base.trim().is_empty())
            .or_else(|| env_var("GEMINI_API_BASE"))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    fn api_key(credentials: &Credentials) -> Result<String, ProviderError> {
        credentials
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| env_var("GEMINI_API_KEY"))
            .or_else(|| env_var("GOOGLE_API_KEY"))
            .ok_or_else(|| ProviderError::new("gemini", ErrorKind::Auth, "missing gemini api key"))
    }

    fn model_url(credentials: &Credentials, model: &str, method: &str) -> String {
        let base = Self::base_url(credentials);
        format!("{}/{}:{method}", base.trim_end_matches('/'), model_path(model))
    }
}

#[async_trait]
impl ProviderAdapter for Gemini {
    fn provider(&self) -> &str {
        "gemini"
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
        let body = build_generate_body(request)?;
        let key = Self::api_key(credentials)?;
        let stream = request.is_stream();
        let url = if stream {
            format!(
                "{}?alt=sse&key={key}",
                Self::model_url(credentials, model, "streamGenerateContent")
            )
        } else {
            format!("{}?key={key}", Self::model_url(credentials, model, "generateContent"))
        };
        Ok(UpstreamRequest::post_json(url, &body)
            .with_stream(stream)
            .with_headers(&credentials.extra_headers))
    }

    fn parse_response(
        &self,
        response: &UpstreamResponse,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        parse_generate_response(self.provider(), response)
    }

    fn parse_stream_event(&self, data: &str) -> Result<StreamEvent, ProviderError> {
        parse_generate_event(self.provider(), data)
    }

    async fn build_embedding_request(
        &self,
        request: &EmbeddingRequest,
        model: &str,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        let key = Self::api_key(credentials)?;
        let url = format!(
            "{}?key={key}",
            Self::model_url(credentials, model, "batchEmbedContents")
        );
        Ok(UpstreamRequest::post_json(url, &build_embed_body(request, model))
            .with_headers(&credentials.extra_headers))
    }

    fn parse_embedding_response(
        &self,
        response: &UpstreamResponse,
    ) -> Result<EmbeddingResponse, ProviderError> {
        parse_embed_response(self.provider(), response, "")
    }
}
