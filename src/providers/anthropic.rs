use std::collections::BTreeSet;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{
    Credentials, ProviderAdapter, StreamEvent, UpstreamRequest, UpstreamResponse,
    default_map_params, join_url, parse_json_body, parse_json_value, split_data_url,
};
use crate::error::{ErrorKind, ProviderError};
use crate::types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ChunkChoice, ChunkDelta, ContentPart, FunctionCall, FunctionCallDelta, MessageContent,
    ResponseMessage, Role, ToolCall, ToolCallDelta, ToolChoice, Usage,
};
use crate::utils::env::env_var;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

const SUPPORTED_PARAMS: &[&str] = &[
    "max_tokens",
    "max_completion_tokens",
    "temperature",
    "top_p",
    "stop",
    "tools",
    "tool_choice",
    "user",
    "response_format",
];

#[derive(Clone, Debug)]
pub struct Anthropic {
    version: String,
    params: BTreeSet<String>,
}

impl Default for Anthropic {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            params: SUPPORTED_PARAMS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl Anthropic {
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    fn base_url(credentials: &Credentials) -> String {
        credentials
            .api_base
            .clone()
            .filter(|base| !base.trim().is_empty())
            .or_else(|| env_var("ANTHROPIC_API_BASE"))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    fn messages_url(credentials: &Credentials) -> String {
        let base = Self::base_url(credentials);
        let base = base.trim_end_matches('/');
        if base.ends_with("/messages") {
            base.to_string()
        } else if base.ends_with("/v1") {
            format!("{base}/messages")
        } else {
            format!("{base}/v1/messages")
        }
    }

    fn auth_headers(&self, credentials: &Credentials) -> Result<Vec<(String, String)>, ProviderError> {
        let api_key = credentials
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| env_var("ANTHROPIC_API_KEY"))
            .ok_or_else(|| {
                ProviderError::new("anthropic", ErrorKind::Auth, "missing anthropic api key")
            })?;
        let mut headers = vec![
            ("x-api-key".to_string(), api_key),
            ("anthropic-version".to_string(), self.version.clone()),
        ];
        for (name, value) in &credentials.extra_headers {
            headers.push((name.to_ascii_lowercase(), value.clone()));
        }
        Ok(headers)
    }
}

fn tool_to_anthropic(tool: &crate::types::Tool) -> Value {
    let mut out = Map::<String, Value>::new();
    out.insert("name".to_string(), Value::String(tool.function.name.clone()));
    if let Some(description) = &tool.function.description {
        out.insert(
            "description".to_string(),
            Value::String(description.clone()),
        );
    }
    out.insert(
        "input_schema".to_string(),
        tool.function
            .parameters
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
    );
    Value::Object(out)
}

fn tool_choice_to_anthropic(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "auto" => Some(json!({ "type": "auto" })),
            "required" | "any" => Some(json!({ "type": "any" })),
            "none" => Some(json!({ "type": "none" })),
            _ => None,
        },
        ToolChoice::Function(function) => {
            Some(json!({ "type": "tool", "name": function.function.name }))
        }
    }
}

fn image_block(url: &str) -> Value {
    match split_data_url(url) {
        Some((media_type, data)) => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data }
        }),
        None => json!({ "type": "image", "source": { "type": "url", "url": url } }),
    }
}

fn content_blocks(content: Option<&MessageContent>) -> Vec<Value> {
    let Some(content) = content else {
        return Vec::new();
    };
    let mut blocks = Vec::new();
    for part in content.parts() {
        match part {
            ContentPart::Text { text } => {
                if !text.is_empty() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
            }
            ContentPart::ImageUrl { image_url } => blocks.push(image_block(&image_url.url)),
            ContentPart::File { file } => {
                if let Some((media_type, data)) = file
                    .get("file_data")
                    .and_then(Value::as_str)
                    .and_then(split_data_url)
                {
                    blocks.push(json!({
                        "type": "document",
                        "source": { "type": "base64", "media_type": media_type, "data": data }
                    }));
                }
            }
            ContentPart::InputAudio { .. } => {}
        }
    }
    blocks
}

fn message_to_blocks(message: &ChatMessage) -> Option<(&'static str, Vec<Value>)> {
    match message.role {
        Role::System | Role::Developer => None,
        Role::User => {
            let blocks = content_blocks(message.content.as_ref());
            (!blocks.is_empty()).then_some(("user", blocks))
        }
        Role::Assistant => {
            let mut blocks = content_blocks(message.content.as_ref());
            for call in message.tool_calls.iter().flatten() {
                let input = serde_json::from_str::<Value>(&call.function.arguments)
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| json!({}));
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.function.name,
                    "input": input,
                }));
            }
            (!blocks.is_empty()).then_some(("assistant", blocks))
        }
        Role::Tool | Role::Function => {
            let tool_use_id = message
                .tool_call_id
                .clone()
                .or_else(|| message.name.clone())
                .unwrap_or_default();
            Some((
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": message.text(),
                })],
            ))
        }
    }
}

/// Converts canonical messages into `(system, messages)`; adjacent same-role turns merge.
pub(crate) fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system = Vec::<String>::new();
    let mut out = Vec::<(&'static str, Vec<Value>)>::new();
    for message in messages {
        if message.role.is_system_like() {
            let text = message.text();
            if !text.trim().is_empty() {
                system.push(text);
            }
            continue;
        }
        let Some((role, blocks)) = message_to_blocks(message) else {
            continue;
        };
        match out.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => out.push((role, blocks)),
        }
    }
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    let messages = out
        .into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect();
    (system, messages)
}

pub(crate) fn stop_reason_to_finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "end_turn" | "stop_sequence" | "pause_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" | "content_filtered" => "content_filter",
        _ => "stop",
    }
}

fn parse_usage(value: &Value) -> Usage {
    let field = |name: &str| value.get(name).and_then(Value::as_u64).unwrap_or(0);
    let prompt = field("input_tokens")
        + field("cache_creation_input_tokens")
        + field("cache_read_input_tokens");
    let mut usage = Usage::new(prompt, field("output_tokens"));
    let cache_read = field("cache_read_input_tokens");
    if cache_read > 0 {
        usage.extra.insert(
            "prompt_tokens_details".to_string(),
            json!({ "cached_tokens": cache_read }),
        );
    }
    usage
}

#[derive(Debug, Deserialize)]
struct MessagesApiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Value>,
}

fn stream_error(value: &Value) -> ProviderError {
    let error_type = value
        .pointer("/error/type")
        .and_then(Value::as_str)
        .unwrap_or("api_error");
    let message = value
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("anthropic stream error");
    let kind = match error_type {
        "rate_limit_error" => ErrorKind::RateLimit,
        "overloaded_error" | "api_error" => ErrorKind::Upstream5xx,
        "authentication_error" | "permission_error" => ErrorKind::Auth,
        "invalid_request_error" => ErrorKind::BadRequest,
        _ => ErrorKind::Upstream5xx,
    };
    ProviderError::new("anthropic", kind, message).with_error_type(error_type)
}

fn delta_chunk(index: u32, delta: ChunkDelta) -> ChatCompletionChunk {
    ChatCompletionChunk::new(vec![ChunkChoice {
        index,
        delta,
        ..ChunkChoice::default()
    }])
}

#[async_trait]
impl ProviderAdapter for Anthropic {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn supported_params(&self) -> Option<&BTreeSet<String>> {
        Some(&self.params)
    }

    fn map_params(&self, params: Map<String, Value>) -> Map<String, Value> {
        let mut params = default_map_params(params, self.supported_params(), false);
        if let Some(stop) = params.remove("stop") {
            let sequences = match stop {
                Value::String(one) => vec![Value::String(one)],
                Value::Array(many) => many,
                _ => Vec::new(),
            };
            params.insert("stop_sequences".to_string(), Value::Array(sequences));
        }
        if let Some(temperature) = params.get("temperature").and_then(Value::as_f64) {
            if let Some(clamped) = serde_json::Number::from_f64(temperature.clamp(0.0, 1.0)) {
                params.insert("temperature".to_string(), Value::Number(clamped));
            }
        }
        if let Some(user) = params.remove("user") {
            params.insert("metadata".to_string(), json!({ "user_id": user }));
        }
        params
    }

    async fn build_request(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        let mut body = self.map_params(request.to_params());
        body.remove("messages");
        body.remove("tools");
        body.remove("tool_choice");
        body.remove("response_format");

        let (system, messages) = convert_messages(&request.messages);
        if messages.is_empty() {
            return Err(ProviderError::bad_request(
                "anthropic",
                "at least one non-system message is required",
            ));
        }
        body.insert("model".to_string(), Value::String(model.to_string()));
        body.insert("messages".to_string(), Value::Array(messages));
        let mut system = system;
        if let Some(format) = request.response_format.as_ref() {
            if let Some(schema) = format.pointer("/json_schema/schema") {
                let instruction = format!("Respond only with JSON matching this schema: {schema}");
                system = Some(match system {
                    Some(existing) => format!("{existing}\n\n{instruction}"),
                    None => instruction,
                });
            }
        }
        if let Some(system) = system {
            body.insert("system".to_string(), Value::String(system));
        }
        if !body.contains_key("max_tokens") {
            body.insert(
                "max_tokens".to_string(),
                json!(request.effective_max_tokens().unwrap_or(DEFAULT_MAX_TOKENS)),
            );
        }
        let tool_choice = request.tool_choice.as_ref();
        let tools_disabled =
            matches!(tool_choice, Some(ToolChoice::Mode(mode)) if mode == "none");
        if let Some(tools) = request.tools.as_ref().filter(|tools| !tools.is_empty()) {
            if !tools_disabled {
                body.insert(
                    "tools".to_string(),
                    Value::Array(tools.iter().map(tool_to_anthropic).collect()),
                );
                if let Some(choice) = tool_choice.and_then(tool_choice_to_anthropic) {
                    body.insert("tool_choice".to_string(), choice);
                }
            }
        }
        let stream = request.is_stream();
        if stream {
            body.insert("stream".to_string(), Value::Bool(true));
        }

        let mut upstream =
            UpstreamRequest::post_json(Self::messages_url(credentials), &Value::Object(body))
                .with_stream(stream);
        for (name, value) in self.auth_headers(credentials)? {
            upstream = upstream.with_header(name, value);
        }
        Ok(upstream)
    }

    fn parse_response(
        &self,
        response: &UpstreamResponse,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let parsed: MessagesApiResponse = parse_json_body(self.provider(), response)?;
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut tool_calls = Vec::<ToolCall>::new();
        for block in &parsed.content {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(chunk) = block.get("text").and_then(Value::as_str) {
                        text.push_str(chunk);
                    }
                }
                Some("thinking") => {
                    if let Some(chunk) = block.get("thinking").and_then(Value::as_str) {
                        reasoning.push_str(chunk);
                    }
                }
                Some("tool_use") => {
                    let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                    let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    tool_calls.push(ToolCall {
                        id: id.to_string(),
                        kind: "function".to_string(),
                        function: FunctionCall {
                            name: name.to_string(),
                            arguments: input.to_string(),
                        },
                    });
                }
                _ => {}
            }
        }

        let finish_reason = parsed
            .stop_reason
            .as_deref()
            .map(stop_reason_to_finish_reason)
            .unwrap_or("stop");
        Ok(ChatCompletionResponse {
            id: parsed.id,
            object: "chat.completion".to_string(),
            created: crate::types::unix_now(),
            model: parsed.model,
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    content: (!text.is_empty() || tool_calls.is_empty()).then_some(text),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    ..ResponseMessage::default()
                },
                finish_reason: Some(finish_reason.to_string()),
                extra: Map::new(),
            }],
            usage: parsed.usage.as_ref().map(parse_usage),
            extra: Map::new(),
        })
    }

    fn parse_stream_event(&self, data: &str) -> Result<StreamEvent, ProviderError> {
        let value = parse_json_value(self.provider(), data)?;
        let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
        match event_type {
            "message_start" => {
                let mut chunk = delta_chunk(
                    0,
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        content: Some(String::new()),
                        ..ChunkDelta::default()
                    },
                );
                if let Some(id) = value.pointer("/message/id").and_then(Value::as_str) {
                    chunk.id = id.to_string();
                }
                if let Some(model) = value.pointer("/message/model").and_then(Value::as_str) {
                    chunk.model = model.to_string();
                }
                Ok(StreamEvent::chunk(chunk))
            }
            "content_block_start" => {
                let block = value.get("content_block").cloned().unwrap_or(Value::Null);
                if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                    return Ok(StreamEvent::skip());
                }
                let index = value.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                Ok(StreamEvent::chunk(delta_chunk(
                    0,
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: block.get("id").and_then(Value::as_str).map(str::to_string),
                            kind: Some("function".to_string()),
                            function: Some(FunctionCallDelta {
                                name: block.get("name").and_then(Value::as_str).map(str::to_string),
                                arguments: Some(String::new()),
                            }),
                        }]),
                        ..ChunkDelta::default()
                    },
                )))
            }
            "content_block_delta" => {
                let index = value.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let delta = value.get("delta").cloned().unwrap_or(Value::Null);
                let text_of = |key: &str| delta.get(key).and_then(Value::as_str).map(str::to_string);
                let chunk_delta = match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => ChunkDelta {
                        content: text_of("text"),
                        ..ChunkDelta::default()
                    },
                    Some("thinking_delta") => ChunkDelta {
                        reasoning_content: text_of("thinking"),
                        ..ChunkDelta::default()
                    },
                    Some("input_json_delta") => ChunkDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: None,
                            kind: None,
                            function: Some(FunctionCallDelta {
                                name: None,
                                arguments: text_of("partial_json"),
                            }),
                        }]),
                        ..ChunkDelta::default()
                    },
                    _ => return Ok(StreamEvent::skip()),
                };
                Ok(StreamEvent::chunk(delta_chunk(0, chunk_delta)))
            }
            "message_delta" => {
                let stop_reason = value
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                    .map(stop_reason_to_finish_reason)
                    .unwrap_or("stop");
                let mut chunk = ChatCompletionChunk::finish(stop_reason);
                chunk.usage = value.get("usage").map(parse_usage);
                Ok(StreamEvent::chunk(chunk))
            }
            "message_stop" => Ok(StreamEvent::done()),
            "error" => Err(stream_error(&value)),
            _ => Ok(StreamEvent::skip()),
        }
    }

    async fn build_passthrough(
        &self,
        path_and_query: &str,
        body: Bytes,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        let url = join_url(&Self::base_url(credentials), path_and_query);
        let mut upstream = UpstreamRequest::post_json(url, &Value::Null);
        upstream.body = body;
        for (name, value) in self.auth_headers(credentials)? {
            upstream = upstream.with_header(name, value);
        }
        Ok(upstream)
    }
}
