use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::unix_now;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
    Tool,
    Function,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Developer => "developer",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Function => "function",
        }
    }

    pub fn is_system_like(self) -> bool {
        matches!(self, Self::System | Self::Developer)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputAudio {
    pub data: String,
    pub format: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    InputAudio { input_audio: InputAudio },
    File { file: Value },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of every text part.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    if let ContentPart::Text { text } = part {
                        out.push_str(text);
                    }
                }
                out
            }
        }
    }

    pub fn parts(&self) -> Vec<ContentPart> {
        match self {
            Self::Text(text) => vec![ContentPart::Text { text: text.clone() }],
            Self::Parts(parts) => parts.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn default_tool_type() -> String {
    "function".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(text.into())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, text)
        }
    }

    pub fn text(&self) -> String {
        self.content.as_ref().map(MessageContent::text).unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(one) => vec![one.clone()],
            Self::Many(many) => many.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_usage: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolChoiceFunctionName {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    #[serde(rename = "type", default = "default_tool_type")]
    pub kind: String,
    pub function: ToolChoiceFunctionName,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Function(ToolChoiceFunction),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Self::default()
        }
    }

    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// `max_completion_tokens` wins over the legacy `max_tokens` when both are set.
    pub fn effective_max_tokens(&self) -> Option<u32> {
        self.max_completion_tokens.or(self.max_tokens)
    }

    /// Request tags from `tags` or `metadata.tags`.
    pub fn tags(&self) -> Vec<String> {
        let from_value = |value: &Value| -> Vec<String> {
            value
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let mut tags = self.extra.get("tags").map(from_value).unwrap_or_default();
        if let Some(metadata_tags) = self
            .extra
            .get("metadata")
            .and_then(|metadata| metadata.get("tags"))
        {
            for tag in from_value(metadata_tags) {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
            }
        }
        tags
    }

    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(ChatMessage::text)
    }

    /// Every parameter as a JSON object, gateway-only keys included.
    pub fn to_params(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            extra: Map::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default = "default_assistant_role")]
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ResponseMessage {
    fn default() -> Self {
        Self {
            role: default_assistant_role(),
            content: None,
            tool_calls: None,
            images: None,
            reasoning_content: None,
            extra: Map::new(),
        }
    }
}

fn default_assistant_role() -> String {
    "assistant".to_string()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_completion_object")]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_completion_object() -> String {
    "chat.completion".to_string()
}

impl ChatCompletionResponse {
    /// A single-choice assistant reply produced by the gateway itself.
    pub fn synthetic(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", crate::utils::random_hex(12)),
            object: default_completion_object(),
            created: unix_now(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    content: Some(content.into()),
                    ..ResponseMessage::default()
                },
                finish_reason: Some("stop".to_string()),
                extra: Map::new(),
            }],
            usage: Some(Usage::default()),
            extra: Map::new(),
        }
    }

    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
    }

    /// Everything post-call guardrails inspect: each choice's content, then
    /// every tool call as `name arguments`, one per line.
    pub fn output_text(&self) -> String {
        let mut lines = Vec::new();
        for choice in &self.choices {
            if let Some(content) = choice.message.content.as_deref().filter(|c| !c.is_empty()) {
                lines.push(content.to_string());
            }
            for call in choice.message.tool_calls.iter().flatten() {
                lines.push(format!("{} {}", call.function.name, call.function.arguments));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Default)]
struct ChoiceParts {
    role: Option<String>,
    content: Option<String>,
    reasoning: Option<String>,
    tool_calls: BTreeMap<u32, ToolCall>,
    images: Vec<Value>,
    finish_reason: Option<String>,
}

/// Folds `chat.completion.chunk`s back into the completion they stream.
///
/// Tool-call deltas merge by index: the first id/name wins and argument
/// fragments concatenate.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    choices: BTreeMap<u32, ChoiceParts>,
    usage: Option<Usage>,
}

impl ChunkAccumulator {
    pub fn push(&mut self, chunk: &ChatCompletionChunk) {
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }
        for choice in &chunk.choices {
            let parts = self.choices.entry(choice.index).or_default();
            let delta = &choice.delta;
            if parts.role.is_none() {
                parts.role.clone_from(&delta.role);
            }
            if let Some(content) = &delta.content {
                parts.content.get_or_insert_with(String::new).push_str(content);
            }
            if let Some(reasoning) = &delta.reasoning_content {
                parts.reasoning.get_or_insert_with(String::new).push_str(reasoning);
            }
            for call in delta.tool_calls.iter().flatten() {
                let slot = parts.tool_calls.entry(call.index).or_insert_with(|| ToolCall {
                    id: String::new(),
                    kind: default_tool_type(),
                    function: FunctionCall {
                        name: String::new(),
                        arguments: String::new(),
                    },
                });
                if slot.id.is_empty() {
                    if let Some(id) = &call.id {
                        slot.id.clone_from(id);
                    }
                }
                if let Some(kind) = &call.kind {
                    slot.kind.clone_from(kind);
                }
                if let Some(function) = &call.function {
                    if slot.function.name.is_empty() {
                        if let Some(name) = &function.name {
                            slot.function.name.clone_from(name);
                        }
                    }
                    if let Some(arguments) = &function.arguments {
                        slot.function.arguments.push_str(arguments);
                    }
                }
            }
            if let Some(images) = &delta.images {
                parts.images.extend(images.iter().cloned());
            }
            if choice.finish_reason.is_some() {
                parts.finish_reason.clone_from(&choice.finish_reason);
            }
        }
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    pub fn to_response(&self, id: &str, created: u64, model: &str) -> ChatCompletionResponse {
        let mut choices: Vec<Choice> = self
            .choices
            .iter()
            .map(|(index, parts)| {
                let tool_calls: Vec<ToolCall> = parts.tool_calls.values().cloned().collect();
                Choice {
                    index: *index,
                    message: ResponseMessage {
                        role: parts.role.clone().unwrap_or_else(default_assistant_role),
                        content: parts.content.clone(),
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                        images: (!parts.images.is_empty()).then(|| parts.images.clone()),
                        reasoning_content: parts.reasoning.clone(),
                        extra: Map::new(),
                    },
                    finish_reason: Some(parts.finish_reason.clone().unwrap_or_else(|| "stop".to_string())),
                    extra: Map::new(),
                }
            })
            .collect();
        if choices.is_empty() {
            choices.push(Choice {
                message: ResponseMessage {
                    content: Some(String::new()),
                    ..ResponseMessage::default()
                },
                finish_reason: Some("stop".to_string()),
                ..Choice::default()
            });
        }
        ChatCompletionResponse {
            id: id.to_string(),
            object: default_completion_object(),
            created,
            model: model.to_string(),
            choices,
            usage: self.usage.clone(),
            extra: Map::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCallDelta>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

impl ChatCompletionChunk {
    pub fn new(choices: Vec<ChunkChoice>) -> Self {
        Self {
            id: String::new(),
            object: default_chunk_object(),
            created: 0,
            model: String::new(),
            choices,
            usage: None,
            extra: Map::new(),
        }
    }

    pub fn text_delta(text: impl Into<String>) -> Self {
        Self::new(vec![ChunkChoice {
            delta: ChunkDelta {
                content: Some(text.into()),
                ..ChunkDelta::default()
            },
            ..ChunkChoice::default()
        }])
    }

    pub fn finish(finish_reason: impl Into<String>) -> Self {
        Self::new(vec![ChunkChoice {
            finish_reason: Some(finish_reason.into()),
            ..ChunkChoice::default()
        }])
    }

    pub fn usage_only(usage: Usage) -> Self {
        let mut chunk = Self::new(Vec::new());
        chunk.usage = Some(usage);
        chunk
    }

    /// Whether any choice carries a finish reason that ends the stream.
    pub fn is_terminal(&self) -> bool {
        self.choices.iter().any(|choice| {
            choice
                .finish_reason
                .as_deref()
                .is_some_and(finish_reason_is_terminal)
        })
    }
}

pub fn finish_reason_is_terminal(reason: &str) -> bool {
    matches!(
        reason,
        "stop" | "length" | "content_filter" | "tool_calls" | "function_call"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_keeps_unknown_fields_in_extra() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "metadata": {"tags": ["production"]},
            "logit_bias": {"50256": -100}
        }))
        .unwrap();
        assert!(request.extra.contains_key("logit_bias"));
        assert_eq!(request.tags(), vec!["production".to_string()]);
    }

    #[test]
    fn structured_content_parts_parse() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "what is "},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}},
                {"type": "text", "text": "this?"}
            ]
        }))
        .unwrap();
        assert_eq!(message.text(), "what is this?");
        let Some(MessageContent::Parts(parts)) = &message.content else {
            panic!("expected parts");
        };
        assert!(matches!(parts[1], ContentPart::ImageUrl { .. }));
    }

    #[test]
    fn assistant_message_with_null_content_and_tool_calls() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{}"}}]
        }))
        .unwrap();
        assert!(message.content.is_none());
        assert_eq!(message.tool_calls.unwrap()[0].function.name, "f");
    }

    #[test]
    fn response_round_trips_unknown_fields() {
        let raw = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o",
            "system_fingerprint": "fp_1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hi!", "refusal": null}, "logprobs": null, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        });
        let parsed: ChatCompletionResponse = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&parsed).unwrap(), raw);
    }

    #[test]
    fn accumulator_merges_tool_call_fragments_per_choice() {
        let chunks: Vec<ChatCompletionChunk> = [
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "tool_calls": [
                {"index": 0, "id": "call_a", "type": "function", "function": {"name": "get_weather", "arguments": "{\"city\":"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"Paris\"}"}},
                {"index": 1, "id": "call_b", "function": {"name": "get_time", "arguments": "{}"}}
            ]}}, {"index": 1, "delta": {"content": "second"}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"},
                               {"index": 1, "delta": {}, "finish_reason": "stop"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}}),
        ]
        .into_iter()
        .map(|raw| serde_json::from_value(raw).unwrap())
        .collect();
        let mut acc = ChunkAccumulator::default();
        for chunk in &chunks {
            acc.push(chunk);
        }
        let response = acc.to_response("chatcmpl-x", 9, "gpt-4o");
        assert_eq!(response.choices.len(), 2);
        let first = &response.choices[0];
        assert_eq!(first.finish_reason.as_deref(), Some("tool_calls"));
        assert!(first.message.content.is_none());
        let calls = first.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, r#"{"city":"Paris"}"#);
        assert_eq!(calls[1].function.name, "get_time");
        assert_eq!(response.choices[1].message.content.as_deref(), Some("second"));
        assert_eq!(response.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn output_text_includes_tool_call_arguments() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": null, "tool_calls": [
                {"id": "call_1", "type": "function", "function": {"name": "send", "arguments": "{\"to\":\"x\"}"}}
            ]}, "finish_reason": "tool_calls"}]
        }))
        .unwrap();
        assert_eq!(response.output_text(), r#"send {"to":"x"}"#);
    }

    #[test]
    fn terminal_finish_reasons() {
        assert!(ChatCompletionChunk::finish("stop").is_terminal());
        assert!(ChatCompletionChunk::finish("tool_calls").is_terminal());
        assert!(!ChatCompletionChunk::text_delta("x").is_terminal());
    }
}
