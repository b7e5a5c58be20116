//! Request fingerprints. Volatile and identity fields never enter the hash.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::types::{ChatCompletionRequest, EmbeddingRequest, GATEWAY_ONLY_PARAMS};
use crate::utils::hex_encode;

const VOLATILE_PARAMS: &[&str] = &["model", "stream", "stream_options", "user"];

/// SHA-256 hex over the model group and the canonical request body.
pub fn chat_cache_key(group: &str, request: &ChatCompletionRequest) -> String {
    let mut params = strip(request.to_params());
    if let Some(Value::Array(messages)) = params.get_mut("messages") {
        for message in messages.iter_mut() {
            normalize_message(message);
        }
    }
    fingerprint("chat", group, &Value::Object(params))
}

pub fn embedding_cache_key(group: &str, request: &EmbeddingRequest) -> String {
    let params = match serde_json::to_value(request) {
        Ok(Value::Object(map)) => strip(map),
        _ => Map::new(),
    };
    fingerprint("embedding", group, &Value::Object(params))
}

/// Fingerprint of everything but the messages: the model group, sampling
/// params and tool schemas. Semantic entries only match within one scope.
pub fn semantic_scope(group: &str, request: &ChatCompletionRequest) -> String {
    let mut params = strip(request.to_params());
    params.remove("messages");
    fingerprint("semantic", group, &Value::Object(params))
}

/// Text of every message, one per line. Semantic caches key on this.
pub fn prompt_text(request: &ChatCompletionRequest) -> String {
    request
        .messages
        .iter()
        .map(|message| message.text())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip(mut params: Map<String, Value>) -> Map<String, Value> {
    for name in VOLATILE_PARAMS.iter().chain(GATEWAY_ONLY_PARAMS) {
        params.remove(*name);
    }
    params.retain(|_, value| !value.is_null());
    params
}

fn normalize_message(message: &mut Value) {
    let Some(obj) = message.as_object_mut() else {
        return;
    };
    obj.retain(|_, value| !value.is_null());
    match obj.get_mut("content") {
        Some(Value::String(text)) => *text = text.trim().to_string(),
        Some(Value::Array(parts)) => {
            for part in parts {
                if let Some(Value::String(text)) = part.get_mut("text") {
                    *text = text.trim().to_string();
                }
            }
        }
        _ => {}
    }
}

fn fingerprint(kind: &str, group: &str, body: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(body, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0]);
    hasher.update(group.as_bytes());
    hasher.update([0]);
    hasher.update(canonical.as_bytes());
    hex_encode(&hasher.finalize())
}

/// JSON with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;
    use serde_json::json;

    fn request(value: Value) -> ChatCompletionRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn volatile_fields_and_whitespace_do_not_change_the_key() {
        let a = request(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello "}],
            "temperature": 0.2,
            "stream": true,
            "user": "alice",
            "metadata": {"request_id": "r1"}
        }));
        let b = request(json!({
            "model": "gpt-4o",
            "temperature": 0.2,
            "messages": [{"role": "user", "content": " Hello"}],
            "api_key": "sk-secret"
        }));
        assert_eq!(chat_cache_key("g", &a), chat_cache_key("g", &b));
        assert_eq!(chat_cache_key("g", &a).len(), 64);
    }

    #[test]
    fn sampling_params_tools_and_group_change_the_key() {
        let base = ChatCompletionRequest::new("gpt-4o", vec![ChatMessage::user("hi")]);
        let mut hotter = base.clone();
        hotter.temperature = Some(0.9);
        let mut with_tools = base.clone();
        with_tools.tools = Some(vec![serde_json::from_value(json!({
            "type": "function",
            "function": {"name": "lookup", "parameters": {"type": "object"}}
        }))
        .unwrap()]);
        let key = chat_cache_key("g", &base);
        assert_ne!(key, chat_cache_key("g", &hotter));
        assert_ne!(key, chat_cache_key("g", &with_tools));
        assert_ne!(key, chat_cache_key("other", &base));
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let mut out = String::new();
        write_canonical(&json!({"b": {"y": 1, "x": [2, {"d": 1, "c": 0}]}, "a": "s"}), &mut out);
        assert_eq!(out, r#"{"a":"s","b":{"x":[2,{"c":0,"d":1}],"y":1}}"#);
    }

    #[test]
    fn prompt_text_joins_message_text() {
        let request = ChatCompletionRequest::new(
            "m",
            vec![ChatMessage::system("be brief "), ChatMessage::user(" What is TCP?")],
        );
        assert_eq!(prompt_text(&request), "be brief\nWhat is TCP?");
    }
}
