use bytes::Bytes;
use serde_json::{Map, Value};

use crate::utils::multipart::MultipartPart;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaOperation {
    ImageGeneration,
    Speech,
    Transcription,
}

impl MediaOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImageGeneration => "image_generation",
            Self::Speech => "speech",
            Self::Transcription => "transcription",
        }
    }

    /// Path below `/v1` used by OpenAI-compatible upstreams.
    pub fn openai_path(self) -> &'static str {
        match self {
            Self::ImageGeneration => "images/generations",
            Self::Speech => "audio/speech",
            Self::Transcription => "audio/transcriptions",
        }
    }
}

/// Body of a media request: JSON for images and speech, multipart for transcription.
#[derive(Clone, Debug)]
pub enum MediaPayload {
    Json(Map<String, Value>),
    Multipart(Vec<MultipartPart>),
}

impl MediaPayload {
    pub fn model(&self) -> Option<String> {
        match self {
            Self::Json(map) => map.get("model").and_then(Value::as_str).map(str::to_string),
            Self::Multipart(parts) => parts
                .iter()
                .find(|part| part.name == "model")
                .map(|part| String::from_utf8_lossy(&part.data).trim().to_string()),
        }
    }

    /// Replaces the model field, or removes it when `model` is `None`.
    pub fn set_model(&mut self, model: Option<&str>) {
        match self {
            Self::Json(map) => match model {
                Some(model) => {
                    map.insert("model".to_string(), Value::String(model.to_string()));
                }
                None => {
                    map.remove("model");
                }
            },
            Self::Multipart(parts) => {
                parts.retain(|part| part.name != "model");
                if let Some(model) = model {
                    parts.push(MultipartPart::text("model", model));
                }
            }
        }
    }

    pub fn json_field(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Json(map) => map.get(key),
            Self::Multipart(_) => None,
        }
    }
}

/// Upstream media bytes returned to the caller unchanged.
#[derive(Clone, Debug)]
pub struct MediaResponse {
    pub content_type: String,
    pub body: Bytes,
}

impl MediaResponse {
    pub fn json(value: &Value) -> Self {
        Self {
            content_type: "application/json".to_string(),
            body: Bytes::from(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn multipart_model_is_rewritten() {
        let mut payload = MediaPayload::Multipart(vec![
            MultipartPart::text("model", "whisper"),
            MultipartPart::text("language", "en"),
        ]);
        payload.set_model(Some("whisper-1"));
        assert_eq!(payload.model().as_deref(), Some("whisper-1"));
    }

    #[test]
    fn json_model_can_be_removed() {
        let Value::Object(map) = json!({"model": "dall-e-3", "prompt": "a cat"}) else {
            unreachable!()
        };
        let mut payload = MediaPayload::Json(map);
        payload.set_model(None);
        assert_eq!(payload.model(), None);
        assert_eq!(payload.json_field("prompt"), Some(&json!("a cat")));
    }
}
