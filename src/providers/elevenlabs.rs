//! ElevenLabs text-to-speech. Chat is not offered.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{
    Credentials, ProviderAdapter, StreamEvent, UpstreamRequest, UpstreamResponse, join_url,
};
use crate::error::{ErrorKind, ProviderError};
use crate::types::{ChatCompletionRequest, ChatCompletionResponse, MediaOperation, MediaPayload};
use crate::utils::env::env_var;

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_OUTPUT_FORMAT: &str = "mp3_44100_128";

/// OpenAI `response_format` values mapped onto ElevenLabs output formats.
fn output_format(response_format: Option<&str>) -> &'static str {
    match response_format {
        Some("pcm") => "pcm_44100",
        Some("opus") => "opus_48000_128",
        Some("ulaw") => "ulaw_8000",
        _ => DEFAULT_OUTPUT_FORMAT,
    }
}

#[derive(Clone, Debug, Default)]
pub struct ElevenLabs;

#[async_trait]
impl ProviderAdapter for ElevenLabs {
    fn provider(&self) -> &str {
        "elevenlabs"
    }

    fn supported_params(&self) -> Option<&BTreeSet<String>> {
        None
    }

    async fn build_request(
        &self,
        _request: &ChatCompletionRequest,
        _model: &str,
        _credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        Err(ProviderError::unsupported(self.provider(), "chat completions"))
    }

    fn parse_response(
        &self,
        _response: &UpstreamResponse,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        Err(ProviderError::unsupported(self.provider(), "chat completions"))
    }

    fn parse_stream_event(&self, _data: &str) -> Result<StreamEvent, ProviderError> {
        Err(ProviderError::unsupported(self.provider(), "chat completions"))
    }

    async fn build_media_request(
        &self,
        operation: MediaOperation,
        payload: &MediaPayload,
        model: &str,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        if operation != MediaOperation::Speech {
            return Err(ProviderError::unsupported(self.provider(), operation.as_str()));
        }
        let text = payload
            .json_field("input")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::bad_request(self.provider(), "speech input is required"))?;
        let voice = payload
            .json_field("voice")
            .and_then(Value::as_str)
            .filter(|voice| !voice.trim().is_empty())
            .ok_or_else(|| ProviderError::bad_request(self.provider(), "speech voice is required"))?;
        let format = output_format(payload.json_field("response_format").and_then(Value::as_str));

        let api_key = credentials
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| env_var("ELEVENLABS_API_KEY"))
            .ok_or_else(|| {
                ProviderError::new(self.provider(), ErrorKind::Auth, "missing elevenlabs api key")
            })?;
        let base = credentials
            .api_base
            .clone()
            .filter(|base| !base.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let url = format!(
            "{}?output_format={format}",
            join_url(&base, &format!("v1/text-to-speech/{voice}"))
        );

        let mut body = json!({ "text": text, "model_id": model });
        if let Some(speed) = payload.json_field("speed").and_then(Value::as_f64) {
            body["voice_settings"] = json!({ "speed": speed });
        }
        Ok(UpstreamRequest::post_json(url, &body)
            .with_header("xi-api-key", api_key)
            .with_headers(&credentials.extra_headers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn speech_payload() -> MediaPayload {
        let mut map = Map::new();
        map.insert("model".to_string(), json!("eleven_multilingual_v2"));
        map.insert("input".to_string(), json!("Hello there"));
        map.insert("voice".to_string(), json!("21m00Tcm4TlvDq8ikWAM"));
        map.insert("response_format".to_string(), json!("pcm"));
        MediaPayload::Json(map)
    }

    #[tokio::test]
    async fn speech_uses_voice_path_and_xi_api_key() {
        let upstream = ElevenLabs
            .build_media_request(
                MediaOperation::Speech,
                &speech_payload(),
                "eleven_multilingual_v2",
                &Credentials {
                    api_key: Some("xi".to_string()),
                    ..Credentials::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            upstream.url,
            "https://api.elevenlabs.io/v1/text-to-speech/21m00Tcm4TlvDq8ikWAM?output_format=pcm_44100"
        );
        assert_eq!(upstream.headers["xi-api-key"], "xi");
        let body = upstream.body_json().unwrap();
        assert_eq!(body["text"], "Hello there");
        assert_eq!(body["model_id"], "eleven_multilingual_v2");
    }

    #[tokio::test]
    async fn chat_and_transcription_are_unsupported() {
        let err = ElevenLabs
            .build_media_request(
                MediaOperation::Transcription,
                &speech_payload(),
                "m",
                &Credentials::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }
}
