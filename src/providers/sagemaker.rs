//! SageMaker real-time endpoints: OpenAI messages body, SigV4-signed, no upstream streaming.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    Credentials, ProviderAdapter, StreamEvent, StreamMode, UpstreamRequest, UpstreamResponse,
    default_map_params, parse_json_body,
};
use crate::auth::{SigV4Signer, SigV4Timestamp};
use crate::error::{ErrorKind, ProviderError};
use crate::types::{ChatCompletionRequest, ChatCompletionResponse};

const SERVICE: &str = "sagemaker";

#[derive(Debug, Default)]
pub struct SageMaker {
    signer: Option<SigV4Signer>,
}

impl SageMaker {
    /// Uses a fixed signer instead of reading AWS credentials from the environment.
    pub fn with_signer(signer: SigV4Signer) -> Self {
        Self {
            signer: Some(signer),
        }
    }

    fn signer(&self, credentials: &Credentials) -> Result<SigV4Signer, ProviderError> {
        if let Some(signer) = self.signer.clone() {
            return Ok(signer);
        }
        SigV4Signer::from_env(credentials.region.as_deref(), SERVICE)
            .map_err(|err| err.into_provider_error(self.provider()))
    }

    fn invocations_url(credentials: &Credentials, region: &str, endpoint: &str) -> String {
        match credentials.api_base.as_ref().filter(|base| !base.trim().is_empty()) {
            Some(base) => format!(
                "{}/endpoints/{endpoint}/invocations",
                base.trim_end_matches('/')
            ),
            None => format!(
                "https://runtime.sagemaker.{region}.amazonaws.com/endpoints/{endpoint}/invocations"
            ),
        }
    }
}

#[async_trait]
impl ProviderAdapter for SageMaker {
    fn provider(&self) -> &str {
        "sagemaker"
    }

    fn supported_params(&self) -> Option<&BTreeSet<String>> {
        None
    }

    fn stream_mode(&self) -> StreamMode {
        StreamMode::Synthesized
    }

    async fn build_request(
        &self,
        request: &ChatCompletionRequest,
        model: &str,
        credentials: &Credentials,
    ) -> Result<UpstreamRequest, ProviderError> {
        let mut body = default_map_params(request.to_params(), None, false);
        body.remove("stream");
        body.remove("stream_options");
        body.insert("model".to_string(), Value::String(model.to_string()));

        let signer = self.signer(credentials)?;
        let url = Self::invocations_url(credentials, signer.region(), model);
        let mut upstream = UpstreamRequest::post_json(url, &Value::Object(body))
            .with_headers(&credentials.extra_headers);

        let timestamp =
            SigV4Timestamp::now().map_err(|err| err.into_provider_error(self.provider()))?;
        let signed = signer
            .sign(
                upstream.method.as_str(),
                &upstream.url,
                &upstream.headers,
                &upstream.body,
                timestamp,
            )
            .map_err(|err| err.into_provider_error(self.provider()))?;
        signed.headers.apply(&mut upstream.headers);
        Ok(upstream)
    }

    fn parse_response(
        &self,
        response: &UpstreamResponse,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let raw: Value = parse_json_body(self.provider(), response)?;
        if raw.get("choices").is_some() {
            return serde_json::from_value(raw)
                .map_err(|err| ProviderError::internal(self.provider(), err.to_string()));
        }

        // Text Generation Inference containers answer `[{"generated_text": ...}]`.
        let generated = match &raw {
            Value::Array(items) => items.first().and_then(|item| item.get("generated_text")),
            other => other.get("generated_text"),
        }
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ProviderError::new(
                self.provider(),
                ErrorKind::Internal,
                "sagemaker response has neither choices nor generated_text",
            )
        })?;

        let mut response = ChatCompletionResponse::synthetic("", generated);
        response.usage = None;
        Ok(response)
    }

    fn parse_stream_event(&self, _data: &str) -> Result<StreamEvent, ProviderError> {
        Err(ProviderError::unsupported(self.provider(), "upstream streaming"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;
    use serde_json::json;

    fn adapter() -> SageMaker {
        SageMaker::with_signer(
            SigV4Signer::new("AKIDEXAMPLE", "secret", None, "us-west-2", SERVICE).unwrap(),
        )
    }

    #[tokio::test]
    async fn signs_invocations_for_the_endpoint() {
        let mut request = ChatCompletionRequest::new("my-endpoint", vec![ChatMessage::user("hi")]);
        request.stream = Some(true);
        let upstream = adapter()
            .build_request(&request, "my-endpoint", &Credentials::default())
            .await
            .unwrap();
        assert_eq!(
            upstream.url,
            "https://runtime.sagemaker.us-west-2.amazonaws.com/endpoints/my-endpoint/invocations"
        );
        assert!(upstream.headers["authorization"].starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(upstream.headers["authorization"].contains("/us-west-2/sagemaker/aws4_request"));
        assert!(upstream.headers.contains_key("x-amz-date"));
        let body = upstream.body_json().unwrap();
        assert!(body.get("stream").is_none());
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn parses_openai_and_tgi_shapes() {
        let openai = UpstreamResponse::json(
            200,
            &json!({
                "id": "x", "object": "chat.completion", "created": 1, "model": "m",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hey"}, "finish_reason": "stop"}]
            }),
        );
        assert_eq!(adapter().parse_response(&openai).unwrap().first_content(), Some("hey"));

        let tgi = UpstreamResponse::json(200, &json!([{"generated_text": "plain"}]));
        assert_eq!(adapter().parse_response(&tgi).unwrap().first_content(), Some("plain"));
    }

    #[test]
    fn streams_are_synthesized() {
        assert_eq!(adapter().stream_mode(), StreamMode::Synthesized);
    }
}
