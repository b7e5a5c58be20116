use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;

use super::{UpstreamRequest, UpstreamResponse};
use crate::error::{ErrorKind, ProviderError};
use crate::utils::sse::{SseError, sse_data_stream_from_response};

pub type SseStream = BoxStream<'static, Result<String, SseError>>;

const MAX_RESPONSE_BODY_BYTES: usize = 64 * 1024 * 1024;

pub enum StreamingReply {
    Events(SseStream),
    /// Upstream answered with a non-2xx status before streaming.
    Failed(UpstreamResponse),
}

/// Executes upstream requests. The gateway uses [`ReqwestTransport`]; tests may substitute their own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: UpstreamRequest,
        timeout: Option<Duration>,
    ) -> Result<UpstreamResponse, ProviderError>;

    async fn send_streaming(
        &self,
        request: UpstreamRequest,
        timeout: Option<Duration>,
    ) -> Result<StreamingReply, ProviderError>;
}

#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl ReqwestTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.http
    }

    fn builder(&self, request: UpstreamRequest) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(request.method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.body(request.body)
    }
}

pub(crate) fn classify_reqwest_error(err: &reqwest::Error) -> ProviderError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_builder() {
        ErrorKind::BadRequest
    } else {
        ErrorKind::TransientNetwork
    };
    ProviderError::new("transport", kind, err.to_string())
}

fn timeout_error(timeout: Duration) -> ProviderError {
    ProviderError::new(
        "transport",
        ErrorKind::Timeout,
        format!("upstream did not respond within {}ms", timeout.as_millis()),
    )
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.insert(name.as_str().to_string(), value.to_string());
        }
    }
    out
}

async fn read_body(response: reqwest::Response) -> Result<UpstreamResponse, ProviderError> {
    let status = response.status().as_u16();
    let headers = collect_headers(response.headers());
    let mut body = Vec::<u8>::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| classify_reqwest_error(&err))?;
        if body.len().saturating_add(chunk.len()) > MAX_RESPONSE_BODY_BYTES {
            return Err(ProviderError::new(
                "transport",
                ErrorKind::Internal,
                format!("response exceeded max bytes ({MAX_RESPONSE_BODY_BYTES})"),
            ));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(UpstreamResponse {
        status,
        headers,
        body: body.into(),
    })
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: UpstreamRequest,
        timeout: Option<Duration>,
    ) -> Result<UpstreamResponse, ProviderError> {
        let exchange = async {
            let response = self
                .builder(request)
                .send()
                .await
                .map_err(|err| classify_reqwest_error(&err))?;
            read_body(response).await
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| timeout_error(timeout))?,
            None => exchange.await,
        }
    }

    async fn send_streaming(
        &self,
        request: UpstreamRequest,
        timeout: Option<Duration>,
    ) -> Result<StreamingReply, ProviderError> {
        // The deadline bounds time-to-first-byte only; the body may stream longer.
        let send = self.builder(request).send();
        let response = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, send)
                .await
                .map_err(|_| timeout_error(timeout))?,
            None => send.await,
        }
        .map_err(|err| classify_reqwest_error(&err))?;

        if !response.status().is_success() {
            return Ok(StreamingReply::Failed(read_body(response).await?));
        }
        Ok(StreamingReply::Events(sse_data_stream_from_response(response)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use httpmock::{Method::POST, MockServer};

    fn request(url: String) -> UpstreamRequest {
        UpstreamRequest {
            method: reqwest::Method::POST,
            url,
            headers: BTreeMap::from([("x-test".to_string(), "1".to_string())]),
            body: Bytes::from_static(b"{}"),
            stream: false,
        }
    }

    #[tokio::test]
    async fn forwards_headers_and_returns_body() {
        if crate::utils::test_support::should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/echo").header("x-test", "1");
                then.status(201)
                    .header("retry-after", "3")
                    .body("created");
            })
            .await;

        let response = ReqwestTransport::default()
            .send(request(server.url("/echo")), None)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(response.status, 201);
        assert_eq!(response.header("Retry-After"), Some("3"));
        assert_eq!(response.body.as_ref(), b"created");
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        if crate::utils::test_support::should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/slow");
                then.status(200).delay(Duration::from_millis(500)).body("late");
            })
            .await;

        let err = ReqwestTransport::default()
            .send(request(server.url("/slow")), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn streaming_failure_returns_error_body() {
        if crate::utils::test_support::should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/stream");
                then.status(429).body(r#"{"error":{"message":"slow down"}}"#);
            })
            .await;

        let reply = ReqwestTransport::default()
            .send_streaming(request(server.url("/stream")), None)
            .await
            .unwrap();
        let StreamingReply::Failed(response) = reply else {
            panic!("expected failure reply");
        };
        assert_eq!(response.status, 429);
    }
}
