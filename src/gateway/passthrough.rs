use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use super::chat::{elapsed_ms, with_request_id};
use super::error::ApiError;
use super::keys::extract_header;
use super::{DEPLOYMENT_HEADER, Gateway, REQUEST_ID_HEADER};
use crate::callbacks::CallType;

/// `path` plus the original query string, as sent to the provider.
fn upstream_path(path: &str, uri: &Uri) -> String {
    let path = format!("/{}", path.trim_start_matches('/'));
    match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    }
}

/// Forwards `POST /v1/{provider}/{path}` to the provider unchanged, with the
/// credentials of that provider's first configured deployment.
pub(crate) async fn passthrough(
    gateway: Arc<Gateway>,
    provider: String,
    path: String,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let request_id = extract_header(&headers, REQUEST_ID_HEADER).unwrap_or_else(super::generate_request_id);
    let caller = match gateway.authenticate(&headers) {
        Ok(caller) => caller,
        Err(err) => return with_request_id(err.into_response(), &request_id),
    };
    let mut event = gateway.event(&request_id, CallType::PassThrough, &provider, &caller);

    let result = async {
        let deployment = gateway.router.deployment_for_provider(&provider).ok_or_else(|| {
            ApiError::bad_request(format!("no deployment is configured for provider {provider}"))
        })?;
        let adapter = gateway
            .adapter(&provider)
            .map_err(|err| ApiError::from_provider(&err))?;
        let upstream = adapter
            .build_passthrough(&upstream_path(&path, &uri), body, &deployment.credentials)
            .await
            .map_err(|err| ApiError::from_provider(&err))?;
        let reply = gateway
            .transport()
            .send(upstream, deployment.timeout)
            .await
            .map_err(|err| ApiError::from_provider(&err))?;
        Ok::<_, ApiError>((deployment, reply))
    }
    .await;

    event.latency_ms = elapsed_ms(started);
    match result {
        Ok((deployment, reply)) => {
            event.deployment = Some(deployment.id.clone());
            event.provider = Some(deployment.provider.clone());
            tracing::debug!(
                request_id = %request_id,
                provider = %provider,
                status = reply.status,
                "pass-through request forwarded"
            );
            gateway.emit(event);
            let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = HeaderValue::from_str(reply.content_type()).ok();
            let mut response = (status, Body::from(reply.body)).into_response();
            if let Some(value) = content_type {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            if let Ok(value) = HeaderValue::from_str(&deployment.id) {
                response.headers_mut().insert(DEPLOYMENT_HEADER, value);
            }
            with_request_id(response, &request_id)
        }
        Err(err) => {
            event.error = Some(err.event_error());
            tracing::warn!(request_id = %request_id, provider = %provider, "pass-through failed: {}", err.message);
            gateway.emit(event);
            with_request_id(err.into_response(), &request_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_query_string() {
        let uri: Uri = "/v1/anthropic/v1/messages?beta=true".parse().unwrap();
        assert_eq!(upstream_path("v1/messages", &uri), "/v1/messages?beta=true");
        let uri: Uri = "/v1/anthropic/v1/messages".parse().unwrap();
        assert_eq!(upstream_path("/v1/messages", &uri), "/v1/messages");
    }
}
