use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::{Map, Value};

use super::chat::{elapsed_ms, with_request_id};
use super::error::ApiError;
use super::keys::{Caller, extract_header};
use super::{DEPLOYMENT_HEADER, Gateway, REQUEST_ID_HEADER};
use crate::callbacks::{CallType, RequestEvent};
use crate::providers::execute_media;
use crate::types::{MediaOperation, MediaPayload, MediaResponse};
use crate::utils::multipart::parse_multipart_form;

fn call_type(operation: MediaOperation) -> CallType {
    match operation {
        MediaOperation::ImageGeneration => CallType::ImageGeneration,
        MediaOperation::Speech => CallType::Speech,
        MediaOperation::Transcription => CallType::Transcription,
    }
}

/// JSON bodies for image generation and speech, multipart for transcription.
fn parse_payload(operation: MediaOperation, headers: &HeaderMap, body: &Bytes) -> Result<MediaPayload, ApiError> {
    match operation {
        MediaOperation::Transcription => {
            let content_type = extract_header(headers, header::CONTENT_TYPE.as_str()).unwrap_or_default();
            parse_multipart_form(&content_type, body)
                .map(MediaPayload::Multipart)
                .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))
        }
        MediaOperation::ImageGeneration | MediaOperation::Speech => {
            serde_json::from_slice::<Map<String, Value>>(body)
                .map(MediaPayload::Json)
                .map_err(|err| ApiError::bad_request(format!("invalid {} request: {err}", operation.as_str())))
        }
    }
}

pub(crate) async fn media(
    gateway: Arc<Gateway>,
    operation: MediaOperation,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let request_id = extract_header(&headers, REQUEST_ID_HEADER).unwrap_or_else(super::generate_request_id);
    let caller = match gateway.authenticate(&headers) {
        Ok(caller) => caller,
        Err(err) => return with_request_id(err.into_response(), &request_id),
    };
    let payload = match parse_payload(operation, &headers, &body) {
        Ok(payload) => payload,
        Err(err) => return with_request_id(err.into_response(), &request_id),
    };
    let Some(model) = payload.model().filter(|model| !model.is_empty()) else {
        let err = ApiError::bad_request("model is required");
        return with_request_id(err.into_response(), &request_id);
    };

    let mut event = gateway.event(&request_id, call_type(operation), &model, &caller);
    let result = serve(&gateway, operation, &payload, &model, &caller, &mut event).await;
    event.latency_ms = elapsed_ms(started);
    match result {
        Ok(reply) => {
            let deployment = event.deployment.clone();
            gateway.emit(event);
            let mut response = Response::new(Body::from(reply.body));
            if let Ok(value) = HeaderValue::from_str(&reply.content_type) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            if let Some(value) = deployment.and_then(|id| HeaderValue::from_str(&id).ok()) {
                response.headers_mut().insert(DEPLOYMENT_HEADER, value);
            }
            with_request_id(response, &request_id)
        }
        Err(err) => {
            event.error = Some(err.event_error());
            event.attempts = err.trail.clone();
            tracing::warn!(
                request_id = %request_id,
                operation = operation.as_str(),
                model_group = %model,
                "media request failed: {}",
                err.message
            );
            gateway.emit(event);
            with_request_id(err.into_response(), &request_id)
        }
    }
}

async fn serve(
    gateway: &Gateway,
    operation: MediaOperation,
    payload: &MediaPayload,
    model: &str,
    caller: &Caller,
    event: &mut RequestEvent,
) -> Result<MediaResponse, ApiError> {
    if !caller.may_call(model) {
        return Err(ApiError::forbidden_model(model));
    }
    let route = gateway.route_request(model, Vec::new(), 0);
    let routed = gateway
        .router
        .route(&route, |deployment, timeout| {
            let adapter = gateway.adapter(&deployment.provider);
            let transport = Arc::clone(gateway.transport());
            async move {
                let adapter = adapter?;
                execute_media(
                    adapter.as_ref(),
                    transport.as_ref(),
                    operation,
                    payload,
                    &deployment.model,
                    &deployment.credentials,
                    timeout.or(deployment.timeout),
                )
                .await
            }
        })
        .await
        .map_err(|err| ApiError::from_router(&err, caller.privileged))?;
    event.deployment = Some(routed.deployment.id.clone());
    event.provider = Some(routed.deployment.provider.clone());
    event.attempts = routed.attempts;
    Ok(routed.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_payloads_keep_their_model() {
        let body = Bytes::from_static(br#"{"model":"dall-e","prompt":"a cat"}"#);
        let payload = parse_payload(MediaOperation::ImageGeneration, &HeaderMap::new(), &body).unwrap();
        assert_eq!(payload.model().as_deref(), Some("dall-e"));
    }

    #[test]
    fn transcription_requires_multipart() {
        let body = Bytes::from_static(b"{}");
        let err = parse_payload(MediaOperation::Transcription, &HeaderMap::new(), &body).unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }
}
