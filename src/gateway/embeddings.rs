use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use super::chat::{elapsed_ms, with_request_id};
use super::error::ApiError;
use super::keys::Caller;
use super::{DEPLOYMENT_HEADER, Gateway, REQUEST_ID_HEADER};
use crate::cache::CacheControl;
use crate::callbacks::{CallType, RequestEvent};
use crate::types::{EmbeddingRequest, EmbeddingResponse, Usage};

pub(crate) async fn embeddings(gateway: Arc<Gateway>, headers: HeaderMap, body: Bytes) -> Response {
    let started = Instant::now();
    let request_id = super::keys::extract_header(&headers, REQUEST_ID_HEADER)
        .unwrap_or_else(super::generate_request_id);
    let caller = match gateway.authenticate(&headers) {
        Ok(caller) => caller,
        Err(err) => return with_request_id(err.into_response(), &request_id),
    };
    let request: EmbeddingRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            let err = ApiError::bad_request(format!("invalid embedding request: {err}"));
            return with_request_id(err.into_response(), &request_id);
        }
    };

    let mut event = gateway.event(&request_id, CallType::Embedding, &request.model, &caller);
    match serve(&gateway, &request, &caller, &mut event).await {
        Ok(response) => {
            event.latency_ms = elapsed_ms(started);
            let deployment = event.deployment.clone();
            gateway.emit(event);
            let mut response = Json(response).into_response();
            if let Some(value) = deployment.and_then(|id| HeaderValue::from_str(&id).ok()) {
                response.headers_mut().insert(DEPLOYMENT_HEADER, value);
            }
            with_request_id(response, &request_id)
        }
        Err(err) => {
            event.error = Some(err.event_error());
            event.attempts = err.trail.clone();
            event.latency_ms = elapsed_ms(started);
            tracing::warn!(request_id = %request_id, model_group = %event.model_group, "embedding failed: {}", err.message);
            gateway.emit(event);
            with_request_id(err.into_response(), &request_id)
        }
    }
}

async fn serve(
    gateway: &Gateway,
    request: &EmbeddingRequest,
    caller: &Caller,
    event: &mut RequestEvent,
) -> Result<EmbeddingResponse, ApiError> {
    if request.input.texts().is_empty() {
        return Err(ApiError::bad_request("input must not be empty"));
    }
    if !caller.may_call(&request.model) {
        return Err(ApiError::forbidden_model(&request.model));
    }

    let control = CacheControl::from_extra(&request.extra);
    let cache_key = gateway
        .cache
        .as_ref()
        .and_then(|layer| layer.cache.embedding_key(&request.model, request));
    if let (Some(layer), Some(key), false) = (gateway.cache.as_ref(), cache_key.as_deref(), control.no_cache) {
        if let Some(hit) = layer.cache.lookup::<EmbeddingResponse>(key).await {
            event.cache_hit = true;
            event.usage = hit.usage.as_ref().map(|usage| Usage::new(usage.prompt_tokens, 0));
            return Ok(hit);
        }
    }

    let route = gateway.route_request(
        &request.model,
        Vec::new(),
        super::estimate_embedding_tokens(&request.model, request),
    );
    let routed = gateway
        .embedder
        .embed_request(&route, request)
        .await
        .map_err(|err| ApiError::from_router(&err, caller.privileged))?;

    event.deployment = Some(routed.deployment.id.clone());
    event.provider = Some(routed.deployment.provider.clone());
    event.attempts = routed.attempts;
    if let Some(usage) = &routed.value.usage {
        gateway
            .router
            .record_usage(&routed.deployment.id, usage.total_tokens);
        event.cost_usd = routed.deployment.cost_of(usage.prompt_tokens, 0);
        event.usage = Some(Usage::new(usage.prompt_tokens, 0));
    }
    if !control.no_store {
        if let (Some(layer), Some(key)) = (gateway.cache.as_ref(), cache_key.as_deref()) {
            layer.cache.store(key, &routed.value, control.ttl).await;
        }
    }
    Ok(routed.value)
}
