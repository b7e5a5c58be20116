//! Route table for the ingress.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use super::Gateway;
use crate::callbacks::CountersSnapshot;
use crate::router::ModelListing;
use crate::types::MediaOperation;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    cache: String,
    db: &'static str,
    counters: CountersSnapshot,
}

#[derive(Debug, Serialize)]
struct ModelObject {
    id: String,
    object: &'static str,
    owned_by: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    alias_for: Option<String>,
}

#[derive(Debug, Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelObject>,
}

impl From<ModelListing> for ModelObject {
    fn from(listing: ModelListing) -> Self {
        Self {
            id: listing.id,
            object: "model",
            owned_by: "tianji",
            alias_for: listing.alias_for,
        }
    }
}

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/liveliness", get(health))
        .route("/health/readiness", get(readiness))
        .route("/v1/models", get(models))
        .route("/models", get(models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/embeddings", post(embeddings))
        .route("/v1/images/generations", post(image_generations))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/audio/transcriptions", post(audio_transcriptions))
        .route("/v1/:provider/*path", post(passthrough))
        .with_state(gateway)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn readiness(State(gateway): State<Arc<Gateway>>) -> Response {
    let (ready, cache) = match gateway.cache() {
        None => (true, "not_configured".to_string()),
        Some(layer) => match layer.cache.ping().await {
            Ok(()) => (true, format!("connected ({})", layer.cache.backend().name())),
            Err(err) => {
                tracing::warn!(backend = layer.cache.backend().name(), "cache ping failed: {err}");
                (false, format!("unreachable: {err}"))
            }
        },
    };
    let body = ReadinessResponse {
        status: if ready { "healthy" } else { "unhealthy" },
        cache,
        db: "not_configured",
        counters: gateway.counters().snapshot(),
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn models(State(gateway): State<Arc<Gateway>>, headers: HeaderMap) -> Response {
    if let Err(err) = gateway.authenticate(&headers) {
        return err.into_response();
    }
    Json(ModelList {
        object: "list",
        data: gateway
            .router()
            .list_models()
            .into_iter()
            .map(ModelObject::from)
            .collect(),
    })
    .into_response()
}

async fn chat_completions(State(gateway): State<Arc<Gateway>>, headers: HeaderMap, body: Bytes) -> Response {
    super::chat::chat_completions(gateway, headers, body).await
}

async fn embeddings(State(gateway): State<Arc<Gateway>>, headers: HeaderMap, body: Bytes) -> Response {
    super::embeddings::embeddings(gateway, headers, body).await
}

async fn image_generations(State(gateway): State<Arc<Gateway>>, headers: HeaderMap, body: Bytes) -> Response {
    super::media::media(gateway, MediaOperation::ImageGeneration, headers, body).await
}

async fn audio_speech(State(gateway): State<Arc<Gateway>>, headers: HeaderMap, body: Bytes) -> Response {
    super::media::media(gateway, MediaOperation::Speech, headers, body).await
}

async fn audio_transcriptions(State(gateway): State<Arc<Gateway>>, headers: HeaderMap, body: Bytes) -> Response {
    super::media::media(gateway, MediaOperation::Transcription, headers, body).await
}

async fn passthrough(
    State(gateway): State<Arc<Gateway>>,
    Path((provider, path)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    super::passthrough::passthrough(gateway, provider, path, uri, headers, body).await
}
