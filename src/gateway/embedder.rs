use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ErrorKind, ProviderError};
use crate::providers::{ProviderRegistry, Transport, execute_embedding};
use crate::router::{Embedder, RouteRequest, Router, RouterError};
use crate::types::{EmbeddingInput, EmbeddingRequest, EmbeddingResponse};

/// The gateway's own embedding path, called in-process. The auto-router and the
/// semantic cache embed through it so embedding models get the same routing,
/// retries and fallbacks as client traffic.
#[derive(Clone)]
pub struct GatewayEmbedder {
    router: Arc<Router>,
    registry: Arc<ProviderRegistry>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for GatewayEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayEmbedder").finish_non_exhaustive()
    }
}

impl GatewayEmbedder {
    pub fn new(
        router: Arc<Router>,
        registry: Arc<ProviderRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            router,
            registry,
            transport,
        }
    }

    pub async fn embed_request(
        &self,
        route: &RouteRequest,
        request: &EmbeddingRequest,
    ) -> Result<crate::router::Routed<EmbeddingResponse>, RouterError> {
        self.router
            .route(route, |deployment, timeout| {
                let registry = Arc::clone(&self.registry);
                let transport = Arc::clone(&self.transport);
                let request = request.clone();
                async move {
                    let adapter = registry.get(&deployment.provider).ok_or_else(|| {
                        ProviderError::internal(&deployment.provider, "provider is not registered")
                    })?;
                    execute_embedding(
                        adapter.as_ref(),
                        transport.as_ref(),
                        &request,
                        &deployment.model,
                        &deployment.credentials,
                        timeout.or(deployment.timeout),
                    )
                    .await
                }
            })
            .await
    }
}

#[async_trait]
impl Embedder for GatewayEmbedder {
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let request = EmbeddingRequest::new(model, EmbeddingInput::Many(texts.to_vec()));
        let routed = self
            .embed_request(&RouteRequest::new(model), &request)
            .await
            .map_err(|err| match err.provider_error() {
                Some(provider) => provider.clone(),
                None => ProviderError::new("gateway", err.kind(), err.to_string()),
            })?;
        let vectors = routed.value.vectors();
        if vectors.len() != texts.len() {
            return Err(ProviderError::new(
                &routed.deployment.provider,
                ErrorKind::Upstream5xx,
                format!("expected {} embeddings, got {}", texts.len(), vectors.len()),
            ));
        }
        Ok(vectors)
    }
}
