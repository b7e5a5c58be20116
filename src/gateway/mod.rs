//! The OpenAI-compatible ingress: per-request pipeline, HTTP surface and the
//! background tasks that keep caches, policies and health state fresh.

mod chat;
pub mod embedder;
mod embeddings;
pub mod error;
pub mod http;
pub mod keys;
mod media;
#[cfg(feature = "otel")]
pub mod otel;
mod passthrough;
pub mod telemetry;
#[cfg(feature = "tokenizer")]
pub mod token_count;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::memory::DEFAULT_SWEEP_INTERVAL;
use crate::cache::{CacheLayer, SingleFlight};
use crate::callbacks::{BuiltCallbacks, Counters, RequestEvent, SpendLedger, build_callbacks};
use crate::config::{ConfigError, ProxyConfig};
use crate::error::ProviderError;
use crate::policy::engine::{DEFAULT_RELOAD_INTERVAL, load_policy_file, spawn_policy_reload};
use crate::policy::{GuardrailRegistry, PolicyContext, PolicyEngine};
use crate::providers::{ProviderAdapter, ProviderRegistry, ProvidersFile, ReqwestTransport, Transport};
use crate::router::{AutoRouters, RouteRequest, Router};
use crate::types::{ChatCompletionRequest, EmbeddingRequest};

pub use embedder::GatewayEmbedder;
pub use error::{ApiError, AttemptSummary};
pub use http::router;
pub use keys::{Caller, KeyRegistry};
pub use telemetry::init_logging;

pub const HEALTH_PRUNE_INTERVAL: Duration = Duration::from_secs(60);
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);
pub const DEPLOYMENT_HEADER: &str = "x-tianji-deployment";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("tianji-{}-{seq}", crate::utils::unix_millis())
}

/// Startup inputs beyond the proxy config.
#[derive(Clone, Default)]
pub struct GatewayOptions {
    pub providers_json: Option<PathBuf>,
    /// Replaces the inline `policies`/`policy_attachments` and is re-read periodically.
    pub policies_path: Option<PathBuf>,
    pub http: Option<reqwest::Client>,
    pub transport: Option<Arc<dyn Transport>>,
}

/// Shared request-handling state, built once at startup.
pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    transport: Arc<dyn Transport>,
    router: Arc<Router>,
    embedder: Arc<GatewayEmbedder>,
    cache: Option<CacheLayer>,
    chat_flights: SingleFlight<chat::ChatOutcome>,
    policies: Arc<PolicyEngine>,
    policies_path: Option<PathBuf>,
    auto_routers: AutoRouters,
    callbacks: BuiltCallbacks,
    keys: KeyRegistry,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("router", &self.router)
            .field("providers", &self.registry)
            .field("cache", &self.cache.as_ref().map(|layer| layer.cache.backend().name()))
            .field("callbacks", &self.callbacks.set.names())
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub async fn from_config(config: ProxyConfig, options: GatewayOptions) -> crate::Result<Self> {
        let http = options.http.unwrap_or_default();

        let mut registry = ProviderRegistry::new(http.clone());
        if let Some(path) = &options.providers_json {
            let profiles = ProvidersFile::load(path)?.into_profiles()?;
            tracing::info!(path = %path.display(), providers = profiles.len(), "loaded providers file");
            registry = registry.with_profiles(profiles);
        }
        let registry = Arc::new(registry);

        let groups = config.model_groups(&registry)?;
        let router = Arc::new(Router::new(groups, config.effective_router_settings())?);
        let transport: Arc<dyn Transport> = options
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new(http.clone())));
        let embedder = Arc::new(GatewayEmbedder::new(
            Arc::clone(&router),
            Arc::clone(&registry),
            Arc::clone(&transport),
        ));

        let cache = config
            .cache_params()
            .map(|params| params.build(&http, Some(embedder.clone() as Arc<dyn crate::router::Embedder>)))
            .transpose()?;

        let guardrails = Arc::new(GuardrailRegistry::from_configs(&config.guardrails, &http)?);
        let policy_config = match &options.policies_path {
            Some(path) => load_policy_file(path).await?,
            None => config.policy_config(),
        };
        let policies = Arc::new(PolicyEngine::new(guardrails, policy_config)?);

        let settings = &config.tianji_settings;
        let callbacks = build_callbacks(&settings.callbacks, &settings.callback_configs, &http)
            .map_err(ConfigError::Invalid)?;
        let auto_routers = AutoRouters::new(settings.auto_router.clone());
        let keys = KeyRegistry::new(config.master_key(), &config.general_settings.keys);
        if keys.is_open() {
            tracing::warn!("no master_key or keys configured; every request is accepted");
        }

        tracing::info!(
            models = router.list_models().len(),
            cache = cache.as_ref().map(|layer| layer.cache.backend().name()).unwrap_or("off"),
            callbacks = ?callbacks.set.names(),
            "gateway ready"
        );

        Ok(Self {
            registry,
            transport,
            router,
            embedder,
            cache,
            chat_flights: SingleFlight::default(),
            policies,
            policies_path: options.policies_path,
            auto_routers,
            callbacks,
            keys,
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn policies(&self) -> &Arc<PolicyEngine> {
        &self.policies
    }

    pub fn cache(&self) -> Option<&CacheLayer> {
        self.cache.as_ref()
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.callbacks.counters
    }

    pub fn spend(&self) -> Option<&Arc<SpendLedger>> {
        self.callbacks.spend.as_ref()
    }

    pub fn embedder(&self) -> &Arc<GatewayEmbedder> {
        &self.embedder
    }

    /// Starts the periodic tasks. Each stops when `cancel` fires; join the handles
    /// on shutdown.
    pub fn spawn_background_tasks(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(memory) = self.cache.as_ref().and_then(|layer| layer.memory.as_ref()) {
            handles.push(memory.spawn_sweeper(DEFAULT_SWEEP_INTERVAL, cancel.child_token()));
        }
        if let Some(path) = &self.policies_path {
            handles.push(spawn_policy_reload(
                Arc::clone(&self.policies),
                path.clone(),
                DEFAULT_RELOAD_INTERVAL,
                cancel.child_token(),
            ));
        }
        if let Some(alerts) = &self.callbacks.alerts {
            handles.push(crate::callbacks::spawn_alert_pruner(
                Arc::clone(alerts),
                crate::callbacks::alerts::PRUNE_INTERVAL,
                cancel.child_token(),
            ));
        }
        handles.push(spawn_health_pruner(
            Arc::clone(&self.router),
            HEALTH_PRUNE_INTERVAL,
            cancel.child_token(),
        ));
        handles
    }

    pub(crate) fn authenticate(&self, headers: &HeaderMap) -> Result<Caller, ApiError> {
        let token = keys::extract_bearer(headers);
        self.keys
            .authenticate(token.as_deref())
            .ok_or_else(ApiError::unauthorized)
    }

    pub(crate) fn adapter(&self, provider: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.registry
            .get(provider)
            .ok_or_else(|| ProviderError::internal(provider, "provider is not registered"))
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Route request for `model` with the overall deadline applied.
    pub(crate) fn route_request(&self, model: &str, tags: Vec<String>, estimated_tokens: u64) -> RouteRequest {
        let mut route = RouteRequest::new(model)
            .with_tags(tags)
            .with_estimated_tokens(estimated_tokens);
        if let Some(timeout) = self.router.settings().request_timeout() {
            route = route.with_deadline(Instant::now() + timeout);
        }
        route
    }

    pub(crate) fn policy_context(&self, caller: &Caller, model: &str, tags: &[String]) -> PolicyContext {
        let mut all_tags = caller.tags.clone();
        for tag in tags {
            if !all_tags.contains(tag) {
                all_tags.push(tag.clone());
            }
        }
        let mut ctx = PolicyContext::new(model).with_tags(all_tags);
        if let Some(team) = &caller.team_id {
            ctx = ctx.with_team(team.clone());
        }
        if let Some(key) = &caller.key_id {
            ctx = ctx.with_key(key.clone());
        }
        ctx
    }

    pub(crate) fn event(
        &self,
        request_id: &str,
        call_type: crate::callbacks::CallType,
        model: &str,
        caller: &Caller,
    ) -> RequestEvent {
        let mut event = RequestEvent::new(request_id, call_type, model);
        event.key_id = caller.key_id.clone();
        event.team_id = caller.team_id.clone();
        event
    }

    pub(crate) fn emit(&self, event: RequestEvent) {
        self.callbacks.set.emit(event);
    }
}

/// Prompt tokens counted against `tpm` limits before dispatch.
pub(crate) fn estimate_chat_tokens(model: &str, request: &ChatCompletionRequest) -> u64 {
    #[cfg(feature = "tokenizer")]
    {
        token_count::count_chat_tokens(model, request)
    }
    #[cfg(not(feature = "tokenizer"))]
    {
        let _ = model;
        let chars: usize = request.messages.iter().map(|message| message.text().len()).sum();
        (chars as u64).div_ceil(4)
    }
}

pub(crate) fn estimate_embedding_tokens(model: &str, request: &EmbeddingRequest) -> u64 {
    #[cfg(feature = "tokenizer")]
    {
        token_count::count_embedding_tokens(model, request)
    }
    #[cfg(not(feature = "tokenizer"))]
    {
        let _ = model;
        let chars: usize = request.input.texts().iter().map(String::len).sum();
        (chars as u64).div_ceil(4)
    }
}

pub fn spawn_health_pruner(
    router: Arc<Router>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = router.prune_health();
                    if pruned > 0 {
                        tracing::debug!(pruned, "pruned idle deployment health entries");
                    }
                }
            }
        }
    })
}

/// Stops the background tasks, waiting at most `SHUTDOWN_DRAIN` for them.
pub async fn join_background_tasks(cancel: &CancellationToken, handles: Vec<JoinHandle<()>>) {
    cancel.cancel();
    let joined = tokio::time::timeout(SHUTDOWN_DRAIN, futures_util::future::join_all(handles)).await;
    if joined.is_err() {
        tracing::warn!("background tasks did not stop within the drain window");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique() {
        let first = generate_request_id();
        let second = generate_request_id();
        assert!(first.starts_with("tianji-"));
        assert_ne!(first, second);
    }

    #[test]
    fn token_estimates_are_positive_for_text() {
        let request = ChatCompletionRequest::new(
            "gpt-4o",
            vec![crate::types::ChatMessage::user("hello there, how are you?")],
        );
        assert!(estimate_chat_tokens("gpt-4o", &request) > 0);
    }
}
