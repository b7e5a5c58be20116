use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;

use super::error::ApiError;
use super::keys::Caller;
use super::{DEPLOYMENT_HEADER, Gateway, REQUEST_ID_HEADER};
use crate::cache::{CacheControl, prompt_text};
use crate::callbacks::{CallType, RequestEvent};
use crate::error::ProviderError;
use crate::policy::engine::{post_call_input, pre_call_input};
use crate::policy::{PipelineMode, PipelineOutcome, PolicyContext};
use crate::providers::{ChunkStream, execute_chat, execute_chat_stream, synthesize_chunks};
use crate::router::{Attempt, Deployment, RouteRequest};
use crate::types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChunkAccumulator, ChunkDelta, Usage, unix_now,
};
use crate::utils::sse::{DONE_SENTINEL, sse_frame};

/// A finished non-streaming completion and where it came from.
#[derive(Clone, Debug)]
pub(crate) struct ChatOutcome {
    pub response: ChatCompletionResponse,
    /// `None` when no upstream was called.
    pub deployment: Option<Arc<Deployment>>,
    pub attempts: Vec<Attempt>,
    pub cache_hit: bool,
}

impl ChatOutcome {
    fn local(response: ChatCompletionResponse, cache_hit: bool) -> Self {
        Self {
            response,
            deployment: None,
            attempts: Vec::new(),
            cache_hit,
        }
    }
}

/// Per-request values shared by the streaming and non-streaming paths.
struct ChatCall {
    request: ChatCompletionRequest,
    caller: Caller,
    policy_ctx: PolicyContext,
    route: RouteRequest,
    cache_key: Option<String>,
    control: CacheControl,
}

pub(crate) async fn chat_completions(gateway: Arc<Gateway>, headers: HeaderMap, body: Bytes) -> Response {
    let started = Instant::now();
    let request_id = super::keys::extract_header(&headers, REQUEST_ID_HEADER)
        .unwrap_or_else(super::generate_request_id);
    let caller = match gateway.authenticate(&headers) {
        Ok(caller) => caller,
        Err(err) => return with_request_id(err.into_response(), &request_id),
    };
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            let err = ApiError::bad_request(format!("invalid chat completion request: {err}"));
            return with_request_id(err.into_response(), &request_id);
        }
    };

    let mut event = gateway.event(&request_id, CallType::Chat, &request.model, &caller);
    event.stream = request.is_stream();
    let result = serve(&gateway, request, caller, &mut event, started).await;
    match result {
        Ok(response) => with_request_id(response, &request_id),
        Err(err) => {
            if err.error_type == "policy_violation" {
                gateway.counters().record_policy_block();
            }
            event.error = Some(err.event_error());
            event.attempts = err.trail.clone();
            event.latency_ms = elapsed_ms(started);
            tracing::warn!(
                request_id = %request_id,
                model_group = %event.model_group,
                kind = %err.kind,
                "chat completion failed: {}",
                err.message
            );
            gateway.emit(event);
            with_request_id(err.into_response(), &request_id)
        }
    }
}

async fn serve(
    gateway: &Arc<Gateway>,
    mut request: ChatCompletionRequest,
    caller: Caller,
    event: &mut RequestEvent,
    started: Instant,
) -> Result<Response, ApiError> {
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    if !caller.may_call(&request.model) {
        return Err(ApiError::forbidden_model(&request.model));
    }
    if let Some(auto) = gateway.auto_routers.for_model(&request.model) {
        let text = request.last_user_text();
        let resolved = auto
            .resolve(gateway.embedder.as_ref(), text.as_deref())
            .await
            .map_err(|err| ApiError::from_provider(&err))?;
        tracing::debug!(auto_router = auto.name(), model = %resolved, "auto-router resolved model");
        request.model = resolved;
        event.model_group = request.model.clone();
    }

    let tags = request.tags();
    let control = CacheControl::from_extra(&request.extra);
    let cache_key = gateway
        .cache
        .as_ref()
        .map(|layer| layer.cache.chat_key(&request.model, &request));
    let call = ChatCall {
        policy_ctx: gateway.policy_context(&caller, &request.model, &tags),
        route: gateway.route_request(
            &request.model,
            tags,
            super::estimate_chat_tokens(&request.model, &request),
        ),
        request,
        caller,
        cache_key,
        control,
    };

    if call.request.is_stream() {
        serve_stream(gateway, call, event.clone(), started).await
    } else {
        serve_once(gateway, call, event, started).await
    }
}

async fn cached(gateway: &Gateway, call: &ChatCall) -> Option<ChatCompletionResponse> {
    if call.control.no_cache {
        return None;
    }
    let layer = gateway.cache.as_ref()?;
    let key = call.cache_key.as_deref()?;
    layer.cache.lookup::<ChatCompletionResponse>(key).await
}

/// Pre-call policies. `Ok(Some(_))` is a synthetic reply that replaces the call.
async fn check_input(gateway: &Gateway, call: &ChatCall) -> Result<Option<ChatCompletionResponse>, ApiError> {
    let input = pre_call_input(&prompt_text(&call.request), &call.request.model);
    let decision = gateway
        .policies
        .evaluate(&call.policy_ctx, PipelineMode::PreCall, &input)
        .await;
    match decision.outcome {
        PipelineOutcome::Allow => Ok(None),
        PipelineOutcome::Block { message, .. } => Err(ApiError::policy_violation(message)),
        PipelineOutcome::ModifyResponse { message, .. } => Ok(Some(ChatCompletionResponse::synthetic(
            call.request.model.clone(),
            message,
        ))),
    }
}

async fn check_output(gateway: &Gateway, call: &ChatCall, text: &str) -> PipelineOutcome {
    let input = post_call_input(text, &call.request.model);
    gateway
        .policies
        .evaluate(&call.policy_ctx, PipelineMode::PostCall, &input)
        .await
        .outcome
}

async fn dispatch(gateway: &Gateway, call: &ChatCall) -> Result<ChatOutcome, ApiError> {
    if let Some(hit) = cached(gateway, call).await {
        return Ok(ChatOutcome::local(hit, true));
    }
    let routed = gateway
        .router
        .route(&call.route, |deployment, timeout| {
            let adapter = gateway.adapter(&deployment.provider);
            let transport = Arc::clone(gateway.transport());
            let request = &call.request;
            async move {
                let adapter = adapter?;
                execute_chat(
                    adapter.as_ref(),
                    transport.as_ref(),
                    request,
                    &deployment.model,
                    &deployment.credentials,
                    timeout.or(deployment.timeout),
                )
                .await
            }
        })
        .await
        .map_err(|err| ApiError::from_router(&err, call.caller.privileged))?;
    Ok(ChatOutcome {
        response: routed.value,
        deployment: Some(routed.deployment),
        attempts: routed.attempts,
        cache_hit: false,
    })
}

async fn serve_once(
    gateway: &Arc<Gateway>,
    call: ChatCall,
    event: &mut RequestEvent,
    started: Instant,
) -> Result<Response, ApiError> {
    let mut outcome = match cached(gateway, &call).await {
        Some(hit) => ChatOutcome::local(hit, true),
        None => match check_input(gateway, &call).await? {
            Some(synthetic) => ChatOutcome::local(synthetic, false),
            None => match call.cache_key.as_deref() {
                Some(key) => {
                    let mut leader = false;
                    let mut outcome = gateway
                        .chat_flights
                        .run(key, || {
                            leader = true;
                            dispatch(gateway, &call)
                        })
                        .await?;
                    if !leader {
                        outcome.cache_hit = true;
                    }
                    outcome
                }
                None => dispatch(gateway, &call).await?,
            },
        },
    };

    let mut storable = outcome.deployment.is_some() && !outcome.cache_hit;
    match check_output(gateway, &call, &outcome.response.output_text()).await {
        PipelineOutcome::Allow => {}
        PipelineOutcome::Block { message, .. } => {
            let mut err = ApiError::policy_violation(message);
            err.trail = outcome.attempts;
            return Err(err);
        }
        PipelineOutcome::ModifyResponse { message, .. } => {
            outcome.response = ChatCompletionResponse::synthetic(call.request.model.clone(), message);
            storable = false;
        }
    }

    if storable && !call.control.no_store {
        if let (Some(layer), Some(key)) = (gateway.cache.as_ref(), call.cache_key.as_deref()) {
            layer.cache.store(key, &outcome.response, call.control.ttl).await;
        }
    }

    record_success(
        gateway,
        event,
        outcome.deployment.as_deref(),
        outcome.attempts,
        outcome.response.usage.clone(),
        outcome.cache_hit,
        started,
    );
    let mut response = Json(outcome.response).into_response();
    tag_response(response.headers_mut(), event);
    Ok(response)
}

fn record_success(
    gateway: &Gateway,
    event: &mut RequestEvent,
    deployment: Option<&Deployment>,
    attempts: Vec<Attempt>,
    usage: Option<Usage>,
    cache_hit: bool,
    started: Instant,
) {
    if let Some(deployment) = deployment {
        event.deployment = Some(deployment.id.clone());
        event.provider = Some(deployment.provider.clone());
        if !cache_hit {
            if let Some(usage) = &usage {
                gateway.router.record_usage(&deployment.id, usage.total_tokens);
                event.cost_usd = deployment.cost_of(usage.prompt_tokens, usage.completion_tokens);
            }
        }
    }
    event.attempts = attempts;
    event.usage = usage;
    event.cache_hit = cache_hit;
    event.latency_ms = elapsed_ms(started);
    gateway.emit(event.clone());
}

fn tag_response(headers: &mut HeaderMap, event: &RequestEvent) {
    if let Some(value) = event
        .deployment
        .as_deref()
        .and_then(|deployment| HeaderValue::from_str(deployment).ok())
    {
        headers.insert(DEPLOYMENT_HEADER, value);
    }
    if event.cache_hit {
        headers.insert("x-tianji-cache-hit", HeaderValue::from_static("true"));
    }
}

pub(crate) fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn sse_response(body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn chunk_frame(chunk: &ChatCompletionChunk) -> Bytes {
    Bytes::from(sse_frame(&serde_json::to_string(chunk).unwrap_or_default()))
}

fn done_frame() -> Bytes {
    Bytes::from(sse_frame(DONE_SENTINEL))
}

/// Replays a complete response as a finished event stream.
fn replay(response: &ChatCompletionResponse) -> Body {
    let mut frames: Vec<Result<Bytes, Infallible>> = synthesize_chunks(response)
        .iter()
        .map(|chunk| Ok(chunk_frame(chunk)))
        .collect();
    frames.push(Ok(done_frame()));
    Body::from_stream(futures_util::stream::iter(frames))
}

async fn serve_stream(
    gateway: &Arc<Gateway>,
    call: ChatCall,
    mut event: RequestEvent,
    started: Instant,
) -> Result<Response, ApiError> {
    if let Some(hit) = cached(gateway, &call).await {
        record_success(gateway, &mut event, None, Vec::new(), hit.usage.clone(), true, started);
        let mut response = sse_response(replay(&hit));
        tag_response(response.headers_mut(), &event);
        return Ok(response);
    }
    if let Some(synthetic) = check_input(gateway, &call).await? {
        record_success(gateway, &mut event, None, Vec::new(), synthetic.usage.clone(), false, started);
        return Ok(sse_response(replay(&synthetic)));
    }

    let routed = gateway
        .router
        .route(&call.route, |deployment, timeout| {
            let adapter = gateway.adapter(&deployment.provider);
            let transport = Arc::clone(gateway.transport());
            let request = &call.request;
            async move {
                execute_chat_stream(
                    adapter?,
                    transport.as_ref(),
                    request,
                    &deployment.model,
                    &deployment.credentials,
                    timeout.or(deployment.timeout),
                )
                .await
            }
        })
        .await
        .map_err(|err| ApiError::from_router(&err, call.caller.privileged))?;

    event.deployment = Some(routed.deployment.id.clone());
    event.provider = Some(routed.deployment.provider.clone());
    event.attempts = routed.attempts;
    let relay = StreamRelay {
        upstream: routed.value,
        gateway: Arc::clone(gateway),
        deployment: routed.deployment,
        id: format!("chatcmpl-{}", crate::utils::random_hex(12)),
        created: unix_now(),
        model: None,
        requested_model: call.request.model.clone(),
        acc: ChunkAccumulator::default(),
        checked: false,
        modified: false,
        pending: VecDeque::new(),
        done: false,
        event,
        started,
        call,
    };
    let deployment = HeaderValue::from_str(&relay.deployment.id).ok();
    let mut response = sse_response(Body::from_stream(relay.into_stream()));
    if let Some(value) = deployment {
        response.headers_mut().insert(DEPLOYMENT_HEADER, value);
    }
    Ok(response)
}

/// Forwards upstream chunks under one stable id/created/model, runs post-call
/// policies before the terminal chunk, and stores the assembled reply.
struct StreamRelay {
    upstream: ChunkStream,
    gateway: Arc<Gateway>,
    call: ChatCall,
    deployment: Arc<Deployment>,
    event: RequestEvent,
    started: Instant,
    id: String,
    created: u64,
    /// First model name the upstream reported.
    model: Option<String>,
    requested_model: String,
    acc: ChunkAccumulator,
    checked: bool,
    modified: bool,
    pending: VecDeque<Bytes>,
    done: bool,
}

impl StreamRelay {
    fn into_stream(self) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        futures_util::stream::unfold(self, |mut relay| async move {
            loop {
                if let Some(frame) = relay.pending.pop_front() {
                    return Some((Ok(frame), relay));
                }
                if relay.done {
                    return None;
                }
                match relay.upstream.next().await {
                    Some(Ok(chunk)) => relay.on_chunk(chunk).await,
                    Some(Err(err)) => relay.on_error(&err),
                    None => relay.on_end().await,
                }
            }
        })
    }

    fn model(&self) -> String {
        self.model.clone().unwrap_or_else(|| self.requested_model.clone())
    }

    fn stamp(&mut self, chunk: &mut ChatCompletionChunk) {
        if self.model.is_none() && !chunk.model.is_empty() {
            self.model = Some(chunk.model.clone());
        }
        chunk.id = self.id.clone();
        chunk.created = self.created;
        chunk.model = self.model();
    }

    async fn on_chunk(&mut self, mut chunk: ChatCompletionChunk) {
        self.stamp(&mut chunk);
        self.acc.push(&chunk);
        if chunk.is_terminal() && !self.checked {
            self.checked = true;
            let text = self.assembled().output_text();
            match check_output(&self.gateway, &self.call, &text).await {
                PipelineOutcome::Allow => {}
                PipelineOutcome::Block { message, .. } => {
                    self.fail(ApiError::policy_violation(message));
                    return;
                }
                PipelineOutcome::ModifyResponse { message, .. } => {
                    self.modified = true;
                    for choice in &mut chunk.choices {
                        choice.delta = ChunkDelta {
                            content: (choice.index == 0).then(|| message.clone()),
                            ..ChunkDelta::default()
                        };
                        choice.finish_reason = Some("content_filter".to_string());
                    }
                }
            }
        }
        self.pending.push_back(chunk_frame(&chunk));
    }

    fn on_error(&mut self, err: &ProviderError) {
        self.fail(ApiError::from_provider(err));
    }

    /// Ends the stream with an error frame and a failure event.
    fn fail(&mut self, err: ApiError) {
        tracing::warn!(
            request_id = %self.event.request_id,
            deployment = %self.deployment.id,
            kind = %err.kind,
            "chat stream ended with error: {}",
            err.message
        );
        if err.error_type == "policy_violation" {
            self.gateway.counters().record_policy_block();
        }
        self.pending
            .push_back(Bytes::from(sse_frame(&err.to_json().to_string())));
        self.done = true;
        let mut event = self.event.clone();
        event.error = Some(err.event_error());
        event.latency_ms = elapsed_ms(self.started);
        self.gateway.emit(event);
    }

    async fn on_end(&mut self) {
        let assembled = self.assembled();
        if !self.checked {
            self.checked = true;
            if let PipelineOutcome::Block { message, .. } =
                check_output(&self.gateway, &self.call, &assembled.output_text()).await
            {
                self.fail(ApiError::policy_violation(message));
                return;
            }
        }
        if !self.modified && !self.call.control.no_store {
            if let (Some(layer), Some(key)) = (self.gateway.cache.as_ref(), self.call.cache_key.as_deref()) {
                layer.cache.store(key, &assembled, self.call.control.ttl).await;
            }
        }
        let attempts = std::mem::take(&mut self.event.attempts);
        record_success(
            &self.gateway,
            &mut self.event,
            Some(&self.deployment),
            attempts,
            self.acc.usage().cloned(),
            false,
            self.started,
        );
        self.pending.push_back(done_frame());
        self.done = true;
    }

    fn assembled(&self) -> ChatCompletionResponse {
        self.acc.to_response(&self.id, self.created, &self.model())
    }
}
