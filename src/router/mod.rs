//! Model-group routing: resolve a group or alias, pick a deployment, and walk
//! retries and fallback groups until one attempt succeeds or the budget runs out.
//!
//! Per visit to a group the dispatch budget is `eligible · (1 + retries)`. The
//! primary group uses `num_retries`; fallback groups get a single pass unless
//! `model_group_retry_policy` names them. A deployment that answers with
//! `content_policy`, or with `rate_limit` while a fallback is available, is not
//! re-picked within the same visit.

pub mod auto_router;
pub mod config;
pub mod deployment;
pub mod health;
pub mod strategy;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::error::{ErrorKind, ProviderError};

pub use auto_router::{AutoRouter, AutoRouterConfig, AutoRouters, Embedder, SemanticRoute};
pub use config::{AliasTarget, FallbackMap, GroupRetryPolicy, RouterSettings};
pub use deployment::{Deployment, DeploymentInfo, ModelGroup};
pub use health::{CooldownPolicy, DeploymentHealthSnapshot, HealthTracker};
pub use strategy::{RoutingStrategy, SelectionStrategy};

const MAX_ALIAS_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("unknown model group: {0}")]
    UnknownModel(String),
    #[error("no deployments available for model group {0}")]
    NoDeployments(String),
    /// A caller error or an error with no configured fallback; surfaced as-is.
    #[error("{error}")]
    Terminal {
        error: ProviderError,
        attempts: Vec<Attempt>,
    },
    #[error("all deployments failed after {} attempts: {last}", attempts.len())]
    Exhausted {
        last: ProviderError,
        attempts: Vec<Attempt>,
    },
    #[error("invalid router config: {0}")]
    InvalidConfig(String),
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownModel(_) => ErrorKind::BadRequest,
            Self::NoDeployments(_) => ErrorKind::TransientNetwork,
            Self::Terminal { error, .. } => error.kind,
            Self::Exhausted { last, .. } => last.kind,
            Self::InvalidConfig(_) => ErrorKind::Internal,
        }
    }

    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Terminal { error, .. } => Some(error),
            Self::Exhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    pub fn attempts(&self) -> &[Attempt] {
        match self {
            Self::Terminal { attempts, .. } | Self::Exhausted { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

/// One dispatch to one deployment.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Attempt {
    pub deployment: String,
    pub model_group: String,
    /// `None` for a successful attempt.
    #[serde(serialize_with = "serialize_outcome")]
    pub kind: Option<ErrorKind>,
    pub latency_ms: u64,
}

impl Attempt {
    pub fn outcome(&self) -> &'static str {
        self.kind.map(ErrorKind::as_str).unwrap_or("ok")
    }
}

fn serialize_outcome<S: Serializer>(kind: &Option<ErrorKind>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(kind.map(ErrorKind::as_str).unwrap_or("ok"))
}

#[derive(Clone, Debug, Default)]
pub struct RouteRequest {
    /// A group, alias, or wildcard-matched model name.
    pub model: String,
    pub tags: Vec<String>,
    /// Counted against `tpm` limits during selection.
    pub estimated_tokens: u64,
    pub deadline: Option<Instant>,
    /// Per-request override of the general fallback list.
    pub fallbacks: Option<Vec<String>>,
    pub num_retries: Option<u32>,
}

impl RouteRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

#[derive(Debug)]
pub struct Routed<T> {
    pub value: T,
    pub deployment: Arc<Deployment>,
    pub model_group: String,
    pub attempts: Vec<Attempt>,
}

/// A `/v1/models` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelListing {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_for: Option<String>,
}

struct RouterSnapshot {
    groups: BTreeMap<String, Arc<ModelGroup>>,
    /// Longest prefix first.
    wildcards: Vec<Arc<ModelGroup>>,
    aliases: BTreeMap<String, AliasTarget>,
    settings: RouterSettings,
    strategy: Arc<dyn SelectionStrategy>,
}

impl RouterSnapshot {
    fn build(
        groups: Vec<ModelGroup>,
        settings: RouterSettings,
        strategy: Arc<dyn SelectionStrategy>,
    ) -> Result<Self, RouterError> {
        let mut exact = BTreeMap::new();
        let mut wildcards = Vec::new();
        for group in groups {
            if group.deployments.is_empty() {
                return Err(RouterError::InvalidConfig(format!(
                    "model group {} has no deployments",
                    group.name
                )));
            }
            let group = Arc::new(group);
            if group.wildcard_prefix().is_some() {
                wildcards.push(Arc::clone(&group));
            }
            exact.insert(group.name.clone(), group);
        }
        wildcards.sort_by_key(|group| std::cmp::Reverse(group.name.len()));

        let snapshot = Self {
            groups: exact,
            wildcards,
            aliases: settings.model_group_alias.clone(),
            settings,
            strategy,
        };
        for alias in snapshot.aliases.keys() {
            snapshot.resolve(alias).map_err(|err| match err {
                RouterError::UnknownModel(target) => RouterError::InvalidConfig(format!(
                    "alias {alias} points at unknown model group {target}"
                )),
                other => other,
            })?;
        }
        Ok(snapshot)
    }

    fn canonical_name<'a>(&'a self, model: &'a str) -> Result<&'a str, RouterError> {
        let mut name = model;
        let mut seen = HashSet::new();
        while let Some(target) = self.aliases.get(name) {
            if !seen.insert(name) || seen.len() > MAX_ALIAS_DEPTH {
                return Err(RouterError::InvalidConfig(format!(
                    "alias cycle through {model}"
                )));
            }
            name = target.group();
        }
        Ok(name)
    }

    fn resolve(&self, model: &str) -> Result<Arc<ModelGroup>, RouterError> {
        let name = self.canonical_name(model)?;
        if let Some(group) = self.groups.get(name) {
            return Ok(Arc::clone(group));
        }
        for wildcard in &self.wildcards {
            let Some(prefix) = wildcard.wildcard_prefix() else {
                continue;
            };
            if let Some(suffix) = name.strip_prefix(prefix) {
                if suffix.is_empty() {
                    continue;
                }
                return Ok(Arc::new(ModelGroup {
                    name: wildcard.name.clone(),
                    deployments: wildcard
                        .deployments
                        .iter()
                        .map(|deployment| Arc::new(deployment.for_wildcard(suffix)))
                        .collect(),
                    hidden: wildcard.hidden,
                }));
            }
        }
        Err(RouterError::UnknownModel(name.to_string()))
    }
}

/// Owns the deployment health map and the current routing snapshot.
pub struct Router {
    snapshot: RwLock<Arc<RouterSnapshot>>,
    health: HealthTracker,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("Router")
            .field("groups", &snapshot.groups.keys().collect::<Vec<_>>())
            .field("strategy", &snapshot.strategy.name())
            .finish()
    }
}

enum VisitOutcome<T> {
    Done(T, Arc<Deployment>),
    Fail(ProviderError),
    Fallback(Option<ProviderError>),
}

impl Router {
    pub fn new(groups: Vec<ModelGroup>, settings: RouterSettings) -> Result<Self, RouterError> {
        let strategy: Arc<dyn SelectionStrategy> = Arc::new(settings.routing_strategy);
        Self::with_strategy(groups, settings, strategy)
    }

    pub fn with_strategy(
        groups: Vec<ModelGroup>,
        settings: RouterSettings,
        strategy: Arc<dyn SelectionStrategy>,
    ) -> Result<Self, RouterError> {
        let snapshot = RouterSnapshot::build(groups, settings, strategy)?;
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            health: HealthTracker::default(),
        })
    }

    fn snapshot(&self) -> Arc<RouterSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Publishes a new model list and settings. In-flight routes keep the old snapshot.
    pub fn reload(&self, groups: Vec<ModelGroup>, settings: RouterSettings) -> Result<(), RouterError> {
        let strategy: Arc<dyn SelectionStrategy> = Arc::new(settings.routing_strategy);
        let snapshot = Arc::new(RouterSnapshot::build(groups, settings, strategy)?);
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
        Ok(())
    }

    pub fn settings(&self) -> RouterSettings {
        self.snapshot().settings.clone()
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn resolve(&self, model: &str) -> Result<Arc<ModelGroup>, RouterError> {
        self.snapshot().resolve(model)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.resolve(model).is_ok()
    }

    /// Non-hidden groups followed by non-hidden aliases. Wildcard groups are not listed.
    pub fn list_models(&self) -> Vec<ModelListing> {
        let snapshot = self.snapshot();
        let mut out: Vec<ModelListing> = snapshot
            .groups
            .values()
            .filter(|group| !group.hidden && group.wildcard_prefix().is_none())
            .map(|group| ModelListing {
                id: group.name.clone(),
                alias_for: None,
            })
            .collect();
        out.extend(
            snapshot
                .aliases
                .iter()
                .filter(|(_, target)| !target.hidden())
                .map(|(alias, target)| ModelListing {
                    id: alias.clone(),
                    alias_for: Some(target.group().to_string()),
                }),
        );
        out
    }

    pub fn deployments(&self) -> Vec<DeploymentInfo> {
        self.snapshot()
            .groups
            .values()
            .flat_map(|group| group.deployments.iter().map(|d| DeploymentInfo::from(d.as_ref())))
            .collect()
    }

    /// First configured deployment of `provider`, in group name order. Pass-through
    /// requests borrow its credentials.
    pub fn deployment_for_provider(&self, provider: &str) -> Option<Arc<Deployment>> {
        self.snapshot()
            .groups
            .values()
            .flat_map(|group| group.deployments.iter())
            .find(|deployment| deployment.provider == provider)
            .cloned()
    }

    pub fn health_snapshot(&self) -> Vec<DeploymentHealthSnapshot> {
        self.health.snapshot(self.snapshot().settings.cooldown_policy())
    }

    /// Drops idle health entries; run from a periodic task.
    pub fn prune_health(&self) -> usize {
        let window = self.snapshot().settings.cooldown_policy().cooldown_time;
        self.health.prune(window.max(Duration::from_secs(60)))
    }

    /// Counts tokens a finished request used against its deployment's `tpm` bucket.
    pub fn record_usage(&self, deployment: &str, tokens: u64) {
        self.health
            .get(deployment)
            .record_usage(health::current_minute(), 0, tokens);
    }

    /// Runs `dispatch` against deployments until one succeeds or every retry and
    /// fallback is spent. `dispatch` gets the deployment and the attempt timeout.
    pub async fn route<T, F, Fut>(
        &self,
        request: &RouteRequest,
        mut dispatch: F,
    ) -> Result<Routed<T>, RouterError>
    where
        F: FnMut(Arc<Deployment>, Option<Duration>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let snapshot = self.snapshot();
        let primary = snapshot.resolve(&request.model)?;
        let settings = &snapshot.settings;

        let mut attempts = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: Option<VecDeque<String>> = None;
        let mut last_error: Option<ProviderError> = None;
        let mut group = Arc::clone(&primary);
        let mut is_primary = true;

        loop {
            visited.insert(group.name.clone());
            let general = match &request.fallbacks {
                Some(fallbacks) => fallbacks.as_slice(),
                None => settings.general_fallbacks(&group.name),
            };
            let can_fall_back = match &queue {
                Some(queue) => !queue.is_empty(),
                None => !general.is_empty(),
            };
            let retries = match request.num_retries {
                Some(retries) if is_primary => retries,
                _ => settings.retries_for(&group.name, is_primary),
            };

            let outcome = self
                .visit(
                    &snapshot,
                    &group,
                    request,
                    retries,
                    can_fall_back,
                    &mut dispatch,
                    &mut attempts,
                )
                .await;

            let error = match outcome {
                VisitOutcome::Done(value, deployment) => {
                    return Ok(Routed {
                        value,
                        deployment,
                        model_group: group.name.clone(),
                        attempts,
                    });
                }
                VisitOutcome::Fail(error) => {
                    return Err(RouterError::Terminal { error, attempts });
                }
                VisitOutcome::Fallback(error) => error,
            };
            if let Some(error) = error {
                last_error = Some(error);
            }

            let queue = queue.get_or_insert_with(|| {
                let kind = last_error.as_ref().map(|err| err.kind);
                let list = match (&request.fallbacks, kind) {
                    (_, Some(ErrorKind::ContextOverflow | ErrorKind::ContentPolicy)) | (None, _) => {
                        settings.fallbacks_for(&group.name, kind)
                    }
                    (Some(fallbacks), _) => fallbacks.clone(),
                };
                list.into()
            });

            if queue.is_empty() && is_primary {
                if let Some(error) = last_error.take() {
                    if matches!(
                        error.kind,
                        ErrorKind::ContextOverflow | ErrorKind::ContentPolicy
                    ) {
                        return Err(RouterError::Terminal { error, attempts });
                    }
                    last_error = Some(error);
                }
            }

            let mut next = None;
            while let Some(name) = queue.pop_front() {
                if visited.contains(&name) {
                    continue;
                }
                match snapshot.resolve(&name) {
                    Ok(resolved) => {
                        tracing::info!(
                            from = %group.name,
                            to = %resolved.name,
                            kind = last_error.as_ref().map(|err| err.kind.as_str()).unwrap_or("no_deployments"),
                            "falling back to model group"
                        );
                        next = Some(resolved);
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(fallback = %name, error = %err, "skipping unknown fallback group");
                    }
                }
            }
            match next {
                Some(resolved) => {
                    group = resolved;
                    is_primary = false;
                }
                None => break,
            }
            if request.remaining() == Some(Duration::ZERO) {
                break;
            }
        }

        match last_error {
            Some(last) => Err(RouterError::Exhausted { last, attempts }),
            None => Err(RouterError::NoDeployments(primary.name.clone())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn visit<T, F, Fut>(
        &self,
        snapshot: &RouterSnapshot,
        group: &ModelGroup,
        request: &RouteRequest,
        retries: u32,
        can_fall_back: bool,
        dispatch: &mut F,
        attempts: &mut Vec<Attempt>,
    ) -> VisitOutcome<T>
    where
        F: FnMut(Arc<Deployment>, Option<Duration>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let settings = &snapshot.settings;
        let policy = settings.cooldown_policy();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut tries: HashMap<String, u32> = HashMap::new();
        let mut last_error: Option<ProviderError> = None;
        let mut budget: Option<u64> = None;
        let mut dispatched = 0u64;

        loop {
            let eligible = self.eligible(snapshot, group, request, &excluded, policy);
            if eligible.is_empty() {
                tracing::debug!(model_group = %group.name, "no eligible deployments");
                return VisitOutcome::Fallback(last_error);
            }
            let budget = *budget.get_or_insert(eligible.len() as u64 * (1 + u64::from(retries)));
            if dispatched >= budget {
                return VisitOutcome::Fallback(last_error);
            }

            // Spread retries: only the least-tried deployments are offered to the strategy.
            let fewest = eligible
                .iter()
                .map(|d| tries.get(&d.id).copied().unwrap_or(0))
                .min()
                .unwrap_or(0);
            let candidates: Vec<Arc<Deployment>> = eligible
                .into_iter()
                .filter(|d| tries.get(&d.id).copied().unwrap_or(0) == fewest)
                .collect();
            let picked = snapshot
                .strategy
                .select(&candidates, &self.health)
                .and_then(|idx| candidates.get(idx))
                .unwrap_or(&candidates[0]);
            let deployment = Arc::clone(picked);

            if let Some(previous) = &last_error {
                let wait = settings
                    .retry_after(&group.name)
                    .or(previous.retry_after)
                    .unwrap_or(Duration::ZERO);
                let wait = cap(Some(wait), request.remaining()).unwrap_or(Duration::ZERO);
                if !wait.is_zero() {
                    tracing::debug!(model_group = %group.name, wait_ms = wait.as_millis() as u64, "waiting before retry");
                    tokio::time::sleep(wait).await;
                }
            }
            if request.remaining() == Some(Duration::ZERO) {
                let error = last_error.unwrap_or_else(|| {
                    ProviderError::new(&deployment.provider, ErrorKind::Timeout, "request deadline exceeded")
                });
                return VisitOutcome::Fail(error);
            }

            let timeout = cap(
                settings.attempt_timeout(&group.name).or(deployment.timeout),
                request.remaining(),
            );
            let health = self.health.get(&deployment.id);
            health.record_usage(health::current_minute(), 1, 0);
            *tries.entry(deployment.id.clone()).or_default() += 1;
            dispatched += 1;

            let started = Instant::now();
            let result = {
                let _in_flight = health.begin();
                let call = dispatch(Arc::clone(&deployment), timeout);
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, call).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::new(
                            &deployment.provider,
                            ErrorKind::Timeout,
                            format!("attempt timed out after {}ms", limit.as_millis()),
                        )),
                    },
                    None => call.await,
                }
            };
            let latency = started.elapsed();

            let error = match result {
                Ok(value) => {
                    health.record_success(latency);
                    attempts.push(Attempt {
                        deployment: deployment.id.clone(),
                        model_group: group.name.clone(),
                        kind: None,
                        latency_ms: latency.as_millis() as u64,
                    });
                    return VisitOutcome::Done(value, deployment);
                }
                Err(error) => error,
            };

            attempts.push(Attempt {
                deployment: deployment.id.clone(),
                model_group: group.name.clone(),
                kind: Some(error.kind),
                latency_ms: latency.as_millis() as u64,
            });
            tracing::warn!(
                model_group = %group.name,
                deployment = %deployment.id,
                kind = %error.kind,
                status = ?error.status,
                attempt = attempts.len(),
                "deployment attempt failed"
            );

            match error.kind {
                ErrorKind::Auth | ErrorKind::BadRequest | ErrorKind::Internal => {
                    return VisitOutcome::Fail(error);
                }
                ErrorKind::ContextOverflow => return VisitOutcome::Fallback(Some(error)),
                ErrorKind::ContentPolicy => {
                    excluded.insert(deployment.id.clone());
                }
                kind => {
                    if health.record_failure(kind, Instant::now(), policy) {
                        tracing::info!(deployment = %deployment.id, "deployment entered cooldown");
                    }
                    if kind == ErrorKind::RateLimit && can_fall_back {
                        excluded.insert(deployment.id.clone());
                    }
                }
            }
            last_error = Some(error);
        }
    }

    fn eligible(
        &self,
        snapshot: &RouterSnapshot,
        group: &ModelGroup,
        request: &RouteRequest,
        excluded: &HashSet<String>,
        policy: CooldownPolicy,
    ) -> Vec<Arc<Deployment>> {
        let now = Instant::now();
        let minute = health::current_minute();
        let single = group.deployments.len() == 1;
        group
            .deployments
            .iter()
            .filter(|d| !excluded.contains(&d.id))
            .filter(|d| snapshot.settings.tags_match(&d.tags, &request.tags))
            .filter(|d| {
                let health = self.health.get(&d.id);
                if !single && health.is_cooling_down(now, policy) {
                    return false;
                }
                let (requests, tokens) = health.usage(minute);
                let rpm_ok = d.rpm.is_none_or(|rpm| requests < rpm);
                let tpm_ok = d
                    .tpm
                    .is_none_or(|tpm| tokens.saturating_add(request.estimated_tokens) <= tpm);
                rpm_ok && tpm_ok
            })
            .cloned()
            .collect()
    }
}

fn cap(limit: Option<Duration>, remaining: Option<Duration>) -> Option<Duration> {
    match (limit, remaining) {
        (Some(limit), Some(remaining)) => Some(limit.min(remaining)),
        (limit, remaining) => limit.or(remaining),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn group(name: &str, n: usize) -> ModelGroup {
        ModelGroup::new(
            name,
            (1..=n)
                .map(|i| Deployment::new(format!("{name}/d{i}"), name, "openai", name))
                .collect(),
        )
    }

    fn err(kind: ErrorKind) -> ProviderError {
        ProviderError::new("openai", kind, kind.as_str())
    }

    #[tokio::test]
    async fn exhaustion_dispatches_every_retry_and_fallback_once() {
        let settings = RouterSettings {
            num_retries: 2,
            fallbacks: FallbackMap::from([("A", vec!["B".to_string(), "C".to_string()])]),
            ..RouterSettings::default()
        };
        let router = Router::new(vec![group("A", 2), group("B", 2), group("C", 1)], settings).unwrap();
        let calls = Mutex::new(Vec::new());
        let result = router
            .route(&RouteRequest::new("A"), |deployment, _| {
                calls.lock().unwrap().push(deployment.id.clone());
                async { Err::<(), _>(err(ErrorKind::Upstream5xx)) }
            })
            .await;
        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.len(), 2 * (1 + 2) + 2 + 1);
        match result {
            Err(RouterError::Exhausted { last, attempts }) => {
                assert_eq!(last.kind, ErrorKind::Upstream5xx);
                assert_eq!(attempts.len(), calls.len());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_request_short_circuits_after_one_dispatch() {
        let settings = RouterSettings {
            fallbacks: FallbackMap::from([("A", vec!["B".to_string()])]),
            ..RouterSettings::default()
        };
        let router = Router::new(vec![group("A", 3), group("B", 1)], settings).unwrap();
        let calls = Mutex::new(0usize);
        let result = router
            .route(&RouteRequest::new("A"), |_, _| {
                *calls.lock().unwrap() += 1;
                async { Err::<(), _>(err(ErrorKind::BadRequest)) }
            })
            .await;
        assert_eq!(*calls.lock().unwrap(), 1);
        let error = result.unwrap_err();
        assert!(matches!(error, RouterError::Terminal { .. }));
        assert_eq!(error.kind(), ErrorKind::BadRequest);
        assert_eq!(error.attempts().len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_falls_back_without_retrying_a_single_deployment() {
        let settings = RouterSettings {
            fallbacks: FallbackMap::from([("A", vec!["B".to_string()])]),
            ..RouterSettings::default()
        };
        let router = Router::new(vec![group("A", 1), group("B", 1)], settings).unwrap();
        let routed = router
            .route(&RouteRequest::new("A"), |deployment, _| async move {
                if deployment.model_group == "A" {
                    Err(err(ErrorKind::RateLimit))
                } else {
                    Ok(deployment.id.clone())
                }
            })
            .await
            .unwrap();
        assert_eq!(routed.value, "B/d1");
        assert_eq!(routed.model_group, "B");
        let log: Vec<(&str, &str)> = routed
            .attempts
            .iter()
            .map(|a| (a.deployment.as_str(), a.outcome()))
            .collect();
        assert_eq!(log, vec![("A/d1", "rate_limit"), ("B/d1", "ok")]);
    }

    #[tokio::test]
    async fn context_overflow_uses_only_context_window_fallbacks() {
        let mut settings = RouterSettings {
            fallbacks: FallbackMap::from([("A", vec!["B".to_string()])]),
            ..RouterSettings::default()
        };
        let router = Router::new(
            vec![group("A", 2), group("B", 1), group("long", 1)],
            settings.clone(),
        )
        .unwrap();
        let result = router
            .route(&RouteRequest::new("A"), |_, _| async {
                Err::<(), _>(err(ErrorKind::ContextOverflow))
            })
            .await
            .unwrap_err();
        assert!(matches!(result, RouterError::Terminal { .. }));
        assert_eq!(result.attempts().len(), 1);

        settings.context_window_fallbacks = FallbackMap::from([("A", vec!["long".to_string()])]);
        router
            .reload(vec![group("A", 2), group("B", 1), group("long", 1)], settings)
            .unwrap();
        let routed = router
            .route(&RouteRequest::new("A"), |deployment, _| async move {
                if deployment.model_group == "long" {
                    Ok(())
                } else {
                    Err(err(ErrorKind::ContextOverflow))
                }
            })
            .await
            .unwrap();
        assert_eq!(routed.model_group, "long");
        assert_eq!(routed.attempts.len(), 2);
    }

    #[tokio::test]
    async fn content_policy_tries_other_deployments_then_its_fallbacks() {
        let settings = RouterSettings {
            content_policy_fallbacks: FallbackMap::from([("A", vec!["safe".to_string()])]),
            ..RouterSettings::default()
        };
        let router = Router::new(vec![group("A", 2), group("safe", 1)], settings).unwrap();
        let routed = router
            .route(&RouteRequest::new("A"), |deployment, _| async move {
                if deployment.model_group == "safe" {
                    Ok(())
                } else {
                    Err(err(ErrorKind::ContentPolicy))
                }
            })
            .await
            .unwrap();
        let groups: Vec<&str> = routed.attempts.iter().map(|a| a.model_group.as_str()).collect();
        assert_eq!(groups, vec!["A", "A", "safe"]);
    }

    #[tokio::test]
    async fn tag_filtering_limits_eligible_deployments() {
        let settings = RouterSettings {
            enable_tag_filtering: true,
            ..RouterSettings::default()
        };
        let group = ModelGroup::new(
            "A",
            vec![
                Deployment::new("A/us", "A", "openai", "m").with_tags(["us"]),
                Deployment::new("A/eu", "A", "openai", "m").with_tags(["eu", "prod"]),
            ],
        );
        let router = Router::new(vec![group], settings).unwrap();
        for _ in 0..5 {
            let routed = router
                .route(
                    &RouteRequest::new("A").with_tags(vec!["eu".to_string()]),
                    |deployment, _| async move { Ok::<_, ProviderError>(deployment.id.clone()) },
                )
                .await
                .unwrap();
            assert_eq!(routed.value, "A/eu");
        }
        let result = router
            .route(
                &RouteRequest::new("A").with_tags(vec!["apac".to_string()]),
                |_, _| async { Ok::<_, ProviderError>(()) },
            )
            .await;
        assert!(matches!(result, Err(RouterError::NoDeployments(_))));
    }

    #[tokio::test]
    async fn cooled_down_deployments_are_skipped() {
        let settings = RouterSettings {
            allowed_fails: 1,
            cooldown_time: 60.0,
            num_retries: 0,
            ..RouterSettings::default()
        };
        let router = Router::new(vec![group("A", 2)], settings).unwrap();
        let calls = Mutex::new(Vec::new());
        let _ = router
            .route(&RouteRequest::new("A"), |deployment, _| {
                calls.lock().unwrap().push(deployment.id.clone());
                async { Err::<(), _>(err(ErrorKind::Upstream5xx)) }
            })
            .await;
        assert_eq!(calls.lock().unwrap().len(), 2);
        let result = router
            .route(&RouteRequest::new("A"), |_, _| async { Ok::<_, ProviderError>(()) })
            .await;
        assert!(matches!(result, Err(RouterError::NoDeployments(_))));
        let snapshot = router.health_snapshot();
        assert!(snapshot.iter().all(|entry| entry.cooling_down));
    }

    #[tokio::test]
    async fn attempt_timeouts_are_classified_as_timeout() {
        let mut settings = RouterSettings {
            num_retries: 0,
            ..RouterSettings::default()
        };
        settings.model_group_retry_policy.insert(
            "A".to_string(),
            GroupRetryPolicy {
                timeout_seconds: Some(0.02),
                ..GroupRetryPolicy::default()
            },
        );
        let router = Router::new(vec![group("A", 1)], settings).unwrap();
        let result = router
            .route(&RouteRequest::new("A"), |_, timeout| async move {
                assert_eq!(timeout, Some(Duration::from_millis(20)));
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ProviderError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(result.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn aliases_resolve_transitively_and_reject_cycles() {
        let mut settings = RouterSettings::default();
        settings
            .model_group_alias
            .insert("best".to_string(), AliasTarget::Group("smart".to_string()));
        settings.model_group_alias.insert(
            "smart".to_string(),
            AliasTarget::Detailed {
                model: "A".to_string(),
                hidden: true,
            },
        );
        let router = Router::new(vec![group("A", 1)], settings.clone()).unwrap();
        assert_eq!(router.resolve("best").unwrap().name, "A");
        let listed: Vec<String> = router.list_models().into_iter().map(|m| m.id).collect();
        assert_eq!(listed, vec!["A".to_string(), "best".to_string()]);

        settings
            .model_group_alias
            .insert("A".to_string(), AliasTarget::Group("best".to_string()));
        assert!(matches!(
            Router::new(vec![group("A", 1)], settings),
            Err(RouterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn wildcard_groups_serve_prefixed_models() {
        let wildcard = ModelGroup::new(
            "openai/*",
            vec![Deployment::new("openai/*/d1", "openai/*", "openai", "*")],
        );
        let router = Router::new(vec![wildcard, group("gpt-4o", 1)], RouterSettings::default()).unwrap();
        let resolved = router.resolve("openai/gpt-4o-mini").unwrap();
        assert_eq!(resolved.name, "openai/*");
        assert_eq!(resolved.deployments[0].model, "gpt-4o-mini");
        assert_eq!(router.resolve("gpt-4o").unwrap().name, "gpt-4o");
        assert!(matches!(
            router.resolve("mystery"),
            Err(RouterError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn rpm_limits_exclude_saturated_deployments() {
        let group = ModelGroup::new(
            "A",
            vec![
                Deployment::new("A/d1", "A", "openai", "m").with_limits(Some(1), None),
                Deployment::new("A/d2", "A", "openai", "m"),
            ],
        );
        let router = Router::new(vec![group], RouterSettings::default()).unwrap();
        router
            .health()
            .get("A/d1")
            .record_usage(health::current_minute(), 1, 0);
        for _ in 0..3 {
            let routed = router
                .route(&RouteRequest::new("A"), |deployment, _| async move {
                    Ok::<_, ProviderError>(deployment.id.clone())
                })
                .await
                .unwrap();
            assert_eq!(routed.value, "A/d2");
        }
    }
}
