use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::attachment::{PolicyContext, matching_attachments};
use super::guardrail::GuardrailRegistry;
use super::inheritance::effective_guardrails;
use super::pipeline::{Action, Pipeline, PipelineMode, PipelineOutcome, PipelineStep, StepTrace};
use super::{PolicyConfig, PolicyError};
use crate::utils::hash64_fnv1a;

pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct PolicySnapshot {
    config: PolicyConfig,
    effective: BTreeMap<String, BTreeSet<String>>,
}

impl PolicySnapshot {
    fn build(mut config: PolicyConfig, registry: &GuardrailRegistry) -> Result<Self, PolicyError> {
        config.normalize();
        let mut effective = BTreeMap::new();
        for (name, policy) in &config.policies {
            let guardrails = effective_guardrails(&config.policies, name)?;
            let steps = policy.pipeline.iter().flat_map(|pipeline| &pipeline.steps);
            for guardrail in guardrails.iter().chain(steps.map(|step| &step.guardrail)) {
                if !registry.contains(guardrail) {
                    return Err(PolicyError::UnknownGuardrail {
                        policy: name.clone(),
                        guardrail: guardrail.clone(),
                    });
                }
            }
            effective.insert(name.clone(), guardrails);
        }
        for attachment in &config.policy_attachments {
            if !config.policies.contains_key(&attachment.policy) {
                return Err(PolicyError::UnknownPolicy(attachment.policy.clone()));
            }
        }
        Ok(Self { config, effective })
    }
}

/// Outcome of every policy that applied to a request in one phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyDecision {
    pub outcome: PipelineOutcome,
    /// Policy that produced a non-allow outcome.
    pub policy: Option<String>,
    pub evaluated: Vec<String>,
    pub trace: Vec<StepTrace>,
}

impl PolicyDecision {
    fn allow(evaluated: Vec<String>, trace: Vec<StepTrace>) -> Self {
        Self {
            outcome: PipelineOutcome::Allow,
            policy: None,
            evaluated,
            trace,
        }
    }
}

/// Input map for pre-call checks.
pub fn pre_call_input(text: &str, model: &str) -> Map<String, Value> {
    let mut input = Map::new();
    input.insert("text".to_string(), Value::String(text.to_string()));
    input.insert("model".to_string(), Value::String(model.to_string()));
    input
}

/// Input map for post-call checks.
pub fn post_call_input(response: &str, model: &str) -> Map<String, Value> {
    let mut input = Map::new();
    input.insert("response".to_string(), Value::String(response.to_string()));
    input.insert("model".to_string(), Value::String(model.to_string()));
    input
}

/// Evaluates matched policies against the current snapshot. Reloads swap the
/// snapshot; evaluations in progress keep the one they started with.
#[derive(Debug)]
pub struct PolicyEngine {
    registry: Arc<GuardrailRegistry>,
    snapshot: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyEngine {
    pub fn new(registry: Arc<GuardrailRegistry>, config: PolicyConfig) -> Result<Self, PolicyError> {
        let snapshot = PolicySnapshot::build(config, &registry)?;
        Ok(Self {
            registry,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn registry(&self) -> &Arc<GuardrailRegistry> {
        &self.registry
    }

    fn snapshot(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Validates and publishes `config`. On error the previous snapshot stays live.
    pub fn reload(&self, config: PolicyConfig) -> Result<(), PolicyError> {
        let snapshot = PolicySnapshot::build(config, &self.registry)?;
        let policies = snapshot.config.policies.len();
        let attachments = snapshot.config.policy_attachments.len();
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
        tracing::info!(policies, attachments, "policies reloaded");
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().config.is_empty()
    }

    /// Names of matching policies, sorted and deduplicated.
    pub fn matching_policies(&self, ctx: &PolicyContext) -> Vec<String> {
        Self::matching_in(&self.snapshot(), ctx)
    }

    fn matching_in(snapshot: &PolicySnapshot, ctx: &PolicyContext) -> Vec<String> {
        matching_attachments(&snapshot.config.policy_attachments, ctx)
            .into_iter()
            .map(|attachment| attachment.policy.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn effective_guardrails(&self, policy: &str) -> Option<BTreeSet<String>> {
        self.snapshot().effective.get(policy).cloned()
    }

    /// Runs each matching policy for `mode` in name order. The first non-allow
    /// outcome wins.
    pub async fn evaluate(
        &self,
        ctx: &PolicyContext,
        mode: PipelineMode,
        input: &Map<String, Value>,
    ) -> PolicyDecision {
        let snapshot = self.snapshot();
        let matched = Self::matching_in(&snapshot, ctx);
        let mut trace = Vec::new();
        for name in &matched {
            let Some(pipeline) = self.pipeline_for(&snapshot, name, mode) else {
                continue;
            };
            let run = pipeline.run(&self.registry, input).await;
            trace.extend(run.trace);
            if !run.outcome.is_allow() {
                tracing::info!(policy = %name, outcome = ?run.outcome, "policy intervened");
                return PolicyDecision {
                    outcome: run.outcome,
                    policy: Some(name.clone()),
                    evaluated: matched,
                    trace,
                };
            }
        }
        PolicyDecision::allow(matched, trace)
    }

    /// The policy's own pipeline when it targets `mode`; otherwise its effective
    /// guardrails for `mode`, each blocking on failure.
    fn pipeline_for(&self, snapshot: &PolicySnapshot, name: &str, mode: PipelineMode) -> Option<Pipeline> {
        let policy = snapshot.config.policies.get(name)?;
        if let Some(pipeline) = policy.pipeline.as_ref() {
            return (pipeline.mode == mode).then(|| pipeline.clone());
        }
        let steps: Vec<PipelineStep> = snapshot
            .effective
            .get(name)?
            .iter()
            .filter(|guardrail| {
                self.registry
                    .get(guardrail)
                    .is_some_and(|registered| registered.mode == mode)
            })
            .map(|guardrail| PipelineStep::new(guardrail.clone(), Action::Next, Action::Block))
            .collect();
        (!steps.is_empty()).then_some(Pipeline { mode, steps })
    }
}

pub async fn load_policy_file(path: &Path) -> Result<PolicyConfig, PolicyError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| PolicyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    PolicyConfig::from_yaml(&raw)
}

/// Re-reads `path` every `interval` and reloads `engine` when the file changed.
/// Bad files are logged and skipped.
pub fn spawn_policy_reload(
    engine: Arc<PolicyEngine>,
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_hash = tokio::fs::read(&path)
            .await
            .ok()
            .map(|raw| hash64_fnv1a(&raw));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to read policies file");
                    continue;
                }
            };
            let hash = hash64_fnv1a(&raw);
            if last_hash == Some(hash) {
                continue;
            }
            let result = std::str::from_utf8(&raw)
                .map_err(|err| PolicyError::Read {
                    path: path.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
                })
                .and_then(PolicyConfig::from_yaml)
                .and_then(|config| engine.reload(config));
            match result {
                Ok(()) => last_hash = Some(hash),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "keeping previous policies");
                }
            }
        }
    })
}
