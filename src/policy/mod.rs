//! Policies bundle guardrails and an optional pipeline; attachments decide which
//! policies apply to a request.

pub mod attachment;
pub mod engine;
pub mod guardrail;
pub mod inheritance;
pub mod pipeline;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use attachment::{PolicyAttachment, PolicyContext, matching_attachments};
pub use engine::{
    PolicyDecision, PolicyEngine, load_policy_file, post_call_input, pre_call_input,
    spawn_policy_reload,
};
pub use guardrail::{
    FailurePolicy, Guardrail, GuardrailConfig, GuardrailError, GuardrailKind, GuardrailRegistry,
    RegisteredGuardrail, Verdict,
};
pub use inheritance::{MAX_INHERITANCE_DEPTH, effective_guardrails, merge_chain, resolve_chain};
pub use pipeline::{Action, Pipeline, PipelineMode, PipelineOutcome, PipelineRun, PipelineStep};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy inheritance cycle detected: {0}")]
    CycleDetected(String),
    #[error("policy {policy} inherits deeper than {max} levels")]
    DepthExceeded { policy: String, max: usize },
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),
    #[error("policy {policy} references unknown guardrail {guardrail}")]
    UnknownGuardrail { policy: String, guardrail: String },
    #[error("invalid guardrail {name}: {reason}")]
    InvalidGuardrail { name: String, reason: String },
    #[error("failed to read policies from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse policies: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailDelta {
    #[serde(default)]
    pub add: BTreeSet<String>,
    #[serde(default)]
    pub remove: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "parent", skip_serializing_if = "Option::is_none")]
    pub inherit: Option<String>,
    #[serde(default)]
    pub guardrails: GuardrailDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,
}

impl Policy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// The `policies` and `policy_attachments` sections, from the main config or a
/// standalone policies file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub policies: BTreeMap<String, Policy>,
    #[serde(default)]
    pub policy_attachments: Vec<PolicyAttachment>,
}

impl PolicyConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, PolicyError> {
        let mut config: Self = serde_yaml::from_str(raw)?;
        config.normalize();
        Ok(config)
    }

    /// Map keys are authoritative for policy names.
    pub fn normalize(&mut self) {
        for (name, policy) in self.policies.iter_mut() {
            policy.name = name.clone();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty() && self.policy_attachments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policies_keyed_by_name() {
        let config = PolicyConfig::from_yaml(
            r#"
policies:
  base:
    guardrails:
      add: [pii]
  strict:
    inherit: base
    guardrails:
      add: [toxic]
      remove: [pii]
    pipeline:
      mode: pre_call
      steps:
        - guardrail: toxic
          on_fail: modify_response
          modify_response_message: filtered
policy_attachments:
  - policy: strict
    tags: [production]
"#,
        )
        .unwrap();
        let strict = &config.policies["strict"];
        assert_eq!(strict.name, "strict");
        assert_eq!(strict.inherit.as_deref(), Some("base"));
        let pipeline = strict.pipeline.as_ref().unwrap();
        assert_eq!(pipeline.steps[0].on_pass, Action::Next);
        assert_eq!(pipeline.steps[0].on_fail, Action::ModifyResponse);
        assert_eq!(config.policy_attachments[0].tags, vec!["production"]);
    }
}
