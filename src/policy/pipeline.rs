//! Step-by-step guardrail execution with pass/fail branching.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::guardrail::{GuardrailRegistry, Verdict};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    #[default]
    PreCall,
    PostCall,
}

/// What a step does after its guardrail returns. Unrecognized names block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Allow,
    Block,
    ModifyResponse,
    Next,
    Unknown(String),
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "allow" => Self::Allow,
            "block" => Self::Block,
            "modify_response" => Self::ModifyResponse,
            "next" => Self::Next,
            _ => Self::Unknown(value),
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Allow => "allow".to_string(),
            Action::Block => "block".to_string(),
            Action::ModifyResponse => "modify_response".to_string(),
            Action::Next => "next".to_string(),
            Action::Unknown(raw) => raw,
        }
    }
}

fn default_on_pass() -> Action {
    Action::Next
}

fn default_on_fail() -> Action {
    Action::Block
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub guardrail: String,
    #[serde(default = "default_on_pass")]
    pub on_pass: Action,
    #[serde(default = "default_on_fail")]
    pub on_fail: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify_response_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_message: Option<String>,
    #[serde(default)]
    pub pass_data: bool,
}

impl PipelineStep {
    pub fn new(guardrail: impl Into<String>, on_pass: Action, on_fail: Action) -> Self {
        Self {
            guardrail: guardrail.into(),
            on_pass,
            on_fail,
            modify_response_message: None,
            block_message: None,
            pass_data: false,
        }
    }

    pub fn with_modify_response_message(mut self, message: impl Into<String>) -> Self {
        self.modify_response_message = Some(message.into());
        self
    }

    pub fn with_pass_data(mut self) -> Self {
        self.pass_data = true;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub mode: PipelineMode,
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    Allow,
    Block { guardrail: String, message: String },
    ModifyResponse { guardrail: String, message: String },
}

impl PipelineOutcome {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepTrace {
    pub guardrail: String,
    pub passed: bool,
    pub action: Action,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineRun {
    pub outcome: PipelineOutcome,
    pub trace: Vec<StepTrace>,
}

fn block_message(step: &PipelineStep, verdict: &Verdict) -> String {
    if let Some(message) = step.block_message.clone() {
        return message;
    }
    match verdict.reason.as_deref() {
        Some(reason) => format!("Request blocked by guardrail {}: {reason}", step.guardrail),
        None => format!("Request blocked by guardrail {}", step.guardrail),
    }
}

impl Pipeline {
    /// Runs the steps over a working copy of `input`. A guardrail missing from
    /// `registry` counts as failed.
    pub async fn run(&self, registry: &GuardrailRegistry, input: &Map<String, Value>) -> PipelineRun {
        let mut working = input.clone();
        let mut trace = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let verdict = match registry.get(&step.guardrail) {
                Some(guardrail) => guardrail.invoke(&working).await,
                None => {
                    tracing::warn!(guardrail = %step.guardrail, "pipeline step names an unknown guardrail");
                    Verdict::fail(format!("unknown_guardrail:{}", step.guardrail))
                }
            };
            let action = if verdict.passed {
                step.on_pass.clone()
            } else {
                step.on_fail.clone()
            };
            trace.push(StepTrace {
                guardrail: step.guardrail.clone(),
                passed: verdict.passed,
                action: action.clone(),
            });
            tracing::debug!(guardrail = %step.guardrail, passed = verdict.passed, ?action, "pipeline step");
            let outcome = match action {
                Action::Allow => PipelineOutcome::Allow,
                Action::ModifyResponse => PipelineOutcome::ModifyResponse {
                    guardrail: step.guardrail.clone(),
                    message: step.modify_response_message.clone().unwrap_or_default(),
                },
                Action::Next => {
                    if step.pass_data {
                        working.insert("_prev_result".to_string(), Value::Bool(verdict.passed));
                    }
                    continue;
                }
                Action::Block | Action::Unknown(_) => PipelineOutcome::Block {
                    guardrail: step.guardrail.clone(),
                    message: block_message(step, &verdict),
                },
            };
            return PipelineRun { outcome, trace };
        }
        PipelineRun {
            outcome: PipelineOutcome::Allow,
            trace,
        }
    }
}
