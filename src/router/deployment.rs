use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::providers::Credentials;

/// One upstream endpoint serving one model.
#[derive(Clone, Debug)]
pub struct Deployment {
    /// Stable within the process; `model_info.id` or `{group}/d{n}`.
    pub id: String,
    pub model_group: String,
    pub provider: String,
    /// Provider-side model id. `*` takes the suffix of a wildcard request.
    pub model: String,
    pub credentials: Credentials,
    pub rpm: Option<u64>,
    pub tpm: Option<u64>,
    pub weight: Option<f64>,
    pub tags: Vec<String>,
    pub timeout: Option<Duration>,
    pub input_cost_per_token: Option<f64>,
    pub output_cost_per_token: Option<f64>,
}

impl Deployment {
    pub fn new(
        id: impl Into<String>,
        model_group: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            model_group: model_group.into(),
            provider: provider.into(),
            model: model.into(),
            credentials: Credentials::default(),
            rpm: None,
            tpm: None,
            weight: None,
            tags: Vec::new(),
            timeout: None,
            input_cost_per_token: None,
            output_cost_per_token: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_limits(mut self, rpm: Option<u64>, tpm: Option<u64>) -> Self {
        self.rpm = rpm;
        self.tpm = tpm;
        self
    }

    pub fn with_costs(mut self, input: f64, output: f64) -> Self {
        self.input_cost_per_token = Some(input);
        self.output_cost_per_token = Some(output);
        self
    }

    /// Selection weight for the shuffle strategy: `weight`, then `rpm`, then `tpm`, then 1.
    pub fn selection_weight(&self) -> f64 {
        self.weight
            .or(self.rpm.map(|rpm| rpm as f64))
            .or(self.tpm.map(|tpm| tpm as f64))
            .filter(|weight| weight.is_finite() && *weight >= 0.0)
            .unwrap_or(1.0)
    }

    /// Input plus output price per token; `None` when either side is unknown.
    pub fn unit_cost(&self) -> Option<f64> {
        Some(self.input_cost_per_token? + self.output_cost_per_token?)
    }

    pub fn cost_of(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        self.input_cost_per_token.unwrap_or(0.0) * prompt_tokens as f64
            + self.output_cost_per_token.unwrap_or(0.0) * completion_tokens as f64
    }

    /// The deployment a wildcard group serves for `requested` (`openai/*` + `openai/gpt-4o`).
    pub(crate) fn for_wildcard(&self, suffix: &str) -> Self {
        let mut deployment = self.clone();
        if deployment.model.ends_with('*') {
            let prefix = deployment.model.trim_end_matches('*');
            deployment.model = format!("{prefix}{suffix}");
        }
        deployment
    }
}

/// A logical model name backed by interchangeable deployments.
#[derive(Clone, Debug)]
pub struct ModelGroup {
    pub name: String,
    pub deployments: Vec<Arc<Deployment>>,
    pub hidden: bool,
}

impl ModelGroup {
    pub fn new(name: impl Into<String>, deployments: Vec<Deployment>) -> Self {
        Self {
            name: name.into(),
            deployments: deployments.into_iter().map(Arc::new).collect(),
            hidden: false,
        }
    }

    /// `openai/*` style groups answer any model with that prefix.
    pub fn wildcard_prefix(&self) -> Option<&str> {
        self.name.strip_suffix('*')
    }
}

/// Public view of a deployment for `/v1/models` and health output; no credentials.
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentInfo {
    pub id: String,
    pub model_group: String,
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl From<&Deployment> for DeploymentInfo {
    fn from(deployment: &Deployment) -> Self {
        Self {
            id: deployment.id.clone(),
            model_group: deployment.model_group.clone(),
            provider: deployment.provider.clone(),
            model: deployment.model.clone(),
            tags: deployment.tags.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_weight_prefers_explicit_weight_then_rpm() {
        let deployment = Deployment::new("a", "g", "openai", "gpt-4o");
        assert_eq!(deployment.selection_weight(), 1.0);
        let deployment = deployment.with_limits(Some(600), None);
        assert_eq!(deployment.selection_weight(), 600.0);
        let deployment = deployment.with_weight(2.5);
        assert_eq!(deployment.selection_weight(), 2.5);
    }

    #[test]
    fn wildcard_deployments_take_the_requested_suffix() {
        let template = Deployment::new("w", "openai/*", "openai", "*");
        assert_eq!(template.for_wildcard("gpt-4o-mini").model, "gpt-4o-mini");
        let prefixed = Deployment::new("w", "acme/*", "openai", "acme-*");
        assert_eq!(prefixed.for_wildcard("large").model, "acme-large");
    }
}
