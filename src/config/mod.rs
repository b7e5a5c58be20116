//! The YAML proxy config: model list, router and cache settings, guardrails,
//! policies and caller keys.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::CacheParams;
use crate::callbacks::CallbackConfigs;
use crate::policy::{GuardrailConfig, Policy, PolicyAttachment, PolicyConfig};
use crate::providers::{Credentials, ProviderRegistry, split_model};
use crate::router::{AutoRouterConfig, Deployment, FallbackMap, ModelGroup, RouterSettings};
use crate::utils::env::{env_ref_name, resolve_env_ref};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub model_list: Vec<ModelEntry>,
    #[serde(default)]
    pub router_settings: RouterSettings,
    #[serde(default, alias = "litellm_settings")]
    pub tianji_settings: TianjiSettings,
    #[serde(default)]
    pub guardrails: Vec<GuardrailConfig>,
    #[serde(default)]
    pub policies: BTreeMap<String, Policy>,
    #[serde(default)]
    pub policy_attachments: Vec<PolicyAttachment>,
    #[serde(default)]
    pub general_settings: GeneralSettings,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModelEntry {
    pub model_name: String,
    pub litellm_params: LitellmParams,
    #[serde(default)]
    pub tianji_params: TianjiParams,
    #[serde(default)]
    pub model_info: ModelInfo,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Upstream parameters per deployment. String values may be `os.environ/NAME`.
#[derive(Clone, Default, Deserialize)]
pub struct LitellmParams {
    pub model: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_version: Option<serde_yaml::Value>,
    #[serde(default)]
    pub rpm: Option<u64>,
    #[serde(default)]
    pub tpm: Option<u64>,
    #[serde(default)]
    pub weight: Option<f64>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub stream_timeout: Option<f64>,
    #[serde(default)]
    pub input_cost_per_token: Option<f64>,
    #[serde(default)]
    pub output_cost_per_token: Option<f64>,
    #[serde(default)]
    pub aws_region_name: Option<String>,
    #[serde(default)]
    pub vertex_project: Option<String>,
    #[serde(default)]
    pub vertex_location: Option<String>,
    #[serde(default)]
    pub vertex_credentials: Option<String>,
    #[serde(default)]
    pub watsonx_project_id: Option<String>,
    #[serde(default, alias = "headers")]
    pub extra_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl fmt::Debug for LitellmParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LitellmParams")
            .field("model", &self.model)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|key| redact_ref(key)))
            .field("rpm", &self.rpm)
            .field("tpm", &self.tpm)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Env references are safe to print; literal secrets are not.
fn redact_ref(value: &str) -> String {
    match env_ref_name(value) {
        Some(_) => value.trim().to_string(),
        None => "<redacted>".to_string(),
    }
}

/// Gateway-only per-entry settings.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TianjiParams {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub input_cost_per_token: Option<f64>,
    #[serde(default)]
    pub output_cost_per_token: Option<f64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TianjiSettings {
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub cache_params: Option<CacheParams>,
    #[serde(default, alias = "success_callback")]
    pub callbacks: Vec<String>,
    #[serde(default)]
    pub callback_configs: CallbackConfigs,
    #[serde(default)]
    pub fallbacks: FallbackMap,
    #[serde(default)]
    pub default_fallbacks: Vec<String>,
    #[serde(default)]
    pub context_window_fallbacks: FallbackMap,
    #[serde(default)]
    pub content_policy_fallbacks: FallbackMap,
    #[serde(default)]
    pub auto_router: Vec<AutoRouterConfig>,
    /// Overall request deadline in seconds.
    #[serde(default)]
    pub request_timeout: Option<f64>,
}

#[derive(Clone, Default, Deserialize)]
pub struct GeneralSettings {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub master_key: Option<String>,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

impl fmt::Debug for GeneralSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneralSettings")
            .field("port", &self.port)
            .field("master_key", &self.master_key.as_ref().map(|key| redact_ref(key)))
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("keys", &self.keys)
            .finish()
    }
}

/// A verification token accepted on `Authorization: Bearer`.
#[derive(Clone, Default, Deserialize)]
pub struct KeyConfig {
    pub key: String,
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
}

impl fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyConfig")
            .field("key", &redact_ref(&self.key))
            .field("key_id", &self.key_id)
            .field("team_id", &self.team_id)
            .field("tags", &self.tags)
            .field("models", &self.models)
            .field("privileged", &self.privileged)
            .finish()
    }
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn resolve_opt(field: &str, value: &Option<String>) -> Option<String> {
    let raw = value.as_deref()?;
    let resolved = resolve_env_ref(raw);
    if resolved.is_none() {
        if let Some(name) = env_ref_name(raw) {
            tracing::warn!(field, env = name, "config references an unset environment variable");
        }
    }
    resolved
}

fn seconds(value: Option<f64>) -> Option<Duration> {
    value
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
}

impl LitellmParams {
    fn credentials(&self) -> Credentials {
        let mut extra_headers = BTreeMap::new();
        for (name, value) in &self.extra_headers {
            if let Some(value) = resolve_env_ref(value) {
                extra_headers.insert(name.to_ascii_lowercase(), value);
            }
        }
        Credentials {
            api_key: resolve_opt("api_key", &self.api_key),
            api_base: resolve_opt("api_base", &self.api_base),
            api_version: self
                .api_version
                .as_ref()
                .and_then(yaml_scalar)
                .and_then(|version| resolve_env_ref(&version)),
            region: resolve_opt("aws_region_name", &self.aws_region_name),
            project: resolve_opt("vertex_project", &self.vertex_project)
                .or_else(|| resolve_opt("watsonx_project_id", &self.watsonx_project_id)),
            location: resolve_opt("vertex_location", &self.vertex_location),
            credentials_file: resolve_opt("vertex_credentials", &self.vertex_credentials),
            extra_headers,
        }
    }
}

impl ProxyConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    fn normalize(&mut self) {
        for entry in &mut self.model_list {
            entry.model_name = entry.model_name.trim().to_string();
        }
        for (name, policy) in self.policies.iter_mut() {
            policy.name = name.clone();
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (idx, entry) in self.model_list.iter().enumerate() {
            if entry.model_name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "model_list[{idx}] has an empty model_name"
                )));
            }
            if entry.litellm_params.model.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "model_list[{idx}] ({}) has an empty litellm_params.model",
                    entry.model_name
                )));
            }
        }
        let mut ids = std::collections::BTreeSet::new();
        for entry in &self.model_list {
            if let Some(id) = entry.model_info.id.as_deref() {
                if !ids.insert(id) {
                    return Err(ConfigError::Invalid(format!("duplicate model_info.id {id}")));
                }
            }
        }
        let mut auto_routers = std::collections::BTreeSet::new();
        for router in &self.tianji_settings.auto_router {
            if !auto_routers.insert(router.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate auto_router {}",
                    router.name
                )));
            }
        }
        Ok(())
    }

    /// Deployments grouped by `model_name`, in config order. Deployment ids are
    /// `model_info.id` or `{group}/d{n}` numbered from 1 within the group.
    pub fn model_groups(&self, registry: &ProviderRegistry) -> Result<Vec<ModelGroup>, ConfigError> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: BTreeMap<String, (Vec<Deployment>, bool)> = BTreeMap::new();
        for entry in &self.model_list {
            let params = &entry.litellm_params;
            let (provider, model) = split_model(registry, params.model.trim());
            if !registry.contains(&provider) {
                return Err(ConfigError::Invalid(format!(
                    "model {} uses unknown provider {provider}",
                    entry.model_name
                )));
            }
            let slot = groups.entry(entry.model_name.clone()).or_insert_with(|| {
                order.push(entry.model_name.clone());
                (Vec::new(), false)
            });
            let id = entry
                .model_info
                .id
                .clone()
                .unwrap_or_else(|| format!("{}/d{}", entry.model_name, slot.0.len() + 1));
            let mut tags = entry.tags.clone();
            tags.extend(params.tags.iter().cloned());
            tags.extend(entry.tianji_params.tags.iter().cloned());
            tags.sort();
            tags.dedup();

            let mut deployment = Deployment::new(id, entry.model_name.clone(), provider, model)
                .with_credentials(params.credentials())
                .with_tags(tags)
                .with_limits(params.rpm, params.tpm);
            deployment.weight = params.weight;
            deployment.timeout = seconds(params.timeout.or(params.stream_timeout));
            deployment.input_cost_per_token = params
                .input_cost_per_token
                .or(entry.model_info.input_cost_per_token);
            deployment.output_cost_per_token = params
                .output_cost_per_token
                .or(entry.model_info.output_cost_per_token);
            slot.0.push(deployment);
            slot.1 |= entry.model_info.hidden || entry.tianji_params.hidden;
        }
        Ok(order
            .into_iter()
            .filter_map(|name| {
                let (deployments, hidden) = groups.remove(&name)?;
                let mut group = ModelGroup::new(name, deployments);
                group.hidden = hidden;
                Some(group)
            })
            .collect())
    }

    /// `router_settings` with the fallback lists from `tianji_settings` folded in.
    pub fn effective_router_settings(&self) -> RouterSettings {
        let mut settings = self.router_settings.clone();
        let tianji = &self.tianji_settings;
        settings.fallbacks.extend(tianji.fallbacks.clone());
        settings
            .context_window_fallbacks
            .extend(tianji.context_window_fallbacks.clone());
        settings
            .content_policy_fallbacks
            .extend(tianji.content_policy_fallbacks.clone());
        if !tianji.default_fallbacks.is_empty() {
            settings.default_fallbacks = tianji.default_fallbacks.clone();
        }
        if settings.timeout.is_none() {
            settings.timeout = tianji.request_timeout;
        }
        settings
    }

    pub fn policy_config(&self) -> PolicyConfig {
        let mut config = PolicyConfig {
            policies: self.policies.clone(),
            policy_attachments: self.policy_attachments.clone(),
        };
        config.normalize();
        config
    }

    /// The cache to build, if caching is on. `cache: true` alone means a local cache.
    pub fn cache_params(&self) -> Option<CacheParams> {
        match (&self.tianji_settings.cache_params, self.tianji_settings.cache) {
            (Some(params), _) => Some(params.clone()),
            (None, true) => Some(CacheParams::default()),
            (None, false) => None,
        }
    }

    pub fn master_key(&self) -> Option<String> {
        resolve_opt("general_settings.master_key", &self.general_settings.master_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheType;
    use crate::router::RoutingStrategy;

    const SAMPLE: &str = r#"
model_list:
  - model_name: gpt-4o
    litellm_params:
      model: openai/gpt-4o
      api_key: os.environ/TIANJI_TEST_UNSET_KEY
      rpm: 100
      input_cost_per_token: 0.0000025
      output_cost_per_token: 0.00001
  - model_name: gpt-4o
    litellm_params:
      model: azure/gpt-4o
      api_base: https://res.openai.azure.com
      api_key: sk-azure
      api_version: 2024-10-21
    model_info: {id: azure-east}
    tags: [eu]
  - model_name: claude
    litellm_params:
      model: anthropic/claude-3-5-sonnet
      timeout: 20
    model_info: {hidden: true}
router_settings:
  routing_strategy: least-busy
  num_retries: 1
  fallbacks: [{gpt-4o: [claude]}]
tianji_settings:
  cache: true
  cache_params: {type: disk, ttl: 30, disk_cache_dir: /tmp/tianji}
  callbacks: [logger, spend]
  context_window_fallbacks: {gpt-4o: [claude]}
  auto_router:
    - name: x
      default_model: gpt-4o
      embedding_model: text-embedding-3-small
      routes:
        - {name: code, model: claude, examples: ["write python"]}
guardrails:
  - guardrail_name: pii
    guardrail: pii
policies:
  base:
    guardrails: {add: [pii]}
policy_attachments:
  - {policy: base, scope: "*"}
general_settings:
  master_key: sk-master
  keys:
    - {key: sk-team, key_id: k1, team_id: t1, tags: [production]}
"#;

    #[test]
    fn parses_every_section() {
        let config = ProxyConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.model_list.len(), 3);
        assert_eq!(
            config.router_settings.routing_strategy,
            RoutingStrategy::LeastBusy
        );
        assert!(config.tianji_settings.cache);
        assert_eq!(config.cache_params().unwrap().kind, CacheType::Disk);
        assert_eq!(config.tianji_settings.callbacks, vec!["logger", "spend"]);
        assert_eq!(config.tianji_settings.auto_router[0].threshold, 0.5);
        assert_eq!(config.guardrails[0].guardrail_name, "pii");
        assert_eq!(config.policy_config().policies["base"].name, "base");
        assert_eq!(config.master_key().as_deref(), Some("sk-master"));
        assert_eq!(config.general_settings.keys[0].team_id.as_deref(), Some("t1"));
    }

    #[test]
    fn builds_groups_with_stable_ids_and_resolved_credentials() {
        let config = ProxyConfig::from_yaml(SAMPLE).unwrap();
        let groups = config.model_groups(&ProviderRegistry::default()).unwrap();
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["gpt-4o", "claude"]);

        let gpt = &groups[0];
        assert_eq!(gpt.deployments[0].id, "gpt-4o/d1");
        assert_eq!(gpt.deployments[0].provider, "openai");
        assert_eq!(gpt.deployments[0].rpm, Some(100));
        assert!(gpt.deployments[0].credentials.api_key.is_none());
        assert_eq!(gpt.deployments[1].id, "azure-east");
        assert_eq!(gpt.deployments[1].provider, "azure");
        assert_eq!(gpt.deployments[1].credentials.api_version.as_deref(), Some("2024-10-21"));
        assert_eq!(gpt.deployments[1].tags, vec!["eu"]);

        let claude = &groups[1];
        assert!(claude.hidden);
        assert_eq!(claude.deployments[0].timeout, Some(Duration::from_secs(20)));
    }

    #[test]
    fn tianji_fallbacks_fold_into_router_settings() {
        let config = ProxyConfig::from_yaml(SAMPLE).unwrap();
        let settings = config.effective_router_settings();
        assert_eq!(settings.fallbacks.get("gpt-4o"), ["claude".to_string()]);
        assert_eq!(
            settings.context_window_fallbacks.get("gpt-4o"),
            ["claude".to_string()]
        );
    }

    #[test]
    fn rejects_empty_names_and_duplicate_ids() {
        let empty = "model_list:\n  - model_name: ' '\n    litellm_params: {model: gpt-4o}\n";
        assert!(matches!(ProxyConfig::from_yaml(empty), Err(ConfigError::Invalid(_))));
        let dup = r#"
model_list:
  - {model_name: a, litellm_params: {model: gpt-4o}, model_info: {id: x}}
  - {model_name: b, litellm_params: {model: gpt-4o}, model_info: {id: x}}
"#;
        assert!(matches!(ProxyConfig::from_yaml(dup), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn debug_output_hides_literal_secrets() {
        let config = ProxyConfig::from_yaml(SAMPLE).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk-azure"));
        assert!(!debug.contains("sk-master"));
        assert!(!debug.contains("sk-team"));
        assert!(debug.contains("os.environ/TIANJI_TEST_UNSET_KEY"));
    }
}
