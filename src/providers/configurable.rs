//! Declarative OpenAI-compatible providers loaded from the providers JSON sidecar.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::openai_compatible::{Capabilities, ProviderProfile, UrlStyle};
pub use super::openai_compatible::ParamConstraint;
use crate::config::ConfigError;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProvidersFile {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderProfileConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderProfileConfig {
    pub base_url: String,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    #[serde(default = "default_auth_prefix")]
    pub auth_prefix: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub supported_params: Option<Vec<String>>,
    #[serde(default)]
    pub param_mappings: BTreeMap<String, String>,
    #[serde(default)]
    pub constraints: Vec<ParamConstraint>,
    #[serde(default)]
    pub max_completion_tokens: bool,
    #[serde(default)]
    pub embeddings: bool,
}

fn default_auth_header() -> String {
    "authorization".to_string()
}

fn default_auth_prefix() -> String {
    "Bearer ".to_string()
}

impl ProvidersFile {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn into_profiles(self) -> Result<Vec<ProviderProfile>, ConfigError> {
        self.providers
            .into_iter()
            .map(|(name, config)| config.into_profile(name))
            .collect()
    }
}

impl ProviderProfileConfig {
    pub fn into_profile(self, name: String) -> Result<ProviderProfile, ConfigError> {
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "providers JSON contains an empty provider name".to_string(),
            ));
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "provider {name} is missing base_url"
            )));
        }
        for constraint in &self.constraints {
            if let (Some(min), Some(max)) = (constraint.min, constraint.max) {
                if min > max {
                    return Err(ConfigError::Invalid(format!(
                        "provider {name} constraint on {} has min > max",
                        constraint.param
                    )));
                }
            }
        }

        // A bare "Token" or "Bearer" prefix still needs the separating space.
        let mut auth_prefix = self.auth_prefix;
        if !auth_prefix.is_empty() && !auth_prefix.ends_with(' ') {
            auth_prefix.push(' ');
        }

        let api_key_env = self
            .api_key_env
            .into_iter()
            .chain(std::iter::once(format!(
                "{}_API_KEY",
                name.to_ascii_uppercase().replace(['-', '.'], "_")
            )))
            .collect();

        Ok(ProviderProfile {
            base_url: self.base_url,
            base_url_env: None,
            auth_header: self.auth_header,
            auth_prefix,
            api_key_env,
            extra_headers: self.headers,
            supported_params: self
                .supported_params
                .map(|params| params.into_iter().collect()),
            param_mappings: self.param_mappings,
            constraints: self.constraints,
            url_style: UrlStyle::Base,
            knows_max_completion_tokens: self.max_completion_tokens,
            capabilities: Capabilities {
                embeddings: self.embeddings,
                ..Capabilities::CHAT_ONLY
            },
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Credentials, OpenAICompatible, ProviderAdapter};
    use crate::types::{ChatCompletionRequest, ChatMessage};

    const RAW: &str = r#"{
        "providers": {
            "acme": {
                "base_url": "https://llm.acme.dev/v1",
                "auth_header": "Authorization",
                "auth_prefix": "Token",
                "headers": {"x-acme-tenant": "t1"},
                "supported_params": ["temperature", "max_tokens"],
                "param_mappings": {"max_tokens": "max_new_tokens"},
                "constraints": [{"param": "temperature", "min": 0.0, "max": 1.0}]
            }
        }
    }"#;

    #[tokio::test]
    async fn json_profile_onboards_a_provider_without_code() {
        let profiles = ProvidersFile::from_json(RAW).unwrap().into_profiles().unwrap();
        let adapter = OpenAICompatible::new(profiles.into_iter().next().unwrap());
        assert_eq!(adapter.provider(), "acme");

        let mut request = ChatCompletionRequest::new("acme-large", vec![ChatMessage::user("hi")]);
        request.temperature = Some(1.7);
        request.max_completion_tokens = Some(32);
        request.seed = Some(9);
        let upstream = adapter
            .build_request(
                &request,
                "acme-large",
                &Credentials {
                    api_key: Some("tok".to_string()),
                    ..Credentials::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(upstream.url, "https://llm.acme.dev/v1/chat/completions");
        assert_eq!(upstream.headers["authorization"], "Token tok");
        assert_eq!(upstream.headers["x-acme-tenant"], "t1");
        let body = upstream.body_json().unwrap();
        assert_eq!(body["temperature"], 1.0);
        assert_eq!(body["max_new_tokens"], 32);
        assert!(body.get("seed").is_none());
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn rejects_inverted_constraints() {
        let raw = r#"{"providers":{"bad":{"base_url":"https://x","constraints":[{"param":"top_p","min":1.0,"max":0.0}]}}}"#;
        let err = ProvidersFile::from_json(raw)
            .unwrap()
            .into_profiles()
            .unwrap_err();
        assert!(err.to_string().contains("min > max"));
    }
}
