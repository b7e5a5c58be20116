use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::pipeline::PipelineMode;
use super::PolicyError;

#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("guardrail request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("guardrail endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },
    #[error("guardrail failed: {0}")]
    Other(String),
}

/// Result of one guardrail check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// A content check over a pipeline input map. Pre-call inputs carry `text` and
/// `model`; post-call inputs carry `response`.
#[async_trait]
pub trait Guardrail: Send + Sync + fmt::Debug {
    async fn check(&self, input: &Map<String, Value>) -> Result<Verdict, GuardrailError>;
}

/// Text under inspection: the response when present, else the request text.
pub fn input_text(input: &Map<String, Value>) -> &str {
    input
        .get("response")
        .or_else(|| input.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    FailOpen,
    #[default]
    FailClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiEntity {
    Email,
    Ssn,
}

fn default_pii_entities() -> Vec<PiiEntity> {
    vec![PiiEntity::Email, PiiEntity::Ssn]
}

/// Built-in guardrail kinds, selected by the `guardrail` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "guardrail", rename_all = "snake_case")]
pub enum GuardrailKind {
    BannedPhrases {
        #[serde(default)]
        phrases: Vec<String>,
    },
    BannedRegexes {
        #[serde(default)]
        patterns: Vec<String>,
    },
    Pii {
        #[serde(default = "default_pii_entities")]
        entities: Vec<PiiEntity>,
    },
    MaxInputChars {
        max_chars: usize,
    },
    ModelAllowlist {
        #[serde(default)]
        models: Vec<String>,
    },
    /// External check: POSTs the input map, expects `{passed, reason?}`.
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuardrailConfig {
    pub guardrail_name: String,
    #[serde(flatten)]
    pub kind: GuardrailKind,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub mode: PipelineMode,
}

#[derive(Debug)]
struct BannedPhrases(Vec<String>);

#[async_trait]
impl Guardrail for BannedPhrases {
    async fn check(&self, input: &Map<String, Value>) -> Result<Verdict, GuardrailError> {
        let content = input_text(input).to_lowercase();
        Ok(self
            .0
            .iter()
            .find(|phrase| content.contains(phrase.as_str()))
            .map_or_else(Verdict::pass, |phrase| Verdict::fail(format!("banned_phrase:{phrase}"))))
    }
}

#[derive(Debug)]
struct BannedRegexes(Vec<Regex>);

#[async_trait]
impl Guardrail for BannedRegexes {
    async fn check(&self, input: &Map<String, Value>) -> Result<Verdict, GuardrailError> {
        let text = input_text(input);
        Ok(self
            .0
            .iter()
            .find(|regex| regex.is_match(text))
            .map_or_else(Verdict::pass, |regex| {
                Verdict::fail(format!("banned_regex:{}", regex.as_str()))
            }))
    }
}

fn email_pii_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        RegexBuilder::new(r"\b[A-Z0-9._%+\-]+@[A-Z0-9.\-]+\.[A-Z]{2,}\b")
            .case_insensitive(true)
            .build()
            .expect("email regex is valid")
    })
}

fn ssn_pii_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn regex is valid"))
}

#[derive(Debug)]
struct Pii(Vec<PiiEntity>);

#[async_trait]
impl Guardrail for Pii {
    async fn check(&self, input: &Map<String, Value>) -> Result<Verdict, GuardrailError> {
        let text = input_text(input);
        for entity in &self.0 {
            let (regex, label) = match entity {
                PiiEntity::Email => (email_pii_regex(), "pii:email"),
                PiiEntity::Ssn => (ssn_pii_regex(), "pii:ssn"),
            };
            if regex.is_match(text) {
                return Ok(Verdict::fail(label));
            }
        }
        Ok(Verdict::pass())
    }
}

#[derive(Debug)]
struct MaxInputChars(usize);

#[async_trait]
impl Guardrail for MaxInputChars {
    async fn check(&self, input: &Map<String, Value>) -> Result<Verdict, GuardrailError> {
        let chars = input_text(input).chars().count();
        Ok(if chars > self.0 {
            Verdict::fail(format!("input_chars>{}", self.0))
        } else {
            Verdict::pass()
        })
    }
}

/// `prefix*` matches by prefix; anything else matches exactly.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => value == pattern,
    }
}

#[derive(Debug)]
struct ModelAllowlist(Vec<String>);

#[async_trait]
impl Guardrail for ModelAllowlist {
    async fn check(&self, input: &Map<String, Value>) -> Result<Verdict, GuardrailError> {
        let model = input.get("model").and_then(Value::as_str).unwrap_or_default();
        Ok(if self.0.iter().any(|pattern| pattern_matches(pattern, model)) {
            Verdict::pass()
        } else {
            Verdict::fail(format!("model_not_allowed:{model}"))
        })
    }
}

struct Webhook {
    http: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl fmt::Debug for Webhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Webhook").field("url", &self.url).finish_non_exhaustive()
    }
}

#[async_trait]
impl Guardrail for Webhook {
    async fn check(&self, input: &Map<String, Value>) -> Result<Verdict, GuardrailError> {
        let mut request = self.http.post(&self.url).json(input);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GuardrailError::Endpoint {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<Verdict>().await?)
    }
}

/// A guardrail with its configured failure policy applied to internal errors.
#[derive(Clone, Debug)]
pub struct RegisteredGuardrail {
    pub name: String,
    pub mode: PipelineMode,
    pub failure_policy: FailurePolicy,
    handler: Arc<dyn Guardrail>,
}

impl RegisteredGuardrail {
    pub fn new(name: impl Into<String>, handler: Arc<dyn Guardrail>) -> Self {
        Self {
            name: name.into(),
            mode: PipelineMode::PreCall,
            failure_policy: FailurePolicy::FailClosed,
            handler,
        }
    }

    pub fn with_mode(mut self, mode: PipelineMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Errors pass under `fail_open` and fail under `fail_closed`.
    pub async fn invoke(&self, input: &Map<String, Value>) -> Verdict {
        match self.handler.check(input).await {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(
                    guardrail = %self.name,
                    failure_policy = ?self.failure_policy,
                    error = %err,
                    "guardrail errored"
                );
                match self.failure_policy {
                    FailurePolicy::FailOpen => Verdict::pass(),
                    FailurePolicy::FailClosed => Verdict::fail(format!("guardrail_error:{}", self.name)),
                }
            }
        }
    }
}

/// Guardrails by name, built once at startup.
#[derive(Clone, Debug, Default)]
pub struct GuardrailRegistry {
    guardrails: BTreeMap<String, RegisteredGuardrail>,
}

impl GuardrailRegistry {
    pub fn from_configs(
        configs: &[GuardrailConfig],
        http: &reqwest::Client,
    ) -> Result<Self, PolicyError> {
        let mut registry = Self::default();
        for config in configs {
            let handler = build_handler(config, http)?;
            registry.register(
                RegisteredGuardrail::new(config.guardrail_name.clone(), handler)
                    .with_mode(config.mode)
                    .with_failure_policy(config.failure_policy),
            );
        }
        Ok(registry)
    }

    pub fn register(&mut self, guardrail: RegisteredGuardrail) {
        self.guardrails.insert(guardrail.name.clone(), guardrail);
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredGuardrail> {
        self.guardrails.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.guardrails.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.guardrails.keys().map(String::as_str)
    }
}

fn build_handler(config: &GuardrailConfig, http: &reqwest::Client) -> Result<Arc<dyn Guardrail>, PolicyError> {
    let invalid = |reason: String| PolicyError::InvalidGuardrail {
        name: config.guardrail_name.clone(),
        reason,
    };
    Ok(match &config.kind {
        GuardrailKind::BannedPhrases { phrases } => Arc::new(BannedPhrases(
            phrases
                .iter()
                .map(|phrase| phrase.trim().to_lowercase())
                .filter(|phrase| !phrase.is_empty())
                .collect(),
        )),
        GuardrailKind::BannedRegexes { patterns } => {
            let mut compiled = Vec::with_capacity(patterns.len());
            for pattern in patterns.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
                compiled.push(
                    RegexBuilder::new(pattern)
                        .case_insensitive(true)
                        .build()
                        .map_err(|err| invalid(format!("invalid banned_regex {pattern}: {err}")))?,
                );
            }
            Arc::new(BannedRegexes(compiled))
        }
        GuardrailKind::Pii { entities } => Arc::new(Pii(entities.clone())),
        GuardrailKind::MaxInputChars { max_chars } => Arc::new(MaxInputChars(*max_chars)),
        GuardrailKind::ModelAllowlist { models } => {
            if models.is_empty() {
                return Err(invalid("model_allowlist needs at least one model".to_string()));
            }
            Arc::new(ModelAllowlist(models.clone()))
        }
        GuardrailKind::Webhook { url, headers } => {
            url::Url::parse(url).map_err(|err| invalid(format!("invalid webhook url: {err}")))?;
            Arc::new(Webhook {
                http: http.clone(),
                url: url.clone(),
                headers: headers.clone(),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_support::should_skip_httpmock;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    fn registry(yaml: &str) -> GuardrailRegistry {
        let configs: Vec<GuardrailConfig> = serde_yaml::from_str(yaml).unwrap();
        GuardrailRegistry::from_configs(&configs, &reqwest::Client::new()).unwrap()
    }

    fn text(value: &str) -> Map<String, Value> {
        json!({"text": value, "model": "gpt-4o"}).as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn builtins_detect_their_content() {
        let registry = registry(
            r#"
- guardrail_name: words
  guardrail: banned_phrases
  phrases: ["Secret Plan"]
- guardrail_name: ids
  guardrail: banned_regexes
  patterns: ['\bACCT-\d+\b']
- guardrail_name: pii
  guardrail: pii
- guardrail_name: short
  guardrail: max_input_chars
  max_chars: 10
- guardrail_name: models
  guardrail: model_allowlist
  models: ["gpt-*"]
"#,
        );
        let check = |name: &str, input: Map<String, Value>| {
            let guardrail = registry.get(name).unwrap().clone();
            async move { guardrail.invoke(&input).await }
        };
        assert!(!check("words", text("the secret plan")).await.passed);
        assert!(check("words", text("the plan")).await.passed);
        assert!(!check("ids", text("see acct-42")).await.passed);
        assert_eq!(
            check("pii", text("mail a@b.io")).await.reason.as_deref(),
            Some("pii:email")
        );
        assert_eq!(
            check("pii", text("ssn 123-45-6789")).await.reason.as_deref(),
            Some("pii:ssn")
        );
        assert!(!check("short", text("01234567890")).await.passed);
        assert!(check("models", text("")).await.passed);
        let mut claude = text("");
        claude.insert("model".into(), json!("claude-3"));
        assert!(!check("models", claude).await.passed);
    }

    #[tokio::test]
    async fn post_call_checks_read_the_response() {
        let registry = registry("- {guardrail_name: words, guardrail: banned_phrases, phrases: [bad], mode: post_call}");
        let guardrail = registry.get("words").unwrap();
        assert_eq!(guardrail.mode, PipelineMode::PostCall);
        let input = json!({"response": "a bad answer"}).as_object().unwrap().clone();
        assert!(!guardrail.invoke(&input).await.passed);
    }

    #[test]
    fn invalid_regex_is_rejected_at_load() {
        let configs: Vec<GuardrailConfig> =
            serde_yaml::from_str("- {guardrail_name: r, guardrail: banned_regexes, patterns: ['(']}").unwrap();
        let err = GuardrailRegistry::from_configs(&configs, &reqwest::Client::new()).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidGuardrail { .. }));
    }

    #[tokio::test]
    async fn failure_policy_decides_on_errors() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/check");
                then.status(500).body("down");
            })
            .await;
        let yaml = format!(
            "- {{guardrail_name: open, guardrail: webhook, url: '{url}', failure_policy: fail_open}}\n- {{guardrail_name: closed, guardrail: webhook, url: '{url}'}}",
            url = server.url("/check")
        );
        let registry = registry(&yaml);
        assert!(registry.get("open").unwrap().invoke(&text("x")).await.passed);
        let closed = registry.get("closed").unwrap().invoke(&text("x")).await;
        assert!(!closed.passed);
        assert_eq!(closed.reason.as_deref(), Some("guardrail_error:closed"));
    }

    #[tokio::test]
    async fn webhook_verdicts_are_returned() {
        if should_skip_httpmock() {
            return;
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/check").body_includes("\"text\":\"hello\"");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"passed":false,"reason":"toxic"}"#);
            })
            .await;
        let yaml = format!(
            "- {{guardrail_name: ext, guardrail: webhook, url: '{}'}}",
            server.url("/check")
        );
        let verdict = registry(&yaml).get("ext").unwrap().invoke(&text("hello")).await;
        assert_eq!(verdict, Verdict::fail("toxic"));
        mock.assert_async().await;
    }
}
