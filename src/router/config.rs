use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use super::health::CooldownPolicy;
use super::strategy::RoutingStrategy;
use crate::error::ErrorKind;

fn default_num_retries() -> u32 {
    2
}

fn default_allowed_fails() -> u32 {
    3
}

fn default_cooldown_time() -> f64 {
    5.0
}

/// `router_settings` from the proxy config.
#[derive(Clone, Debug, Deserialize)]
pub struct RouterSettings {
    #[serde(default)]
    pub routing_strategy: RoutingStrategy,
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    #[serde(default = "default_allowed_fails")]
    pub allowed_fails: u32,
    /// Seconds.
    #[serde(default = "default_cooldown_time")]
    pub cooldown_time: f64,
    #[serde(default)]
    pub fallbacks: FallbackMap,
    #[serde(default)]
    pub default_fallbacks: Vec<String>,
    #[serde(default)]
    pub context_window_fallbacks: FallbackMap,
    #[serde(default)]
    pub content_policy_fallbacks: FallbackMap,
    #[serde(default)]
    pub model_group_retry_policy: BTreeMap<String, GroupRetryPolicy>,
    #[serde(default)]
    pub model_group_alias: BTreeMap<String, AliasTarget>,
    #[serde(default)]
    pub enable_tag_filtering: bool,
    #[serde(default)]
    pub tag_filtering_match_any: bool,
    /// Overall request deadline in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            routing_strategy: RoutingStrategy::default(),
            num_retries: default_num_retries(),
            allowed_fails: default_allowed_fails(),
            cooldown_time: default_cooldown_time(),
            fallbacks: FallbackMap::default(),
            default_fallbacks: Vec::new(),
            context_window_fallbacks: FallbackMap::default(),
            content_policy_fallbacks: FallbackMap::default(),
            model_group_retry_policy: BTreeMap::new(),
            model_group_alias: BTreeMap::new(),
            enable_tag_filtering: false,
            tag_filtering_match_any: false,
            timeout: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GroupRetryPolicy {
    #[serde(default)]
    pub num_retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default)]
    pub retry_after_seconds: Option<f64>,
}

/// Alias target: a bare group name or `{model, hidden}`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AliasTarget {
    Group(String),
    Detailed {
        model: String,
        #[serde(default)]
        hidden: bool,
    },
}

impl AliasTarget {
    pub fn group(&self) -> &str {
        match self {
            Self::Group(group) => group,
            Self::Detailed { model, .. } => model,
        }
    }

    pub fn hidden(&self) -> bool {
        matches!(self, Self::Detailed { hidden: true, .. })
    }
}

/// Group to ordered fallback groups. Accepts `{A: [B]}` or the list form `[{A: [B]}, {C: [D]}]`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FallbackMap(BTreeMap<String, Vec<String>>);

impl FallbackMap {
    pub fn get(&self, group: &str) -> &[String] {
        self.0.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn insert(&mut self, group: impl Into<String>, fallbacks: Vec<String>) {
        self.0.insert(group.into(), fallbacks);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries of `other` win over existing ones.
    pub fn extend(&mut self, other: FallbackMap) {
        self.0.extend(other.0);
    }
}

impl<K: Into<String>, const N: usize> From<[(K, Vec<String>); N]> for FallbackMap {
    fn from(entries: [(K, Vec<String>); N]) -> Self {
        Self(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl<'de> Deserialize<'de> for FallbackMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Map(BTreeMap<String, Vec<String>>),
            List(Vec<BTreeMap<String, Vec<String>>>),
        }

        Ok(match Option::<Raw>::deserialize(deserializer)? {
            None => Self::default(),
            Some(Raw::Map(map)) => Self(map),
            Some(Raw::List(entries)) => Self(entries.into_iter().flatten().collect()),
        })
    }
}

impl RouterSettings {
    pub fn cooldown_policy(&self) -> CooldownPolicy {
        CooldownPolicy {
            allowed_fails: self.allowed_fails,
            cooldown_time: seconds(self.cooldown_time).unwrap_or(Duration::ZERO),
        }
    }

    /// Retries for a group. Fallback groups get one pass unless their policy says otherwise.
    pub fn retries_for(&self, group: &str, primary: bool) -> u32 {
        match self
            .model_group_retry_policy
            .get(group)
            .and_then(|policy| policy.num_retries)
        {
            Some(retries) => retries,
            None if primary => self.num_retries,
            None => 0,
        }
    }

    pub fn attempt_timeout(&self, group: &str) -> Option<Duration> {
        self.model_group_retry_policy
            .get(group)
            .and_then(|policy| policy.timeout_seconds)
            .and_then(seconds)
    }

    pub fn retry_after(&self, group: &str) -> Option<Duration> {
        self.model_group_retry_policy
            .get(group)
            .and_then(|policy| policy.retry_after_seconds)
            .and_then(seconds)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.timeout.and_then(seconds)
    }

    /// Fallback groups for `group` after a failure of `kind`.
    pub fn fallbacks_for(&self, group: &str, kind: Option<ErrorKind>) -> Vec<String> {
        match kind {
            Some(ErrorKind::ContextOverflow) => self.context_window_fallbacks.get(group).to_vec(),
            Some(ErrorKind::ContentPolicy) => self.content_policy_fallbacks.get(group).to_vec(),
            _ => self.general_fallbacks(group).to_vec(),
        }
    }

    pub fn general_fallbacks(&self, group: &str) -> &[String] {
        let specific = self.fallbacks.get(group);
        if specific.is_empty() {
            &self.default_fallbacks
        } else {
            specific
        }
    }

    pub fn tags_match(&self, deployment_tags: &[String], request_tags: &[String]) -> bool {
        if !self.enable_tag_filtering || request_tags.is_empty() {
            return true;
        }
        if self.tag_filtering_match_any {
            request_tags.iter().any(|tag| deployment_tags.contains(tag))
        } else {
            request_tags.iter().all(|tag| deployment_tags.contains(tag))
        }
    }
}

fn seconds(value: f64) -> Option<Duration> {
    (value.is_finite() && value > 0.0).then(|| Duration::from_secs_f64(value))
}
