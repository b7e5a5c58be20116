//! Per-request events fanned out to logging, spend and alerting sinks.

pub mod alerts;
pub mod counters;
pub mod logger;
pub mod spend;
pub mod webhook;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::router::Attempt;
use crate::types::Usage;

pub use alerts::{RateLimitAlerts, spawn_alert_pruner};
pub use counters::{Counters, CountersSnapshot};
pub use logger::TracingLogger;
pub use spend::{SpendLedger, SpendTotals};
pub use webhook::WebhookCallback;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    #[default]
    Chat,
    Embedding,
    ImageGeneration,
    Speech,
    Transcription,
    PassThrough,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// Everything known about one finished request.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RequestEvent {
    pub request_id: String,
    pub call_type: CallType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub model_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub attempts: Vec<Attempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub stream: bool,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
}

impl RequestEvent {
    pub fn new(request_id: impl Into<String>, call_type: CallType, model_group: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            call_type,
            model_group: model_group.into(),
            started_at: crate::types::unix_now(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn total_tokens(&self) -> u64 {
        self.usage.as_ref().map_or(0, |usage| usage.total_tokens)
    }
}

#[async_trait]
pub trait Callback: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    async fn log_success(&self, event: &RequestEvent);

    async fn log_failure(&self, event: &RequestEvent);
}

/// Registered callbacks. `emit` runs them off the request path.
#[derive(Clone, Debug, Default)]
pub struct CallbackSet {
    callbacks: Vec<Arc<dyn Callback>>,
}

impl CallbackSet {
    pub fn new(callbacks: Vec<Arc<dyn Callback>>) -> Self {
        Self { callbacks }
    }

    pub fn push(&mut self, callback: Arc<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.callbacks.iter().map(|callback| callback.name()).collect()
    }

    /// Delivers `event` to every callback in registration order.
    pub async fn dispatch(&self, event: &RequestEvent) {
        for callback in &self.callbacks {
            if event.is_success() {
                callback.log_success(event).await;
            } else {
                callback.log_failure(event).await;
            }
        }
    }

    pub fn emit(&self, event: RequestEvent) {
        if self.callbacks.is_empty() {
            return;
        }
        let callbacks = self.clone();
        tokio::spawn(async move {
            callbacks.dispatch(&event).await;
        });
    }
}

fn default_alert_threshold() -> u64 {
    5
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WebhookSettings {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AlertSettings {
    /// Rate-limit failures per key within the window before a warning is logged.
    #[serde(default = "default_alert_threshold")]
    pub threshold: u64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            threshold: default_alert_threshold(),
        }
    }
}

/// `tianji_settings.callback_configs`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CallbackConfigs {
    #[serde(default)]
    pub webhook: Option<WebhookSettings>,
    #[serde(default)]
    pub alerts: Option<AlertSettings>,
}

/// Handles to built-in sinks the gateway exposes or schedules.
#[derive(Clone, Debug)]
pub struct BuiltCallbacks {
    pub set: CallbackSet,
    pub counters: Arc<Counters>,
    pub spend: Option<Arc<SpendLedger>>,
    pub alerts: Option<Arc<RateLimitAlerts>>,
}

/// Builds the named callbacks. Counters are always on.
pub fn build_callbacks(
    names: &[String],
    configs: &CallbackConfigs,
    http: &reqwest::Client,
) -> Result<BuiltCallbacks, String> {
    let counters = Arc::new(Counters::default());
    let mut set = CallbackSet::default();
    set.push(counters.clone());
    let mut spend = None;
    let mut alerts = None;
    for name in names {
        match name.trim() {
            "logger" | "tracing" => set.push(Arc::new(TracingLogger)),
            "spend" | "spend_ledger" => {
                let ledger = Arc::new(SpendLedger::default());
                set.push(ledger.clone());
                spend = Some(ledger);
            }
            "webhook" => {
                let settings = configs
                    .webhook
                    .clone()
                    .ok_or_else(|| "webhook callback needs callback_configs.webhook.url".to_string())?;
                let url = url::Url::parse(&settings.url)
                    .map_err(|err| format!("invalid webhook url {}: {err}", settings.url))?;
                set.push(Arc::new(WebhookCallback::new(http.clone(), url, settings.headers)));
            }
            "alerts" | "rate_limit_alerts" => {
                let settings = configs.alerts.clone().unwrap_or_default();
                let store = Arc::new(RateLimitAlerts::new(settings.threshold));
                set.push(store.clone());
                alerts = Some(store);
            }
            other => return Err(format!("unknown callback: {other}")),
        }
    }
    Ok(BuiltCallbacks {
        set,
        counters,
        spend,
        alerts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_named_callbacks() {
        let built = build_callbacks(
            &["logger".to_string(), "spend".to_string(), "alerts".to_string()],
            &CallbackConfigs::default(),
            &reqwest::Client::new(),
        )
        .unwrap();
        assert_eq!(built.set.names(), vec!["counters", "logger", "spend", "alerts"]);
        assert!(built.spend.is_some());
        assert!(built.alerts.is_some());
    }

    #[test]
    fn webhook_requires_settings_and_unknown_names_fail() {
        let http = reqwest::Client::new();
        assert!(build_callbacks(&["webhook".to_string()], &CallbackConfigs::default(), &http).is_err());
        assert!(build_callbacks(&["datadog".to_string()], &CallbackConfigs::default(), &http).is_err());
    }

    #[tokio::test]
    async fn dispatch_routes_by_outcome() {
        let built = build_callbacks(&[], &CallbackConfigs::default(), &reqwest::Client::new()).unwrap();
        let ok = RequestEvent::new("r1", CallType::Chat, "gpt-4o");
        let mut failed = RequestEvent::new("r2", CallType::Chat, "gpt-4o");
        failed.error = Some(EventError {
            kind: ErrorKind::RateLimit,
            message: "slow down".to_string(),
            status: Some(429),
        });
        built.set.dispatch(&ok).await;
        built.set.dispatch(&failed).await;
        let snapshot = built.counters.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.rate_limited, 1);
    }
}
