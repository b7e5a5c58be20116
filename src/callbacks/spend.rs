use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Callback, RequestEvent};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpendTotals {
    pub spend_usd: f64,
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl SpendTotals {
    fn add(&mut self, event: &RequestEvent) {
        self.spend_usd += event.cost_usd;
        self.requests = self.requests.saturating_add(1);
        if let Some(usage) = &event.usage {
            self.prompt_tokens = self.prompt_tokens.saturating_add(usage.prompt_tokens);
            self.completion_tokens = self.completion_tokens.saturating_add(usage.completion_tokens);
        }
    }
}

#[derive(Debug, Default)]
struct Ledger {
    total: SpendTotals,
    keys: BTreeMap<String, SpendTotals>,
    teams: BTreeMap<String, SpendTotals>,
    models: BTreeMap<String, SpendTotals>,
}

/// In-memory spend accounting by key, team and model group. Cache hits cost nothing
/// and are not counted; failed requests are not billed.
#[derive(Debug, Default)]
pub struct SpendLedger {
    ledger: Mutex<Ledger>,
}

impl SpendLedger {
    pub fn total(&self) -> SpendTotals {
        self.ledger
            .lock()
            .map(|ledger| ledger.total.clone())
            .unwrap_or_default()
    }

    pub fn for_key(&self, key_id: &str) -> Option<SpendTotals> {
        self.ledger.lock().ok()?.keys.get(key_id).cloned()
    }

    pub fn for_team(&self, team_id: &str) -> Option<SpendTotals> {
        self.ledger.lock().ok()?.teams.get(team_id).cloned()
    }

    pub fn for_model(&self, model_group: &str) -> Option<SpendTotals> {
        self.ledger.lock().ok()?.models.get(model_group).cloned()
    }

    fn record(&self, event: &RequestEvent) {
        let Ok(mut ledger) = self.ledger.lock() else {
            return;
        };
        ledger.total.add(event);
        if let Some(key_id) = &event.key_id {
            ledger.keys.entry(key_id.clone()).or_default().add(event);
        }
        if let Some(team_id) = &event.team_id {
            ledger.teams.entry(team_id.clone()).or_default().add(event);
        }
        ledger
            .models
            .entry(event.model_group.clone())
            .or_default()
            .add(event);
    }
}

#[async_trait]
impl Callback for SpendLedger {
    fn name(&self) -> &'static str {
        "spend"
    }

    async fn log_success(&self, event: &RequestEvent) {
        if !event.cache_hit {
            self.record(event);
        }
    }

    async fn log_failure(&self, _event: &RequestEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::CallType;
    use crate::types::Usage;

    fn event(key: &str, team: Option<&str>, model: &str, cost: f64) -> RequestEvent {
        let mut event = RequestEvent::new("r", CallType::Chat, model);
        event.key_id = Some(key.to_string());
        event.team_id = team.map(str::to_string);
        event.usage = Some(Usage::new(10, 5));
        event.cost_usd = cost;
        event
    }

    #[tokio::test]
    async fn aggregates_by_key_team_and_model() {
        let ledger = SpendLedger::default();
        ledger.log_success(&event("k1", Some("t1"), "gpt-4o", 0.25)).await;
        ledger.log_success(&event("k2", Some("t1"), "claude", 0.5)).await;
        ledger.log_success(&event("k1", None, "gpt-4o", 0.25)).await;

        let k1 = ledger.for_key("k1").unwrap();
        assert_eq!(k1.requests, 2);
        assert!((k1.spend_usd - 0.5).abs() < 1e-9);
        assert_eq!(k1.prompt_tokens, 20);
        assert_eq!(ledger.for_team("t1").unwrap().requests, 2);
        assert_eq!(ledger.for_model("gpt-4o").unwrap().completion_tokens, 10);
        assert!((ledger.total().spend_usd - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cache_hits_and_failures_are_free() {
        let ledger = SpendLedger::default();
        let mut hit = event("k1", None, "gpt-4o", 0.0);
        hit.cache_hit = true;
        ledger.log_success(&hit).await;
        ledger.log_failure(&event("k1", None, "gpt-4o", 1.0)).await;
        assert!(ledger.for_key("k1").is_none());
        assert_eq!(ledger.total().requests, 0);
    }
}
