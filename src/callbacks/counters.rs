use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Callback, RequestEvent};
use crate::error::ErrorKind;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub requests: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub rate_limited: u64,
    pub policy_blocked: u64,
    pub upstream_attempts: u64,
    pub fallbacks: u64,
}

/// Process-wide request counters, surfaced on the readiness endpoint.
#[derive(Debug, Default)]
pub struct Counters {
    snapshot: Mutex<CountersSnapshot>,
}

impl Counters {
    fn update(&self, apply: impl FnOnce(&mut CountersSnapshot)) {
        if let Ok(mut snapshot) = self.snapshot.lock() {
            apply(&mut snapshot);
        }
    }

    pub fn record_policy_block(&self) {
        self.update(|s| s.policy_blocked = s.policy_blocked.saturating_add(1));
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        self.snapshot
            .lock()
            .map(|snapshot| snapshot.clone())
            .unwrap_or_default()
    }

    fn record(&self, event: &RequestEvent) {
        let groups: std::collections::BTreeSet<&str> = event
            .attempts
            .iter()
            .map(|attempt| attempt.model_group.as_str())
            .collect();
        self.update(|s| {
            s.requests = s.requests.saturating_add(1);
            if event.cache_hit {
                s.cache_hits = s.cache_hits.saturating_add(1);
            }
            s.upstream_attempts = s.upstream_attempts.saturating_add(event.attempts.len() as u64);
            if groups.len() > 1 {
                s.fallbacks = s.fallbacks.saturating_add(1);
            }
            if let Some(error) = &event.error {
                s.failures = s.failures.saturating_add(1);
                if error.kind == ErrorKind::RateLimit {
                    s.rate_limited = s.rate_limited.saturating_add(1);
                }
            }
        });
    }
}

#[async_trait]
impl Callback for Counters {
    fn name(&self) -> &'static str {
        "counters"
    }

    async fn log_success(&self, event: &RequestEvent) {
        self.record(event);
    }

    async fn log_failure(&self, event: &RequestEvent) {
        self.record(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::CallType;
    use crate::router::Attempt;

    fn attempt(group: &str, kind: Option<ErrorKind>) -> Attempt {
        Attempt {
            deployment: format!("{group}/d1"),
            model_group: group.to_string(),
            kind,
            latency_ms: 3,
        }
    }

    #[tokio::test]
    async fn counts_cache_hits_and_cross_group_fallbacks() {
        let counters = Counters::default();
        let mut hit = RequestEvent::new("r1", CallType::Chat, "A");
        hit.cache_hit = true;
        counters.log_success(&hit).await;

        let mut fell_back = RequestEvent::new("r2", CallType::Chat, "A");
        fell_back.attempts = vec![attempt("A", Some(ErrorKind::RateLimit)), attempt("B", None)];
        counters.log_success(&fell_back).await;
        counters.record_policy_block();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.upstream_attempts, 2);
        assert_eq!(snapshot.fallbacks, 1);
        assert_eq!(snapshot.failures, 0);
        assert_eq!(snapshot.policy_blocked, 1);
    }
}
