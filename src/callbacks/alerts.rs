use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Callback, RequestEvent};
use crate::error::ErrorKind;

pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
pub const MAX_ENTRY_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug)]
struct KeyCounter {
    count: u64,
    first_seen: Instant,
    last_seen: Instant,
    alerted: bool,
}

/// Per-key rate-limit failure counters. A warning is logged once per window when a
/// key reaches `threshold`.
#[derive(Debug)]
pub struct RateLimitAlerts {
    threshold: u64,
    max_age: Duration,
    counters: Mutex<HashMap<String, KeyCounter>>,
}

impl RateLimitAlerts {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            max_age: MAX_ENTRY_AGE,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|counters| counters.get(key).map(|counter| counter.count))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counters.lock().map(|counters| counters.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records one rate-limit failure; returns true when this crossed the threshold.
    pub fn record(&self, key: &str) -> bool {
        self.record_at(key, Instant::now())
    }

    fn record_at(&self, key: &str, now: Instant) -> bool {
        let Ok(mut counters) = self.counters.lock() else {
            return false;
        };
        let counter = counters.entry(key.to_string()).or_insert(KeyCounter {
            count: 0,
            first_seen: now,
            last_seen: now,
            alerted: false,
        });
        counter.count = counter.count.saturating_add(1);
        counter.last_seen = now;
        if counter.count >= self.threshold && !counter.alerted {
            counter.alerted = true;
            return true;
        }
        false
    }

    /// Drops counters whose last failure is older than the max age.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    fn prune_at(&self, now: Instant) -> usize {
        let Ok(mut counters) = self.counters.lock() else {
            return 0;
        };
        let before = counters.len();
        counters.retain(|_, counter| now.saturating_duration_since(counter.last_seen) < self.max_age);
        before - counters.len()
    }
}

#[async_trait]
impl Callback for RateLimitAlerts {
    fn name(&self) -> &'static str {
        "alerts"
    }

    async fn log_success(&self, _event: &RequestEvent) {}

    async fn log_failure(&self, event: &RequestEvent) {
        let rate_limited = event
            .error
            .as_ref()
            .is_some_and(|error| error.kind == ErrorKind::RateLimit);
        if !rate_limited {
            return;
        }
        let key = event.key_id.as_deref().unwrap_or("anonymous");
        if self.record(key) {
            let since = self
                .counters
                .lock()
                .ok()
                .and_then(|counters| counters.get(key).map(|counter| counter.first_seen.elapsed()))
                .unwrap_or_default();
            tracing::warn!(
                key_id = key,
                model_group = %event.model_group,
                threshold = self.threshold,
                window_secs = since.as_secs(),
                "key is repeatedly rate limited"
            );
        }
    }
}

pub fn spawn_alert_pruner(
    alerts: Arc<RateLimitAlerts>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = alerts.prune();
                    if pruned > 0 {
                        tracing::debug!(pruned, "pruned rate limit alert counters");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{CallType, EventError};

    fn rate_limited(key: &str) -> RequestEvent {
        let mut event = RequestEvent::new("r", CallType::Chat, "gpt-4o");
        event.key_id = Some(key.to_string());
        event.error = Some(EventError {
            kind: ErrorKind::RateLimit,
            message: "429".to_string(),
            status: Some(429),
        });
        event
    }

    #[tokio::test]
    async fn counts_only_rate_limit_failures_per_key() {
        let alerts = RateLimitAlerts::new(2);
        alerts.log_failure(&rate_limited("k1")).await;
        alerts.log_failure(&rate_limited("k1")).await;
        alerts.log_failure(&rate_limited("k2")).await;
        let mut other = rate_limited("k2");
        other.error.as_mut().unwrap().kind = ErrorKind::Upstream5xx;
        alerts.log_failure(&other).await;
        assert_eq!(alerts.count("k1"), 2);
        assert_eq!(alerts.count("k2"), 1);
    }

    #[test]
    fn threshold_fires_once() {
        let alerts = RateLimitAlerts::new(2);
        assert!(!alerts.record("k"));
        assert!(alerts.record("k"));
        assert!(!alerts.record("k"));
    }

    #[test]
    fn prunes_entries_older_than_max_age() {
        let alerts = RateLimitAlerts::new(5);
        let start = Instant::now();
        alerts.record_at("old", start);
        alerts.record_at("fresh", start + Duration::from_secs(200));
        let pruned = alerts.prune_at(start + MAX_ENTRY_AGE + Duration::from_secs(1));
        assert_eq!(pruned, 1);
        assert_eq!(alerts.count("old"), 0);
        assert_eq!(alerts.count("fresh"), 1);
    }

    #[tokio::test]
    async fn pruner_stops_on_cancel() {
        let alerts = Arc::new(RateLimitAlerts::new(1).with_max_age(Duration::from_millis(10)));
        alerts.record("k");
        let cancel = CancellationToken::new();
        let handle = spawn_alert_pruner(alerts.clone(), Duration::from_millis(20), cancel.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(alerts.is_empty());
        cancel.cancel();
        handle.await.unwrap();
    }
}
