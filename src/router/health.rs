use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::ErrorKind;

const LATENCY_EWMA_ALPHA: f64 = 0.3;

#[derive(Clone, Copy, Debug)]
pub struct CooldownPolicy {
    pub allowed_fails: u32,
    pub cooldown_time: Duration,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeploymentHealthSnapshot {
    pub deployment: String,
    pub recent_fails: usize,
    pub cooling_down: bool,
    pub in_flight: u64,
    pub latency_ewma_ms: Option<f64>,
    pub requests_this_minute: u64,
    pub tokens_this_minute: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorKind>,
}

#[derive(Debug, Default)]
struct MinuteBucket {
    minute: u64,
    requests: u64,
    tokens: u64,
}

impl MinuteBucket {
    fn roll(&mut self, minute: u64) {
        if self.minute != minute {
            self.minute = minute;
            self.requests = 0;
            self.tokens = 0;
        }
    }
}

#[derive(Debug, Default)]
struct FailWindow {
    fails: VecDeque<Instant>,
    last_error: Option<ErrorKind>,
}

impl FailWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.fails.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.fails.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-deployment counters. Writes lock only this deployment; the gauges are atomics.
#[derive(Debug, Default)]
pub struct DeploymentHealth {
    window: Mutex<FailWindow>,
    usage: Mutex<MinuteBucket>,
    in_flight: AtomicU64,
    latency_ewma_micros: AtomicU64,
}

impl DeploymentHealth {
    pub fn record_failure(&self, kind: ErrorKind, now: Instant, policy: CooldownPolicy) -> bool {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.prune(now, policy.cooldown_time);
        window.fails.push_back(now);
        window.last_error = Some(kind);
        window.fails.len() >= policy.allowed_fails.max(1) as usize
    }

    pub fn record_success(&self, latency: Duration) {
        let sample = latency.as_micros().min(u64::MAX as u128) as u64;
        let previous = self.latency_ewma_micros.load(Ordering::Relaxed);
        let next = if previous == 0 {
            sample.max(1)
        } else {
            (LATENCY_EWMA_ALPHA * sample as f64 + (1.0 - LATENCY_EWMA_ALPHA) * previous as f64)
                as u64
        };
        self.latency_ewma_micros.store(next.max(1), Ordering::Relaxed);
    }

    pub fn is_cooling_down(&self, now: Instant, policy: CooldownPolicy) -> bool {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.prune(now, policy.cooldown_time);
        window.fails.len() >= policy.allowed_fails.max(1) as usize
    }

    pub fn latency_ewma(&self) -> Option<Duration> {
        match self.latency_ewma_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn begin(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            health: Arc::clone(self),
        }
    }

    /// Counts one request and `tokens` against the current minute.
    pub fn record_usage(&self, minute: u64, requests: u64, tokens: u64) {
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        usage.roll(minute);
        usage.requests = usage.requests.saturating_add(requests);
        usage.tokens = usage.tokens.saturating_add(tokens);
    }

    /// `(requests, tokens)` used in `minute`.
    pub fn usage(&self, minute: u64) -> (u64, u64) {
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        usage.roll(minute);
        (usage.requests, usage.tokens)
    }

    fn snapshot(
        &self,
        deployment: &str,
        now: Instant,
        policy: CooldownPolicy,
        minute: u64,
    ) -> DeploymentHealthSnapshot {
        let (recent_fails, last_error) = {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            window.prune(now, policy.cooldown_time);
            (window.fails.len(), window.last_error)
        };
        let (requests_this_minute, tokens_this_minute) = self.usage(minute);
        DeploymentHealthSnapshot {
            deployment: deployment.to_string(),
            recent_fails,
            cooling_down: recent_fails >= policy.allowed_fails.max(1) as usize,
            in_flight: self.in_flight(),
            latency_ewma_ms: self.latency_ewma().map(|d| d.as_secs_f64() * 1000.0),
            requests_this_minute,
            tokens_this_minute,
            last_error,
        }
    }

    fn is_idle(&self, now: Instant, window: Duration, minute: u64) -> bool {
        let no_fails = {
            let mut fails = self.window.lock().unwrap_or_else(|e| e.into_inner());
            fails.prune(now, window);
            fails.fails.is_empty()
        };
        no_fails && self.in_flight() == 0 && self.usage(minute) == (0, 0)
    }
}

pub(crate) struct InFlightGuard {
    health: Arc<DeploymentHealth>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.health.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Health for every deployment the router has touched, keyed by deployment id.
#[derive(Debug, Default)]
pub struct HealthTracker {
    entries: RwLock<HashMap<String, Arc<DeploymentHealth>>>,
}

impl HealthTracker {
    pub fn get(&self, deployment: &str) -> Arc<DeploymentHealth> {
        if let Some(existing) = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(deployment)
        {
            return Arc::clone(existing);
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(entries.entry(deployment.to_string()).or_default())
    }

    pub fn snapshot(&self, policy: CooldownPolicy) -> Vec<DeploymentHealthSnapshot> {
        let now = Instant::now();
        let minute = current_minute();
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = entries
            .iter()
            .map(|(id, health)| health.snapshot(id, now, policy, minute))
            .collect();
        out.sort_by(|a, b| a.deployment.cmp(&b.deployment));
        out
    }

    /// Drops deployments with no recent failures, nothing in flight, and no usage this minute.
    pub fn prune(&self, window: Duration) -> usize {
        let now = Instant::now();
        let minute = current_minute();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, health| Arc::strong_count(health) > 1 || !health.is_idle(now, window, minute));
        before - entries.len()
    }
}

pub(crate) fn current_minute() -> u64 {
    crate::types::unix_now() / 60
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: CooldownPolicy = CooldownPolicy {
        allowed_fails: 2,
        cooldown_time: Duration::from_millis(50),
    };

    #[test]
    fn cools_down_after_allowed_fails_and_recovers_when_window_slides() {
        let health = DeploymentHealth::default();
        let start = Instant::now();
        assert!(!health.record_failure(ErrorKind::RateLimit, start, POLICY));
        assert!(health.record_failure(ErrorKind::RateLimit, start, POLICY));
        assert!(health.is_cooling_down(start + Duration::from_millis(10), POLICY));
        assert!(!health.is_cooling_down(start + Duration::from_millis(60), POLICY));
    }

    #[test]
    fn latency_is_an_exponential_moving_average() {
        let health = DeploymentHealth::default();
        assert!(health.latency_ewma().is_none());
        health.record_success(Duration::from_millis(100));
        health.record_success(Duration::from_millis(200));
        let ewma = health.latency_ewma().unwrap().as_millis();
        assert_eq!(ewma, 130);
    }

    #[test]
    fn usage_resets_each_minute() {
        let health = DeploymentHealth::default();
        health.record_usage(10, 1, 500);
        health.record_usage(10, 1, 250);
        assert_eq!(health.usage(10), (2, 750));
        assert_eq!(health.usage(11), (0, 0));
    }

    #[test]
    fn in_flight_guard_decrements_on_drop() {
        let health = Arc::new(DeploymentHealth::default());
        let guard = health.begin();
        assert_eq!(health.in_flight(), 1);
        drop(guard);
        assert_eq!(health.in_flight(), 0);
    }
}
