use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::deployment::Deployment;
use super::health::{HealthTracker, current_minute};
use crate::utils::random_u64;

/// Picks one deployment out of the eligible set. Returns an index into `candidates`.
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn select(&self, candidates: &[Arc<Deployment>], health: &HealthTracker) -> Option<usize>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingStrategy {
    /// Weighted random over `weight`, `rpm`, or `tpm`.
    #[default]
    #[serde(rename = "shuffle")]
    Shuffle,
    #[serde(rename = "simple-shuffle")]
    SimpleShuffle,
    #[serde(rename = "latency-based", alias = "latency-based-routing")]
    LatencyBased,
    #[serde(rename = "usage-based-v2", alias = "usage-based-routing-v2")]
    UsageBasedV2,
    #[serde(rename = "lowest-cost", alias = "cost-based-routing")]
    LowestCost,
    #[serde(rename = "least-busy")]
    LeastBusy,
}

impl RoutingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shuffle => "shuffle",
            Self::SimpleShuffle => "simple-shuffle",
            Self::LatencyBased => "latency-based",
            Self::UsageBasedV2 => "usage-based-v2",
            Self::LowestCost => "lowest-cost",
            Self::LeastBusy => "least-busy",
        }
    }
}

impl SelectionStrategy for RoutingStrategy {
    fn name(&self) -> &str {
        self.as_str()
    }

    fn select(&self, candidates: &[Arc<Deployment>], health: &HealthTracker) -> Option<usize> {
        if candidates.len() <= 1 {
            return if candidates.is_empty() { None } else { Some(0) };
        }
        match self {
            Self::Shuffle => weighted_pick(candidates, random_u64()),
            Self::SimpleShuffle => Some((random_u64() % candidates.len() as u64) as usize),
            Self::LatencyBased => {
                // Untried deployments sort first so every deployment gets a sample.
                min_by_key(candidates, |deployment| {
                    health
                        .get(&deployment.id)
                        .latency_ewma()
                        .map(|latency| latency.as_micros())
                        .unwrap_or(0)
                })
            }
            Self::UsageBasedV2 => {
                let minute = current_minute();
                min_by_key(candidates, |deployment| health.get(&deployment.id).usage(minute).1)
            }
            Self::LowestCost => {
                let priced: Vec<(usize, f64)> = candidates
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, deployment)| deployment.unit_cost().map(|cost| (idx, cost)))
                    .collect();
                priced
                    .iter()
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(idx, _)| *idx)
                    .or(Some(0))
            }
            Self::LeastBusy => {
                min_by_key(candidates, |deployment| health.get(&deployment.id).in_flight())
            }
        }
    }
}

/// First index with the smallest key; ties keep configuration order.
fn min_by_key<K: Ord>(
    candidates: &[Arc<Deployment>],
    mut key: impl FnMut(&Deployment) -> K,
) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .map(|(idx, deployment)| (key(deployment), idx))
        .min()
        .map(|(_, idx)| idx)
}

fn weighted_pick(candidates: &[Arc<Deployment>], roll: u64) -> Option<usize> {
    let weights: Vec<f64> = candidates
        .iter()
        .map(|deployment| deployment.selection_weight())
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Some((roll % candidates.len() as u64) as usize);
    }
    let mut pick = (roll as f64 / u64::MAX as f64) * total;
    for (idx, weight) in weights.iter().enumerate() {
        if pick < *weight {
            return Some(idx);
        }
        pick -= weight;
    }
    weights.iter().rposition(|weight| *weight > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deployments(n: usize) -> Vec<Arc<Deployment>> {
        (1..=n)
            .map(|i| Arc::new(Deployment::new(format!("g/d{i}"), "g", "openai", "gpt-4o")))
            .collect()
    }

    #[test]
    fn strategy_names_parse_from_config() {
        let parsed: RoutingStrategy = serde_json::from_str("\"usage-based-v2\"").unwrap();
        assert_eq!(parsed, RoutingStrategy::UsageBasedV2);
        let parsed: RoutingStrategy = serde_json::from_str("\"latency-based-routing\"").unwrap();
        assert_eq!(parsed, RoutingStrategy::LatencyBased);
        assert_eq!(RoutingStrategy::default().name(), "shuffle");
    }

    #[test]
    fn weighted_pick_follows_weights() {
        let candidates = vec![
            Arc::new(Deployment::new("a", "g", "openai", "m").with_weight(1.0)),
            Arc::new(Deployment::new("b", "g", "openai", "m").with_weight(3.0)),
        ];
        assert_eq!(weighted_pick(&candidates, 0), Some(0));
        assert_eq!(weighted_pick(&candidates, u64::MAX / 2), Some(1));
        assert_eq!(weighted_pick(&candidates, u64::MAX), Some(1));
    }

    #[test]
    fn zero_weight_deployments_are_never_picked_when_others_have_weight() {
        let candidates = vec![
            Arc::new(Deployment::new("a", "g", "openai", "m").with_weight(0.0)),
            Arc::new(Deployment::new("b", "g", "openai", "m").with_weight(1.0)),
        ];
        for roll in [0, 1 << 20, u64::MAX / 3, u64::MAX] {
            assert_eq!(weighted_pick(&candidates, roll), Some(1));
        }
    }

    #[test]
    fn latency_based_tries_unsampled_deployments_then_the_fastest() {
        let health = HealthTracker::default();
        let candidates = deployments(3);
        health.get("g/d1").record_success(Duration::from_millis(300));
        health.get("g/d2").record_success(Duration::from_millis(50));
        assert_eq!(
            RoutingStrategy::LatencyBased.select(&candidates, &health),
            Some(2)
        );
        health.get("g/d3").record_success(Duration::from_millis(900));
        assert_eq!(
            RoutingStrategy::LatencyBased.select(&candidates, &health),
            Some(1)
        );
    }

    #[test]
    fn usage_based_picks_least_tokens_this_minute() {
        let health = HealthTracker::default();
        let candidates = deployments(2);
        let minute = current_minute();
        health.get("g/d1").record_usage(minute, 1, 900);
        health.get("g/d2").record_usage(minute, 1, 100);
        assert_eq!(
            RoutingStrategy::UsageBasedV2.select(&candidates, &health),
            Some(1)
        );
    }

    #[test]
    fn lowest_cost_puts_unknown_prices_last() {
        let health = HealthTracker::default();
        let candidates = vec![
            Arc::new(Deployment::new("a", "g", "openai", "m")),
            Arc::new(Deployment::new("b", "g", "openai", "m").with_costs(0.00001, 0.00003)),
            Arc::new(Deployment::new("c", "g", "openai", "m").with_costs(0.000001, 0.000002)),
        ];
        assert_eq!(
            RoutingStrategy::LowestCost.select(&candidates, &health),
            Some(2)
        );
    }

    #[test]
    fn least_busy_counts_in_flight_requests() {
        let health = HealthTracker::default();
        let candidates = deployments(2);
        let _busy = health.get("g/d1").begin();
        assert_eq!(
            RoutingStrategy::LeastBusy.select(&candidates, &health),
            Some(1)
        );
    }
}
