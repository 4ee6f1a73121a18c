//! Maps a logical model to a physical model (spec §4.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use mindmap_core::config::load_balancing::{self, Strategy};
use mindmap_core::{CoreError, PhysicalModel, Result};

use crate::circuit_breaker::CircuitBreaker;
use crate::providers;
use crate::rate_limiter::RateLimiterRegistry;

/// Saturated candidates are deprioritized, not excluded — this is the floor
/// weight a fully-saturated route keeps so it can still be chosen if every
/// candidate is saturated.
const SATURATED_FLOOR: f64 = 0.05;

pub struct LoadBalancer {
    circuit_breaker: Arc<CircuitBreaker>,
    rate_limiters: Arc<RateLimiterRegistry>,
    round_robin_counters: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl LoadBalancer {
    pub fn new(circuit_breaker: Arc<CircuitBreaker>, rate_limiters: Arc<RateLimiterRegistry>) -> Self {
        Self {
            circuit_breaker,
            rate_limiters,
            round_robin_counters: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a logical model to an available physical model (spec §4.5
    /// steps 1-4). Fails fast with `CircuitOpen` when every candidate is
    /// unavailable; never touches a rate limiter or provider in that case.
    pub async fn resolve(&self, logical_model: &str) -> Result<PhysicalModel> {
        let mut candidates = providers::candidates_for(logical_model);
        candidates.sort();

        let available: Vec<PhysicalModel> = candidates
            .iter()
            .filter(|c| self.circuit_breaker.can_call(c))
            .cloned()
            .collect();

        if available.is_empty() {
            return Err(CoreError::CircuitOpen(logical_model.to_string()));
        }
        if available.len() == 1 {
            return Ok(available[0].clone());
        }

        let weights = self.effective_weights(&available).await;

        let chosen = match load_balancing::strategy() {
            Strategy::Weighted => weighted_pick(&available, &weights),
            Strategy::RoundRobin => self.round_robin_pick(logical_model, &available, &weights),
            Strategy::Random => random_pick(&available, &weights),
        };

        Ok(chosen)
    }

    async fn effective_weights(&self, candidates: &[PhysicalModel]) -> HashMap<PhysicalModel, f64> {
        let base = load_balancing::weights();
        let rate_limit_aware = load_balancing::rate_limit_aware();

        let mut weights = HashMap::new();
        for candidate in candidates {
            let base_weight = base.get(candidate).copied().unwrap_or(1.0);
            let factor = if rate_limit_aware {
                let limiter = self.rate_limiters.for_physical_model(candidate);
                let load = limiter.current_load_fraction().await;
                (1.0 - load).max(SATURATED_FLOOR)
            } else {
                1.0
            };
            weights.insert(candidate.clone(), base_weight * factor);
        }
        weights
    }

    fn round_robin_pick(
        &self,
        logical_model: &str,
        available: &[PhysicalModel],
        weights: &HashMap<PhysicalModel, f64>,
    ) -> PhysicalModel {
        let counter = {
            let mut counters = self.round_robin_counters.lock();
            counters
                .entry(logical_model.to_string())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone()
        };

        let start = counter.fetch_add(1, Ordering::Relaxed) % available.len();
        // Rotate starting at `start`; prefer the first candidate that isn't
        // floor-weighted (i.e. not fully saturated) unless all of them are.
        for offset in 0..available.len() {
            let idx = (start + offset) % available.len();
            let candidate = &available[idx];
            if weights.get(candidate).copied().unwrap_or(1.0) > SATURATED_FLOOR {
                return candidate.clone();
            }
        }
        available[start].clone()
    }

    /// Analytics hook invoked on completion (spec §4.5). Currently a no-op
    /// beyond what `CircuitBreaker::record` already captures; kept as a
    /// named extension point for a future metrics sink.
    pub fn record_provider_metrics(&self, physical_model: &str, success: bool, duration: Duration, error: Option<&str>) {
        tracing::debug!(
            physical_model,
            success,
            duration_ms = duration.as_millis() as u64,
            error,
            "provider call completed"
        );
    }
}

fn weighted_pick(available: &[PhysicalModel], weights: &HashMap<PhysicalModel, f64>) -> PhysicalModel {
    let total: f64 = available.iter().map(|c| weights.get(c).copied().unwrap_or(1.0)).sum();
    if total <= 0.0 {
        return available[0].clone();
    }
    let mut roll = rand::thread_rng().gen_range(0.0..total);
    for candidate in available {
        let w = weights.get(candidate).copied().unwrap_or(1.0);
        if roll < w {
            return candidate.clone();
        }
        roll -= w;
    }
    available.last().unwrap().clone()
}

fn random_pick(available: &[PhysicalModel], weights: &HashMap<PhysicalModel, f64>) -> PhysicalModel {
    let viable: Vec<&PhysicalModel> = available
        .iter()
        .filter(|c| weights.get(*c).copied().unwrap_or(1.0) > SATURATED_FLOOR)
        .collect();
    let pool = if viable.is_empty() { available.iter().collect() } else { viable };
    let idx = rand::thread_rng().gen_range(0..pool.len());
    pool[idx].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::RateLimiterRegistry;

    fn balancer() -> LoadBalancer {
        LoadBalancer::new(CircuitBreaker::new(), Arc::new(RateLimiterRegistry::new(None)))
    }

    #[tokio::test]
    async fn fixed_routes_resolve_exactly() {
        let lb = balancer();
        assert_eq!(lb.resolve("qwen").await.unwrap(), "qwen");
        assert_eq!(lb.resolve("kimi").await.unwrap(), "ark-kimi");
        assert_eq!(lb.resolve("doubao").await.unwrap(), "ark-doubao");
    }

    #[tokio::test]
    async fn deepseek_balances_across_two_routes() {
        let lb = balancer();
        let resolved = lb.resolve("deepseek").await.unwrap();
        assert!(resolved == "deepseek" || resolved == "ark-deepseek");
    }

    #[tokio::test]
    async fn all_candidates_circuit_open_fails_fast() {
        let cb = CircuitBreaker::new();
        for _ in 0..10 {
            cb.record("deepseek", false, Duration::from_millis(5), false);
            cb.record("ark-deepseek", false, Duration::from_millis(5), false);
        }
        let lb = LoadBalancer::new(cb, Arc::new(RateLimiterRegistry::new(None)));
        let err = lb.resolve("deepseek").await.unwrap_err();
        assert_eq!(err.kind(), "circuit_open");
    }

    #[tokio::test]
    async fn one_route_down_routes_to_survivor() {
        let cb = CircuitBreaker::new();
        for _ in 0..10 {
            cb.record("ark-deepseek", false, Duration::from_millis(5), false);
        }
        let lb = LoadBalancer::new(cb, Arc::new(RateLimiterRegistry::new(None)));
        assert_eq!(lb.resolve("deepseek").await.unwrap(), "deepseek");
    }
}
