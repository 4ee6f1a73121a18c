//! Per-physical-model circuit breaker and latency tracker (spec §4.4).
//!
//! Keyed by physical model, never logical — a failing `ark-deepseek` must
//! not take `deepseek` (the sibling Dashscope route) out too.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const FAILURE_THRESHOLD: u32 = 6;
const COOLDOWN: Duration = Duration::from_secs(60);
const LATENCY_RING_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Window {
    state: CircuitState,
    consecutive_failures: u32,
    success_count: u64,
    failure_count: u64,
    latencies: VecDeque<Duration>,
    opened_at: Option<Instant>,
    /// Half-open admits exactly one probe call; this tracks whether it has
    /// already been handed out.
    probe_in_flight: bool,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            success_count: 0,
            failure_count: 0,
            latencies: VecDeque::with_capacity(LATENCY_RING_CAPACITY),
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LatencyPercentiles {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub samples: usize,
}

/// Tracks circuit-breaker state and latency history for every physical
/// model that has ever been called.
pub struct CircuitBreaker {
    windows: Mutex<HashMap<String, Window>>,
}

impl CircuitBreaker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            windows: Mutex::new(HashMap::new()),
        })
    }

    /// Whether a call may be attempted against this physical model right
    /// now. Transitions `open` → `half_open` on the first check after the
    /// cooldown elapses.
    pub fn can_call(&self, physical_model: &str) -> bool {
        let mut windows = self.windows.lock();
        let window = windows.entry(physical_model.to_string()).or_default();

        match window.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !window.probe_in_flight,
            CircuitState::Open => {
                let opened_at = window.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() >= COOLDOWN {
                    window.state = CircuitState::HalfOpen;
                    window.probe_in_flight = false;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Must be called exactly once per call that `can_call` admitted,
    /// before the result is recorded, when the admitted call is the
    /// half-open probe. Recording `can_call`'s half-open admission as a
    /// probe-in-flight prevents a second concurrent caller from also being
    /// admitted while the first probe is outstanding.
    fn mark_probe_if_half_open(window: &mut Window) {
        if window.state == CircuitState::HalfOpen {
            window.probe_in_flight = true;
        }
    }

    pub fn record(&self, physical_model: &str, success: bool, duration: Duration, quota_exhausted: bool) {
        let mut windows = self.windows.lock();
        let window = windows.entry(physical_model.to_string()).or_default();

        if window.latencies.len() == LATENCY_RING_CAPACITY {
            window.latencies.pop_front();
        }
        window.latencies.push_back(duration);

        if success {
            window.success_count += 1;
            window.consecutive_failures = 0;
            window.state = CircuitState::Closed;
            window.opened_at = None;
            window.probe_in_flight = false;
        } else {
            window.failure_count += 1;
            window.consecutive_failures += 1;
            window.probe_in_flight = false;

            let threshold = if quota_exhausted { 1 } else { FAILURE_THRESHOLD };
            if window.state == CircuitState::HalfOpen
                || window.consecutive_failures >= threshold
            {
                window.state = CircuitState::Open;
                window.opened_at = Some(Instant::now());
            }
        }
    }

    /// Record a call the caller abandoned (`CoreError::Cancelled`):
    /// counted in `failure_count` for metrics, but never advances
    /// `consecutive_failures` or the breaker's state — an abandoned call
    /// says nothing about whether the provider itself is healthy.
    pub fn record_cancelled(&self, physical_model: &str, duration: Duration) {
        let mut windows = self.windows.lock();
        let window = windows.entry(physical_model.to_string()).or_default();

        if window.latencies.len() == LATENCY_RING_CAPACITY {
            window.latencies.pop_front();
        }
        window.latencies.push_back(duration);
        window.failure_count += 1;
    }

    pub fn state(&self, physical_model: &str) -> CircuitState {
        self.windows
            .lock()
            .get(physical_model)
            .map(|w| w.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn latency_percentiles(&self, physical_model: &str) -> LatencyPercentiles {
        let windows = self.windows.lock();
        let Some(window) = windows.get(physical_model) else {
            return LatencyPercentiles { p50_ms: 0, p95_ms: 0, p99_ms: 0, samples: 0 };
        };

        let mut sorted: Vec<u64> = window.latencies.iter().map(|d| d.as_millis() as u64).collect();
        sorted.sort_unstable();
        let percentile = |p: f64| -> u64 {
            if sorted.is_empty() {
                return 0;
            }
            let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted[idx]
        };

        LatencyPercentiles {
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            p99_ms: percentile(0.99),
            samples: sorted.len(),
        }
    }

    /// Call immediately before dispatching an admitted call so a concurrent
    /// second caller doesn't also get routed to the same half-open probe.
    pub fn reserve_probe(&self, physical_model: &str) {
        let mut windows = self.windows.lock();
        let window = windows.entry(physical_model.to_string()).or_default();
        Self::mark_probe_if_half_open(window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let cb = CircuitBreaker::new();
        assert!(cb.can_call("qwen"));
        assert_eq!(cb.state("qwen"), CircuitState::Closed);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            cb.record("ark-deepseek", false, Duration::from_millis(10), false);
        }
        assert_eq!(cb.state("ark-deepseek"), CircuitState::Open);
        assert!(!cb.can_call("ark-deepseek"));
    }

    #[test]
    fn sibling_route_unaffected() {
        let cb = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            cb.record("ark-deepseek", false, Duration::from_millis(10), false);
        }
        assert!(cb.can_call("deepseek"));
    }

    #[test]
    fn quota_exhaustion_opens_immediately() {
        let cb = CircuitBreaker::new();
        cb.record("qwen", false, Duration::from_millis(5), true);
        assert_eq!(cb.state("qwen"), CircuitState::Open);
    }

    #[test]
    fn success_after_half_open_closes() {
        let cb = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            cb.record("ark-kimi", false, Duration::from_millis(10), false);
        }
        {
            let mut windows = cb.windows.lock();
            windows.get_mut("ark-kimi").unwrap().opened_at = Some(Instant::now() - COOLDOWN - Duration::from_secs(1));
        }
        assert!(cb.can_call("ark-kimi"));
        assert_eq!(cb.state("ark-kimi"), CircuitState::HalfOpen);
        cb.record("ark-kimi", true, Duration::from_millis(10), false);
        assert_eq!(cb.state("ark-kimi"), CircuitState::Closed);
    }

    #[test]
    fn cancellation_never_trips_the_breaker() {
        let cb = CircuitBreaker::new();
        for _ in 0..(FAILURE_THRESHOLD * 2) {
            cb.record_cancelled("qwen", Duration::from_millis(10));
        }
        assert_eq!(cb.state("qwen"), CircuitState::Closed);
        assert!(cb.can_call("qwen"));
    }

    #[test]
    fn latency_percentiles_nonempty_after_calls() {
        let cb = CircuitBreaker::new();
        for ms in [10, 20, 30, 40, 50] {
            cb.record("qwen", true, Duration::from_millis(ms), false);
        }
        let p = cb.latency_percentiles("qwen");
        assert_eq!(p.samples, 5);
        assert!(p.p50_ms > 0);
    }
}
