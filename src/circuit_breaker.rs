//! Circuit breaker implementation for preventing cascading failures
//!
//! One breaker per provider, tracking a bounded sliding window of recent
//! call outcomes. The breaker opens when the window's failure ratio exceeds
//! the configured threshold, fast-fails while open, and probes the provider
//! with a fixed trial budget in half-open before closing again.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;

/// State of a provider's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow normally; outcomes feed the sliding window
    Closed,
    /// Calls fast-fail until the open timeout elapses
    Open,
    /// A limited trial budget of calls probes the provider
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker tuning, extracted from the orchestrator config.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure ratio over the window that opens the circuit
    pub failure_threshold: f64,
    /// Observations required before the ratio is evaluated; also the window bound
    pub min_sample: usize,
    /// How long the circuit stays open before probing
    pub open_timeout: Duration,
    /// Trial calls allowed in half-open before a verdict
    pub half_open_trials: usize,
}

impl From<&OrchestratorConfig> for BreakerConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold,
            min_sample: config.breaker_min_sample,
            open_timeout: config.breaker_open_timeout,
            half_open_trials: config.breaker_half_open_trials,
        }
    }
}

/// Introspection snapshot of one breaker.
#[derive(Debug, Clone)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub window_len: usize,
    pub window_failures: usize,
    pub trials_remaining: usize,
    pub since_transition: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Sliding window of recent outcomes, true = success, bounded by min_sample
    window: VecDeque<bool>,
    /// Set on every transition to Open; half-open eligibility is this instant
    /// plus the open timeout
    opened_at: Option<Instant>,
    /// Trial calls left in half-open; strictly decreases, never negative
    trials_remaining: usize,
    /// Successful trials recorded in the current half-open episode
    trial_successes: usize,
    last_transition: Instant,
}

/// A thread-safe, per-provider circuit breaker.
///
/// All state reads and transitions are serialized by one mutex per instance,
/// since concurrent admitted items may race on the same provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new<S: Into<String>>(provider: S, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                trials_remaining: 0,
                trial_successes: 0,
                last_transition: Instant::now(),
            }),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// In half-open this consumes one unit of the trial budget; the open to
    /// half-open transition happens on the first call after the timeout and
    /// that call counts as the first trial.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let eligible = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.open_timeout)
                    .unwrap_or(true);
                if eligible {
                    self.to_half_open(&mut inner);
                    inner.trials_remaining -= 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trials_remaining > 0 {
                    inner.trials_remaining -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Non-consuming variant of [`allow`](Self::allow), used by the router to
    /// filter candidates without spending half-open trial budget.
    pub fn is_callable(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.open_timeout)
                .unwrap_or(true),
            CircuitState::HalfOpen => inner.trials_remaining > 0,
        }
    }

    /// Records the outcome of a call that was allowed through.
    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                if inner.window.len() == self.config.min_sample {
                    inner.window.pop_front();
                }
                inner.window.push_back(success);
                if inner.window.len() >= self.config.min_sample {
                    let failures = inner.window.iter().filter(|ok| !**ok).count();
                    let ratio = failures as f64 / inner.window.len() as f64;
                    if ratio > self.config.failure_threshold {
                        warn!(
                            provider = %self.provider,
                            failure_ratio = %format!("{:.2}", ratio),
                            window = %inner.window.len(),
                            "Failure ratio over threshold, opening circuit"
                        );
                        self.to_open(&mut inner);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.trial_successes += 1;
                    if inner.trial_successes >= self.config.half_open_trials {
                        info!(provider = %self.provider, "Trial budget passed, closing circuit");
                        self.to_closed(&mut inner);
                    }
                } else {
                    warn!(provider = %self.provider, "Trial call failed, reopening circuit");
                    self.to_open(&mut inner);
                }
            }
            CircuitState::Open => {
                // A call that was in flight when the circuit opened; the
                // verdict already stands.
                debug!(provider = %self.provider, success, "Outcome recorded while open, ignoring");
            }
        }
    }

    /// Current state without consuming anything.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Success rate over the current sliding window; `None` when empty.
    /// The router's proactive health floor reads this.
    pub fn window_success_rate(&self) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        if inner.window.is_empty() {
            return None;
        }
        let successes = inner.window.iter().filter(|ok| **ok).count();
        Some(successes as f64 / inner.window.len() as f64)
    }

    /// Introspection snapshot for the status surface.
    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock().unwrap();
        BreakerMetrics {
            state: inner.state,
            window_len: inner.window.len(),
            window_failures: inner.window.iter().filter(|ok| !**ok).count(),
            trials_remaining: inner.trials_remaining,
            since_transition: inner.last_transition.elapsed(),
        }
    }

    fn to_open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.last_transition = Instant::now();
        inner.trials_remaining = 0;
        inner.trial_successes = 0;
        counter!("orchestrator_breaker_opened_total", 1, "provider" => self.provider.clone());
    }

    fn to_half_open(&self, inner: &mut BreakerInner) {
        info!(provider = %self.provider, trials = %self.config.half_open_trials, "Open timeout elapsed, probing provider");
        inner.state = CircuitState::HalfOpen;
        inner.last_transition = Instant::now();
        inner.trials_remaining = self.config.half_open_trials;
        inner.trial_successes = 0;
        counter!("orchestrator_breaker_half_open_total", 1, "provider" => self.provider.clone());
    }

    fn to_closed(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.last_transition = Instant::now();
        inner.opened_at = None;
        inner.window.clear();
        inner.trials_remaining = 0;
        inner.trial_successes = 0;
        counter!("orchestrator_breaker_closed_total", 1, "provider" => self.provider.clone());
    }
}

/// Immutable map of one breaker per configured provider.
///
/// Built once at orchestrator construction; unrelated providers never share
/// an exclusion domain.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(providers: &[String], config: BreakerConfig) -> Self {
        let breakers = providers
            .iter()
            .map(|p| (p.clone(), Arc::new(CircuitBreaker::new(p.clone(), config.clone()))))
            .collect();
        Self { breakers }
    }

    /// Breaker for a configured provider. Providers are fixed at
    /// construction, so a miss is a caller bug surfaced as a panic in tests
    /// and never reachable through the public API.
    pub fn get(&self, provider: &str) -> &Arc<CircuitBreaker> {
        &self.breakers[provider]
    }

    /// Per-provider state snapshot for the status surface.
    pub fn states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 0.5,
            min_sample: 10,
            open_timeout: Duration::from_millis(100),
            half_open_trials: 3,
        }
    }

    #[test]
    fn test_closed_allows_and_stays_closed_under_threshold() {
        let cb = CircuitBreaker::new("p", config());
        assert!(cb.allow());
        for i in 0..10 {
            // 5 of 10 fail: ratio 0.5 does not exceed the 0.5 threshold.
            cb.record(i % 2 == 0);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_when_ratio_exceeds_threshold() {
        let cb = CircuitBreaker::new("p", config());
        for i in 0..10 {
            // 6 of 10 fail.
            cb.record(i >= 6);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
    }

    #[test]
    fn test_no_verdict_before_min_sample() {
        let cb = CircuitBreaker::new("p", config());
        for _ in 0..9 {
            cb.record(false);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_transitions_to_half_open_after_timeout() {
        let cb = CircuitBreaker::new("p", config());
        for _ in 0..10 {
            cb.record(false);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());

        std::thread::sleep(Duration::from_millis(150));

        // The allowing call itself transitions and consumes one trial.
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_trial_successes() {
        let cb = CircuitBreaker::new("p", config());
        for _ in 0..10 {
            cb.record(false);
        }
        std::thread::sleep(Duration::from_millis(150));

        for _ in 0..3 {
            assert!(cb.allow());
            cb.record(true);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        // Window was reset on close.
        assert_eq!(cb.window_success_rate(), None);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("p", config());
        for _ in 0..10 {
            cb.record(false);
        }
        std::thread::sleep(Duration::from_millis(150));

        assert!(cb.allow());
        cb.record(false);
        assert_eq!(cb.state(), CircuitState::Open);
        // Timer restarted: still rejecting immediately after reopening.
        assert!(!cb.allow());
    }

    #[test]
    fn test_half_open_budget_is_bounded() {
        let cb = CircuitBreaker::new("p", config());
        for _ in 0..10 {
            cb.record(false);
        }
        std::thread::sleep(Duration::from_millis(150));

        assert!(cb.allow());
        assert!(cb.allow());
        assert!(cb.allow());
        // Budget of 3 spent with no recorded outcomes yet.
        assert!(!cb.allow());
        assert_eq!(cb.metrics().trials_remaining, 0);
    }

    #[test]
    fn test_is_callable_does_not_consume_budget() {
        let cb = CircuitBreaker::new("p", config());
        for _ in 0..10 {
            cb.record(false);
        }
        assert!(!cb.is_callable());
        std::thread::sleep(Duration::from_millis(150));
        assert!(cb.is_callable());
        assert!(cb.is_callable());
        // Still open until a consuming allow() runs.
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
