//! Orchestrator configuration
//!
//! A fixed set of named options covering admission, breaker, retry, and
//! routing behavior. Validation happens once at construction; a malformed
//! configuration is the only error the orchestrator raises before accepting
//! work.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{OrchestratorError, Result};

/// Configuration for the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum calls in flight across all submitters
    pub max_concurrent_global: usize,

    /// Maximum calls in flight per submitter identity
    pub max_concurrent_per_submitter: usize,

    /// Maximum outstanding (queued + in flight) items before rejection math
    pub queue_capacity: usize,

    /// Fraction of `queue_capacity` at which admission starts warning
    pub warn_ratio: f64,

    /// Fraction of `queue_capacity` at which admission rejects outright
    pub reject_ratio: f64,

    /// Default time-to-expiration for a work item, measured from enqueue
    pub expiration: Duration,

    /// Failure ratio over the breaker window that opens the circuit
    pub breaker_failure_threshold: f64,

    /// Observations required in the window before the ratio is evaluated;
    /// also bounds the window size
    pub breaker_min_sample: usize,

    /// How long an open breaker fast-fails before probing again
    pub breaker_open_timeout: Duration,

    /// Trial calls allowed through in half-open before a verdict
    pub breaker_half_open_trials: usize,

    /// Backoff-retry attempts before escalating to a provider switch
    pub retry_max_attempts: u32,

    /// Base delay for exponential backoff
    pub retry_base_delay: Duration,

    /// Cap on the computed backoff delay
    pub retry_max_delay: Duration,

    /// Latency above which a completed call is classified as slow
    pub slow_latency_threshold_ms: u64,

    /// Relative score advantage an alternate needs before the router
    /// switches its sticky preference (0.3 = 30% higher)
    pub unhealthy_score_margin: f64,

    /// Rolling success rate below which the router treats a provider as
    /// unhealthy even before its breaker opens
    pub degraded_health_floor: f64,

    /// Worker tasks draining the queue. Independent of
    /// `max_concurrent_global`: workers throttle on the in-flight counter,
    /// not on their own count.
    pub workers: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_global: 8,
            max_concurrent_per_submitter: 4,
            queue_capacity: 100,
            warn_ratio: 0.7,
            reject_ratio: 0.95,
            expiration: Duration::from_secs(30),
            breaker_failure_threshold: 0.5,
            breaker_min_sample: 10,
            breaker_open_timeout: Duration::from_secs(30),
            breaker_half_open_trials: 3,
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            slow_latency_threshold_ms: 5000,
            unhealthy_score_margin: 0.3,
            degraded_health_floor: 0.3,
            workers: 4,
        }
    }
}

impl OrchestratorConfig {
    /// Validates the configuration, returning a `Configuration` error for
    /// any value outside its legal range.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_global == 0 {
            return Err(invalid("max_concurrent_global must be at least 1"));
        }
        if self.max_concurrent_per_submitter == 0 {
            return Err(invalid("max_concurrent_per_submitter must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.warn_ratio) {
            return Err(invalid("warn_ratio must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.reject_ratio) {
            return Err(invalid("reject_ratio must be within [0, 1]"));
        }
        if self.warn_ratio > self.reject_ratio {
            return Err(invalid("warn_ratio must not exceed reject_ratio"));
        }
        if self.expiration.is_zero() {
            return Err(invalid("expiration must be non-zero"));
        }
        if !(self.breaker_failure_threshold > 0.0 && self.breaker_failure_threshold <= 1.0) {
            return Err(invalid("breaker_failure_threshold must be within (0, 1]"));
        }
        if self.breaker_min_sample == 0 {
            return Err(invalid("breaker_min_sample must be at least 1"));
        }
        if self.breaker_half_open_trials == 0 {
            return Err(invalid("breaker_half_open_trials must be at least 1"));
        }
        if self.retry_base_delay.is_zero() {
            return Err(invalid("retry_base_delay must be non-zero"));
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(invalid("retry_max_delay must be at least retry_base_delay"));
        }
        if self.unhealthy_score_margin < 0.0 {
            return Err(invalid("unhealthy_score_margin must be non-negative"));
        }
        if !(0.0..1.0).contains(&self.degraded_health_floor) {
            return Err(invalid("degraded_health_floor must be within [0, 1)"));
        }
        if self.workers == 0 {
            return Err(invalid("workers must be at least 1"));
        }
        Ok(())
    }

    /// Outstanding-item count at which admission starts warning.
    pub fn warn_threshold(&self) -> usize {
        (self.warn_ratio * self.queue_capacity as f64).ceil() as usize
    }

    /// Outstanding-item count at which admission rejects.
    pub fn reject_threshold(&self) -> usize {
        (self.reject_ratio * self.queue_capacity as f64).ceil() as usize
    }
}

fn invalid(msg: &str) -> OrchestratorError {
    OrchestratorError::Configuration(msg.to_string())
}
