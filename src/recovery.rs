//! Self-healing recovery engine
//!
//! Classifies every non-success call outcome into a single failure tag,
//! selects a recovery action by learned per-(tag, action) effectiveness, and
//! feeds the result of each attempt back into that table so strategy choice
//! improves over the life of the process. Also owns the process-wide
//! degraded-service flag and the rolling response-quality baselines.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::types::{FailureEvent, FailureKind, ProviderFailure, RecoveryAction};

/// Recent failure events retained per classification tag.
const HISTORY_CAPACITY: usize = 64;

/// Quality observations required before degradation detection activates.
const MIN_QUALITY_OBSERVATIONS: u32 = 5;

/// A quality sample below this fraction of the rolling baseline counts as
/// degraded.
const QUALITY_DROP_RATIO: f64 = 0.7;

/// EWMA weight for new quality samples.
const QUALITY_EWMA_ALPHA: f64 = 0.2;

/// Raw failure signal from the call-execution path, before classification.
#[derive(Debug)]
pub enum CallSignal<'a> {
    /// The invoker returned an error
    Failed(&'a ProviderFailure),
    /// The orchestrator-side deadline elapsed before the invoker returned
    DeadlineElapsed,
    /// The provider's circuit breaker rejected the call without attempting it
    BreakerRejected,
    /// The response-quality signal fell below the rolling baseline
    QualityDrop { quality: f64, baseline: f64 },
}

/// What the execution path should do about a classified failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub action: RecoveryAction,
    /// Backoff to sleep before the next attempt, for RetryWithBackoff
    pub delay: Option<Duration>,
}

/// Recovery tuning, extracted from the orchestrator config.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub slow_latency_threshold_ms: u64,
}

impl From<&OrchestratorConfig> for RecoveryConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            retry_max_attempts: config.retry_max_attempts,
            retry_base_delay: config.retry_base_delay,
            retry_max_delay: config.retry_max_delay,
            slow_latency_threshold_ms: config.slow_latency_threshold_ms,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ActionStats {
    successes: u64,
    attempts: u64,
}

impl ActionStats {
    fn ratio(&self) -> f64 {
        if self.attempts == 0 {
            // Unexplored actions start at even odds so they stay reachable.
            0.5
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// One row of the learned effectiveness table, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectivenessEntry {
    pub kind: FailureKind,
    pub action: RecoveryAction,
    pub successes: u64,
    pub attempts: u64,
    pub ratio: f64,
}

#[derive(Debug, Default)]
struct QualityBaseline {
    ewma: f64,
    observations: u32,
}

/// The recovery engine. One instance per orchestrator; all state is
/// in-memory for the life of the process.
#[derive(Debug)]
pub struct RecoveryEngine {
    config: RecoveryConfig,
    effectiveness: Mutex<HashMap<(FailureKind, RecoveryAction), ActionStats>>,
    history: Mutex<HashMap<FailureKind, VecDeque<FailureEvent>>>,
    baselines: Mutex<HashMap<String, QualityBaseline>>,
    degraded: Arc<AtomicBool>,
}

impl RecoveryEngine {
    pub fn new(config: RecoveryConfig) -> Self {
        // Seed priors so the cold-start policy matches the error taxonomy:
        // timeouts and throttling retry with backoff, unavailable and slow
        // providers get substituted, resource exhaustion backs off. Five
        // pseudo-observations at 0.8 keep the seeded action ahead of the
        // 0.5 unexplored default through a couple of failed attempts, while
        // real evidence still overturns it quickly.
        let mut effectiveness = HashMap::new();
        let prior = ActionStats {
            successes: 4,
            attempts: 5,
        };
        for (kind, action) in [
            (FailureKind::Timeout, RecoveryAction::RetryWithBackoff),
            (FailureKind::RateLimited, RecoveryAction::RetryWithBackoff),
            (FailureKind::ResourceExhausted, RecoveryAction::RetryWithBackoff),
            (FailureKind::Unavailable, RecoveryAction::SwitchProvider),
            (FailureKind::Slow, RecoveryAction::SwitchProvider),
            (FailureKind::BreakerOpen, RecoveryAction::SwitchProvider),
            (FailureKind::DegradedQuality, RecoveryAction::SwitchProvider),
        ] {
            effectiveness.insert((kind, action), prior);
        }

        Self {
            config,
            effectiveness: Mutex::new(effectiveness),
            history: Mutex::new(HashMap::new()),
            baselines: Mutex::new(HashMap::new()),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Assigns exactly one failure tag to a raw failure signal and retains
    /// the event in the per-tag history.
    pub fn classify(
        &self,
        provider: &str,
        workload_class: &str,
        signal: CallSignal<'_>,
        latency: Duration,
    ) -> FailureEvent {
        let latency_ms = latency.as_millis() as u64;
        let (kind, detail) = match signal {
            CallSignal::DeadlineElapsed => (
                FailureKind::Timeout,
                format!("deadline elapsed after {}ms", latency_ms),
            ),
            CallSignal::BreakerRejected => (
                FailureKind::BreakerOpen,
                "circuit breaker rejected the call".to_string(),
            ),
            CallSignal::QualityDrop { quality, baseline } => (
                FailureKind::DegradedQuality,
                format!("quality {:.3} below rolling baseline {:.3}", quality, baseline),
            ),
            CallSignal::Failed(failure) => (classify_provider_failure(failure), failure.to_string()),
        };
        self.retain_event(kind, provider, workload_class, detail)
    }

    /// Checks a completed call against the slow-latency threshold. A slow
    /// success still returns its payload to the submitter, but produces a
    /// `Slow` event so routing steers away from the provider.
    pub fn classify_slow(
        &self,
        provider: &str,
        workload_class: &str,
        latency: Duration,
    ) -> Option<FailureEvent> {
        let latency_ms = latency.as_millis() as u64;
        if latency_ms <= self.config.slow_latency_threshold_ms {
            return None;
        }
        let detail = format!(
            "completed in {}ms, over the {}ms threshold",
            latency_ms, self.config.slow_latency_threshold_ms
        );
        Some(self.retain_event(FailureKind::Slow, provider, workload_class, detail))
    }

    fn retain_event(
        &self,
        kind: FailureKind,
        provider: &str,
        workload_class: &str,
        detail: String,
    ) -> FailureEvent {
        let event = FailureEvent {
            kind,
            provider: provider.to_string(),
            workload_class: workload_class.to_string(),
            timestamp: Utc::now(),
            detail,
        };

        debug!(
            provider = %event.provider,
            workload = %event.workload_class,
            kind = %event.kind,
            detail = %event.detail,
            "Classified call failure"
        );
        counter!("orchestrator_failure_total", 1, "kind" => kind.as_str());

        let mut history = self.history.lock().unwrap();
        let buffer = history.entry(kind).or_default();
        if buffer.len() == HISTORY_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(event.clone());

        event
    }

    /// Picks the recovery action with the best learned effectiveness for the
    /// event's tag. `attempt` counts the backoff retries already spent on
    /// this work item; once it reaches the configured maximum, any
    /// non-switch action escalates to SwitchProvider.
    pub fn recover(&self, event: &FailureEvent, attempt: u32) -> RecoveryPlan {
        let mut action = self.best_action(event.kind);

        if attempt >= self.config.retry_max_attempts && action != RecoveryAction::SwitchProvider {
            warn!(
                provider = %event.provider,
                kind = %event.kind,
                attempts = %attempt,
                from = %action,
                "Retry budget exhausted, escalating to provider switch"
            );
            action = RecoveryAction::SwitchProvider;
        }

        let delay = if action == RecoveryAction::RetryWithBackoff {
            Some(self.backoff_delay(event.kind, attempt))
        } else {
            None
        };

        info!(
            provider = %event.provider,
            workload = %event.workload_class,
            kind = %event.kind,
            action = %action,
            delay_ms = %delay.map(|d| d.as_millis() as u64).unwrap_or(0),
            "Selected recovery action"
        );
        counter!(
            "orchestrator_recovery_action_total",
            1,
            "kind" => event.kind.as_str(),
            "action" => action.as_str()
        );

        RecoveryPlan { action, delay }
    }

    /// Updates the (tag, action) effectiveness ratio with an observed result.
    pub fn record_outcome(&self, kind: FailureKind, action: RecoveryAction, resolved: bool) {
        let mut table = self.effectiveness.lock().unwrap();
        let stats = table.entry((kind, action)).or_default();
        stats.attempts += 1;
        if resolved {
            stats.successes += 1;
        }
        counter!(
            "orchestrator_recovery_outcome_total",
            1,
            "action" => action.as_str(),
            "resolved" => if resolved { "true" } else { "false" }
        );
    }

    /// Exponential backoff with jitter: base delay doubled per attempt,
    /// capped, doubled once more for rate-limited failures, plus 0-10%
    /// random jitter.
    pub fn backoff_delay(&self, kind: FailureKind, attempt: u32) -> Duration {
        let base_ms = self.config.retry_base_delay.as_millis() as f64;
        let max_ms = self.config.retry_max_delay.as_millis() as f64;
        let mut delay_ms = base_ms * 2f64.powi(attempt.min(16) as i32);
        if kind == FailureKind::RateLimited {
            delay_ms *= 2.0;
        }
        delay_ms = delay_ms.min(max_ms);
        let jitter = rand::thread_rng().gen_range(0.0..=delay_ms * 0.1);
        Duration::from_millis((delay_ms + jitter) as u64)
    }

    /// Folds a response-quality sample into the per-workload baseline.
    /// Returns the baseline when the sample counts as degraded; degraded
    /// samples do not move the baseline, so it cannot chase a failing
    /// provider downward.
    pub fn check_quality(&self, workload_class: &str, quality: f64) -> Option<f64> {
        let mut baselines = self.baselines.lock().unwrap();
        let baseline = baselines.entry(workload_class.to_string()).or_default();
        if baseline.observations >= MIN_QUALITY_OBSERVATIONS
            && quality < baseline.ewma * QUALITY_DROP_RATIO
        {
            return Some(baseline.ewma);
        }
        if baseline.observations == 0 {
            baseline.ewma = quality;
        } else {
            baseline.ewma = QUALITY_EWMA_ALPHA * quality + (1.0 - QUALITY_EWMA_ALPHA) * baseline.ewma;
        }
        baseline.observations += 1;
        None
    }

    /// Marks the process degraded: upstream collaborators disable optional,
    /// expensive feature paths until the next successful call clears this.
    pub fn set_degraded(&self) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!("Entering degraded service mode");
            counter!("orchestrator_degraded_mode_entered_total", 1);
        }
    }

    /// Clears the degraded flag; called on every successful call.
    pub fn note_success(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!("Leaving degraded service mode");
        }
    }

    /// Whether the process is currently in degraded service mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Drops soft learned state (quality baselines). The ClearCache recovery
    /// action invokes this; the router clears its own stickiness alongside.
    pub fn clear_soft_state(&self) {
        self.baselines.lock().unwrap().clear();
        info!("Cleared quality baselines");
    }

    /// Recent failure events for one tag, oldest first.
    pub fn recent_failures(&self, kind: FailureKind) -> Vec<FailureEvent> {
        self.history
            .lock()
            .unwrap()
            .get(&kind)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Read-only copy of the learned effectiveness table.
    pub fn effectiveness_snapshot(&self) -> Vec<EffectivenessEntry> {
        let table = self.effectiveness.lock().unwrap();
        let mut entries: Vec<EffectivenessEntry> = table
            .iter()
            .map(|((kind, action), stats)| EffectivenessEntry {
                kind: *kind,
                action: *action,
                successes: stats.successes,
                attempts: stats.attempts,
                ratio: stats.ratio(),
            })
            .collect();
        entries.sort_by(|a, b| {
            (a.kind.as_str(), a.action.as_str()).cmp(&(b.kind.as_str(), b.action.as_str()))
        });
        entries
    }

    /// Highest-ratio action for a tag. Candidates are scanned in a fixed
    /// order with a strictly-greater comparison, so ties break toward
    /// SwitchProvider.
    fn best_action(&self, kind: FailureKind) -> RecoveryAction {
        let table = self.effectiveness.lock().unwrap();
        let mut best = RecoveryAction::CANDIDATES[0];
        let mut best_ratio = f64::MIN;
        for action in RecoveryAction::CANDIDATES {
            let ratio = table
                .get(&(kind, action))
                .copied()
                .unwrap_or_default()
                .ratio();
            if ratio > best_ratio {
                best = action;
                best_ratio = ratio;
            }
        }
        best
    }
}

/// Maps an invoker error to a failure tag. Structured signals win; free-form
/// text is sniffed for throttling, deadline, and resource markers.
/// Unclassifiable errors default to Unavailable.
fn classify_provider_failure(failure: &ProviderFailure) -> FailureKind {
    match failure {
        ProviderFailure::ConnectionRefused(_) => FailureKind::Unavailable,
        ProviderFailure::DeadlineExceeded(_) => FailureKind::Timeout,
        ProviderFailure::Http { status: 429, .. } => FailureKind::RateLimited,
        ProviderFailure::Http { status, message } => {
            let text = message.to_ascii_lowercase();
            if text.contains("quota") || text.contains("rate limit") {
                FailureKind::RateLimited
            } else if *status == 507 || text.contains("resource exhausted") || text.contains("overloaded") {
                FailureKind::ResourceExhausted
            } else {
                FailureKind::Unavailable
            }
        }
        ProviderFailure::Other(message) => {
            let text = message.to_ascii_lowercase();
            if text.contains("connection refused") {
                FailureKind::Unavailable
            } else if text.contains("quota") || text.contains("rate limit") || text.contains("too many requests") {
                FailureKind::RateLimited
            } else if text.contains("deadline") || text.contains("timed out") || text.contains("timeout") {
                FailureKind::Timeout
            } else if text.contains("resource exhausted") || text.contains("out of memory") || text.contains("overloaded") {
                FailureKind::ResourceExhausted
            } else {
                FailureKind::Unavailable
            }
        }
    }
}
