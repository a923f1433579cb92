//! Core types for the orchestration pipeline
//!
//! This module defines the work items accepted by the admission queue, the
//! outcome and error types returned to submitters, the failure taxonomy used
//! by the recovery engine, and the provider-invoker capability trait that
//! abstracts the actual network call to a compute backend.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Priority class of a work item, ordered from most to least urgent.
///
/// Dequeue always scans classes in this order. Sustained high-priority load
/// can starve lower classes indefinitely; that is the intended policy, there
/// is no aging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Interactive, latency-sensitive work
    Urgent,
    /// Default class for ordinary requests
    Normal,
    /// Bulk work that tolerates delay
    Batch,
    /// Housekeeping that runs only when nothing else is waiting
    Maintenance,
}

impl Priority {
    /// All classes in strict dequeue order.
    pub const ALL: [Priority; 4] = [
        Priority::Urgent,
        Priority::Normal,
        Priority::Batch,
        Priority::Maintenance,
    ];

    /// Sub-queue index for this class.
    pub fn index(self) -> usize {
        match self {
            Priority::Urgent => 0,
            Priority::Normal => 1,
            Priority::Batch => 2,
            Priority::Maintenance => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Urgent => write!(f, "urgent"),
            Priority::Normal => write!(f, "normal"),
            Priority::Batch => write!(f, "batch"),
            Priority::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// A unit of work submitted to the orchestrator.
///
/// The payload is opaque to the core: it is handed verbatim to the provider
/// invoker. The workload class scopes performance tracking, since a provider
/// may be strong at one task type and weak at another.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Unique id for tracing this item through logs
    pub id: Uuid,
    /// Identity of the submitter, used for per-submitter concurrency limits
    pub submitter: String,
    /// Caller-defined category used to scope provider performance tracking
    pub workload_class: String,
    /// Priority class for dequeue ordering
    pub priority: Priority,
    /// Opaque request payload passed through to the provider invoker
    pub payload: serde_json::Value,
    /// Optional per-item time-to-expiration override
    pub ttl: Option<Duration>,
}

impl WorkItem {
    /// Creates a work item with the default expiration from the queue config.
    pub fn new<S, W>(submitter: S, workload_class: W, priority: Priority, payload: serde_json::Value) -> Self
    where
        S: Into<String>,
        W: Into<String>,
    {
        Self {
            id: Uuid::new_v4(),
            submitter: submitter.into(),
            workload_class: workload_class.into(),
            priority,
            payload,
            ttl: None,
        }
    }

    /// Overrides the expiration deadline for this item.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Successful outcome of a submitted work item.
#[derive(Debug, Clone)]
pub struct Completed {
    /// Id of the originating work item
    pub work_id: Uuid,
    /// Provider that produced the final response
    pub provider: String,
    /// Opaque response payload from the provider
    pub payload: serde_json::Value,
    /// Latency of the final (successful) provider call
    pub latency: Duration,
    /// Total provider call attempts, including recovered failures
    pub attempts: u32,
}

/// Classification tag assigned to every non-success call outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Call completed but exceeded the slow-latency threshold
    Slow,
    /// Provider unreachable or returned an unclassifiable error
    Unavailable,
    /// Provider throttled the call (HTTP 429 or quota text)
    RateLimited,
    /// Deadline exceeded before the provider responded
    Timeout,
    /// Response quality fell below the rolling baseline
    DegradedQuality,
    /// Provider reported resource exhaustion
    ResourceExhausted,
    /// The provider's circuit breaker rejected the call without attempting it
    BreakerOpen,
}

impl FailureKind {
    /// All kinds, used to size per-kind history buffers.
    pub const ALL: [FailureKind; 7] = [
        FailureKind::Slow,
        FailureKind::Unavailable,
        FailureKind::RateLimited,
        FailureKind::Timeout,
        FailureKind::DegradedQuality,
        FailureKind::ResourceExhausted,
        FailureKind::BreakerOpen,
    ];

    /// Stable name for logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Slow => "slow",
            FailureKind::Unavailable => "unavailable",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Timeout => "timeout",
            FailureKind::DegradedQuality => "degraded_quality",
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::BreakerOpen => "breaker_open",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified failure observed on the call-execution path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    /// Classification tag, exactly one per event
    pub kind: FailureKind,
    /// Provider involved in the failed call
    pub provider: String,
    /// Workload class of the failed work item
    pub workload_class: String,
    /// When the failure was observed
    pub timestamp: DateTime<Utc>,
    /// Free-form diagnostic context
    pub detail: String,
}

/// Recovery action chosen by the self-healing engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Route the work to a different provider
    SwitchProvider,
    /// Retry the same provider after an exponential backoff
    RetryWithBackoff,
    /// Set the process-wide degraded flag and retry
    DegradeService,
    /// Drop soft learned state (baselines, routing preference) and retry
    ClearCache,
    /// No recovery possible, surface the failure
    None,
}

impl RecoveryAction {
    /// Candidate actions the engine learns over, in tie-break order.
    /// SwitchProvider first: it is the least disruptive default.
    pub const CANDIDATES: [RecoveryAction; 4] = [
        RecoveryAction::SwitchProvider,
        RecoveryAction::RetryWithBackoff,
        RecoveryAction::DegradeService,
        RecoveryAction::ClearCache,
    ];

    /// Stable name for logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryAction::SwitchProvider => "switch_provider",
            RecoveryAction::RetryWithBackoff => "retry_with_backoff",
            RecoveryAction::DegradeService => "degrade_service",
            RecoveryAction::ClearCache => "clear_cache",
            RecoveryAction::None => "none",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a single recovery attempt, fed back into the effectiveness table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    /// Action that was attempted
    pub action: RecoveryAction,
    /// Whether the action resolved the failure
    pub resolved: bool,
}

/// Response returned by a provider invoker on success.
///
/// The payload is opaque; the core only consumes the scalar signals.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Opaque response content
    pub payload: serde_json::Value,
    /// Cost attributed to this request, in whatever unit the caller tracks
    pub cost: f64,
    /// Optional response-quality signal in [0, 1], used for degradation
    /// detection against a rolling baseline
    pub quality: Option<f64>,
}

impl ProviderResponse {
    /// Response with no cost or quality signal.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            cost: 0.0,
            quality: None,
        }
    }

    /// Sets the per-request cost.
    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Sets the response-quality signal.
    pub fn quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality);
        self
    }
}

/// Error surfaced by a provider invoker.
///
/// Variants carry the transport and status signals the recovery engine's
/// classifier inspects; anything it cannot recognize classifies as
/// `Unavailable`.
#[derive(Error, Debug, Clone)]
pub enum ProviderFailure {
    /// Transport-level connection failure
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// HTTP-level failure with a status code
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The provider reported its own deadline exceeded
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Any other provider-side error
    #[error("provider error: {0}")]
    Other(String),
}

/// Capability supplied by the caller that performs the actual provider call.
///
/// The core never constructs payloads or interprets response content; it
/// observes success, failure, latency, and cost as scalar signals only.
#[async_trait]
pub trait ProviderInvoker: Send + Sync {
    /// Executes the request against the named provider. The call should not
    /// outlive `deadline`; the orchestrator additionally enforces it with a
    /// timeout and abandons the call caller-side.
    async fn invoke(
        &self,
        provider_id: &str,
        payload: &serde_json::Value,
        deadline: Duration,
    ) -> std::result::Result<ProviderResponse, ProviderFailure>;
}

/// Main error type for the orchestrator's public boundary.
///
/// Every rejection carries a machine-readable tag (the variant) plus
/// human-readable context. The first three variants are policy decisions and
/// are never retried internally.
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    /// Queue depth reached the reject threshold; admission refused outright
    #[error("backpressure: {outstanding} items outstanding at or beyond reject threshold {threshold}")]
    BackpressureRejected { outstanding: usize, threshold: usize },

    /// The submitter already has its maximum number of calls in flight
    #[error("submitter '{submitter}' has {in_flight} calls in flight (limit {limit})")]
    OverSubmitterLimit {
        submitter: String,
        in_flight: usize,
        limit: usize,
    },

    /// The item's age exceeded its expiration deadline before dispatch
    #[error("work item expired after {queued_ms}ms without dispatch")]
    Expired { queued_ms: u64 },

    /// No candidate provider is currently callable for this workload
    #[error("no provider available for workload '{workload_class}'")]
    ProviderUnavailable { workload_class: String },

    /// Terminal failure of the last attempted provider after recovery exhaustion
    #[error("provider '{provider}' failed after recovery ({kind}): {detail}")]
    CallFailed {
        provider: String,
        kind: FailureKind,
        detail: String,
    },

    /// Malformed configuration detected at construction time
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Orchestrator-internal fault, e.g. a dropped outcome channel
    #[error("internal error: {0}")]
    Internal(String),
}
