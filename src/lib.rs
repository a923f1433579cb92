//! # Provider Orchestrator
//!
//! A resilient request-orchestration core that admits, dispatches, and
//! recovers calls made to interchangeable, unreliable external compute
//! providers (LLM inference backends and similar).
//!
//! This crate provides:
//!
//! - An admission queue with priority classes, queue-depth backpressure,
//!   and global plus per-submitter concurrency ceilings
//! - A per-provider circuit breaker over a sliding outcome window
//! - An adaptive router that ranks providers per workload class from
//!   recorded success rate, latency percentiles, and cost
//! - A self-healing recovery engine that classifies failures and learns
//!   which recovery action works best per failure class
//!
//! ## Architecture
//!
//! Upstream collaborators see two operations: [`Orchestrator::submit`] and
//! [`Orchestrator::status`]. They supply the actual network call as a
//! [`ProviderInvoker`], an opaque capability the core drives under a
//! deadline; the core only observes success, failure, latency, and cost as
//! scalar signals. Each admitted item flows through
//! router selection, a breaker-guarded provider call, and, on failure, the
//! recovery engine, with every outcome recorded back into the performance
//! ledger and the provider's breaker.

pub mod circuit_breaker;
pub mod config;
pub mod ledger;
pub mod queue;
pub mod recovery;
pub mod router;
pub mod types;

// Re-export the public surface
pub use circuit_breaker::{BreakerMetrics, CircuitBreaker, CircuitState};
pub use config::OrchestratorConfig;
pub use ledger::{PerformanceLedger, ProfileSnapshot};
pub use queue::{Orchestrator, StatusSnapshot};
pub use recovery::{EffectivenessEntry, RecoveryEngine};
pub use router::{AdaptiveRouter, Route};
pub use types::{
    Completed, FailureEvent, FailureKind, OrchestratorError, Priority, ProviderFailure,
    ProviderInvoker, ProviderResponse, RecoveryAction, RecoveryOutcome, Result, WorkItem,
};

#[cfg(test)]
mod tests;
