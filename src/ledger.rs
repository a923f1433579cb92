//! Provider performance ledger
//!
//! Pure data store of historical call outcomes per (provider, workload-class)
//! pair: request/success counts, a bounded latency reservoir for percentile
//! estimates, and a rolling cost figure, all folded into a single comparable
//! score the router ranks candidates by.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Samples retained per profile for percentile and cost estimates.
/// Profiles accumulate for the life of the process; the ring caps memory.
const RESERVOIR_CAPACITY: usize = 256;

/// Score assigned to a provider with no recorded history, so unexplored
/// candidates still get routed to.
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Per-(provider, workload-class) performance history.
#[derive(Debug, Default)]
pub struct ProviderProfile {
    requests: u64,
    successes: u64,
    latencies_ms: VecDeque<f64>,
    costs: VecDeque<f64>,
}

impl ProviderProfile {
    /// Records one completed call.
    pub fn record(&mut self, success: bool, latency: Duration, cost: f64) {
        self.requests += 1;
        if success {
            self.successes += 1;
        }
        if self.latencies_ms.len() == RESERVOIR_CAPACITY {
            self.latencies_ms.pop_front();
        }
        self.latencies_ms.push_back(latency.as_secs_f64() * 1000.0);
        if self.costs.len() == RESERVOIR_CAPACITY {
            self.costs.pop_front();
        }
        self.costs.push_back(cost);
    }

    /// Cumulative request count.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Cumulative success rate in [0, 1]; 0 with no history.
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }

    /// Nearest-rank percentile over the latency reservoir, in milliseconds.
    pub fn latency_percentile(&self, percentile: f64) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.clamp(1, sorted.len()) - 1])
    }

    /// Rolling mean cost per request over the reservoir.
    pub fn cost_per_request(&self) -> f64 {
        if self.costs.is_empty() {
            return 0.0;
        }
        self.costs.iter().sum::<f64>() / self.costs.len() as f64
    }

    /// Composite routing score. Higher is better; a provider with no history
    /// gets [`NEUTRAL_SCORE`] so it can be explored.
    pub fn score(&self) -> f64 {
        if self.requests == 0 {
            return NEUTRAL_SCORE;
        }
        let p95 = self.latency_percentile(95.0).unwrap_or(0.0);
        self.success_rate() * 100.0 - p95 / 10.0 - self.cost_per_request() * 100.0
    }
}

/// Read-only view of one profile, for the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub provider: String,
    pub workload_class: String,
    pub requests: u64,
    pub success_rate: f64,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
    pub cost_per_request: f64,
    pub score: f64,
}

/// Thread-safe store of provider profiles, keyed by (provider, workload).
///
/// Profiles are only appended to; they live for the life of the process.
#[derive(Debug, Default)]
pub struct PerformanceLedger {
    profiles: Mutex<HashMap<(String, String), ProviderProfile>>,
}

impl PerformanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a completed call against the (provider, workload) profile.
    pub fn record(&self, provider: &str, workload_class: &str, success: bool, latency: Duration, cost: f64) {
        let mut profiles = self.profiles.lock().unwrap();
        profiles
            .entry((provider.to_string(), workload_class.to_string()))
            .or_default()
            .record(success, latency, cost);
    }

    /// Current score for a candidate; [`NEUTRAL_SCORE`] when unseen.
    pub fn score(&self, provider: &str, workload_class: &str) -> f64 {
        let profiles = self.profiles.lock().unwrap();
        profiles
            .get(&(provider.to_string(), workload_class.to_string()))
            .map(ProviderProfile::score)
            .unwrap_or(NEUTRAL_SCORE)
    }

    /// Snapshot of every profile, for monitoring collaborators.
    pub fn snapshot(&self) -> Vec<ProfileSnapshot> {
        let profiles = self.profiles.lock().unwrap();
        let mut out: Vec<ProfileSnapshot> = profiles
            .iter()
            .map(|((provider, workload_class), profile)| ProfileSnapshot {
                provider: provider.clone(),
                workload_class: workload_class.clone(),
                requests: profile.requests(),
                success_rate: profile.success_rate(),
                latency_p50_ms: profile.latency_percentile(50.0),
                latency_p95_ms: profile.latency_percentile(95.0),
                latency_p99_ms: profile.latency_percentile(99.0),
                cost_per_request: profile.cost_per_request(),
                score: profile.score(),
            })
            .collect();
        out.sort_by(|a, b| {
            (a.provider.as_str(), a.workload_class.as_str())
                .cmp(&(b.provider.as_str(), b.workload_class.as_str()))
        });
        out
    }
}
