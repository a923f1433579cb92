//! Adaptive provider router
//!
//! Picks a primary and fallback provider for each workload class by ranking
//! candidates on their ledger score, filtered by breaker health and a
//! proactive rolling-health floor. The router keeps a sticky per-workload
//! preference and only switches when an alternate's score advantage clears
//! the configured margin, so routing does not flap on small score noise.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::circuit_breaker::BreakerRegistry;
use crate::config::OrchestratorConfig;
use crate::ledger::PerformanceLedger;
use crate::types::{OrchestratorError, Result};

/// Routing decision for one selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Highest-ranked callable candidate
    pub primary: String,
    /// Second-best candidate; `None` signals degraded redundancy
    pub fallback: Option<String>,
}

/// Router tuning, extracted from the orchestrator config.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Relative score advantage required to displace the sticky preference
    pub unhealthy_score_margin: f64,
    /// Rolling window success rate below which a candidate is skipped even
    /// with a closed breaker
    pub degraded_health_floor: f64,
}

impl From<&OrchestratorConfig> for RouterConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            unhealthy_score_margin: config.unhealthy_score_margin,
            degraded_health_floor: config.degraded_health_floor,
        }
    }
}

/// Scores candidates from the performance ledger and records outcomes back
/// into it and the per-provider breakers.
#[derive(Debug)]
pub struct AdaptiveRouter {
    config: RouterConfig,
    ledger: Arc<PerformanceLedger>,
    breakers: Arc<BreakerRegistry>,
    /// Sticky primary per workload class; switches apply at the next
    /// selection, never mid-flight
    preferred: Mutex<HashMap<String, String>>,
}

impl AdaptiveRouter {
    pub fn new(config: RouterConfig, ledger: Arc<PerformanceLedger>, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            config,
            ledger,
            breakers,
            preferred: Mutex::new(HashMap::new()),
        }
    }

    /// Selects a primary and fallback provider for a workload class.
    ///
    /// Candidates with an open (and not yet probe-eligible) breaker are
    /// excluded outright. A rolling success rate below the health floor
    /// demotes a candidate: it is only considered when no healthy candidate
    /// survives, so a run of early failures cannot blacklist a provider that
    /// is the last one standing. Returns `ProviderUnavailable` when nothing
    /// is callable at all.
    pub fn select(&self, workload_class: &str, candidates: &[String]) -> Result<Route> {
        let mut scored: Vec<(String, f64)> = Vec::with_capacity(candidates.len());
        let mut below_floor: Vec<(String, f64)> = Vec::new();
        for candidate in candidates {
            let breaker = self.breakers.get(candidate);
            if !breaker.is_callable() {
                debug!(provider = %candidate, workload = %workload_class, "Skipping candidate, breaker not callable");
                continue;
            }
            let entry = (candidate.clone(), self.ledger.score(candidate, workload_class));
            match breaker.window_success_rate() {
                Some(rate) if rate < self.config.degraded_health_floor => {
                    debug!(
                        provider = %candidate,
                        workload = %workload_class,
                        success_rate = %format!("{:.2}", rate),
                        floor = %self.config.degraded_health_floor,
                        "Demoting candidate, rolling health below floor"
                    );
                    below_floor.push(entry);
                }
                _ => scored.push(entry),
            }
        }

        if scored.is_empty() && !below_floor.is_empty() {
            warn!(
                workload = %workload_class,
                "Every callable provider is below the health floor, routing among them"
            );
            counter!("orchestrator_router_all_below_floor_total", 1);
            scored = below_floor;
        }

        if scored.is_empty() {
            warn!(workload = %workload_class, "No callable provider for workload");
            counter!("orchestrator_router_no_provider_total", 1);
            return Err(OrchestratorError::ProviderUnavailable {
                workload_class: workload_class.to_string(),
            });
        }

        // Stable sort keeps candidate order on score ties.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let primary = self.pick_primary(workload_class, &scored);
        let fallback = scored
            .iter()
            .map(|(name, _)| name)
            .find(|name| **name != primary)
            .cloned();

        if fallback.is_none() && candidates.len() > 1 {
            warn!(
                workload = %workload_class,
                provider = %primary,
                "Single callable provider left, redundancy degraded"
            );
            counter!("orchestrator_router_degraded_redundancy_total", 1);
        }

        self.preferred
            .lock()
            .unwrap()
            .insert(workload_class.to_string(), primary.clone());

        Ok(Route { primary, fallback })
    }

    /// Sticky-preference primary selection: keep the remembered provider
    /// unless it dropped out of the candidate set or the best alternate
    /// outscores it by the configured margin.
    fn pick_primary(&self, workload_class: &str, scored: &[(String, f64)]) -> String {
        let best = &scored[0];
        let preferred = self.preferred.lock().unwrap().get(workload_class).cloned();
        let Some(preferred) = preferred else {
            return best.0.clone();
        };
        let Some((_, preferred_score)) = scored.iter().find(|(name, _)| *name == preferred) else {
            return best.0.clone();
        };
        if best.0 != preferred && outscores_by_margin(best.1, *preferred_score, self.config.unhealthy_score_margin) {
            debug!(
                workload = %workload_class,
                from = %preferred,
                to = %best.0,
                "Switching preferred provider on score margin"
            );
            counter!("orchestrator_router_preference_switch_total", 1);
            return best.0.clone();
        }
        preferred
    }

    /// Records a completed call: updates the ledger profile and forwards the
    /// outcome to the provider's breaker.
    pub fn record(&self, provider: &str, workload_class: &str, success: bool, latency: Duration, cost: f64) {
        self.ledger.record(provider, workload_class, success, latency, cost);
        self.breakers.get(provider).record(success);
        histogram!(
            "orchestrator_call_latency_ms",
            latency.as_secs_f64() * 1000.0,
            "provider" => provider.to_string()
        );
        if !success {
            counter!("orchestrator_call_failure_total", 1, "provider" => provider.to_string());
        }
    }

    /// Drops the sticky preference for one workload class, forcing a fresh
    /// ranking at the next selection.
    pub fn clear_preference(&self, workload_class: &str) {
        self.preferred.lock().unwrap().remove(workload_class);
    }

    /// Drops every sticky preference. Used by the ClearCache recovery action.
    pub fn clear_all_preferences(&self) {
        self.preferred.lock().unwrap().clear();
    }
}

/// True when `challenger` beats `incumbent` by at least `margin` (relative).
/// A non-positive incumbent score is beaten by any strictly higher score.
fn outscores_by_margin(challenger: f64, incumbent: f64, margin: f64) -> bool {
    if incumbent <= 0.0 {
        return challenger > incumbent;
    }
    challenger >= incumbent * (1.0 + margin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerConfig;

    fn router_with(providers: &[&str]) -> AdaptiveRouter {
        let providers: Vec<String> = providers.iter().map(|s| s.to_string()).collect();
        let breakers = Arc::new(BreakerRegistry::new(
            &providers,
            BreakerConfig {
                failure_threshold: 0.5,
                min_sample: 10,
                open_timeout: Duration::from_secs(30),
                half_open_trials: 3,
            },
        ));
        AdaptiveRouter::new(
            RouterConfig {
                unhealthy_score_margin: 0.3,
                degraded_health_floor: 0.3,
            },
            Arc::new(PerformanceLedger::new()),
            breakers,
        )
    }

    /// Seeds a profile so its score lands at 100 - p95_ms/10.
    fn seed_score(router: &AdaptiveRouter, provider: &str, workload: &str, p95_ms: u64) {
        for _ in 0..10 {
            router
                .ledger
                .record(provider, workload, true, Duration::from_millis(p95_ms), 0.0);
        }
    }

    #[test]
    fn test_select_orders_by_score() {
        let router = router_with(&["fast", "slow"]);
        seed_score(&router, "fast", "chat", 200); // score 80
        seed_score(&router, "slow", "chat", 500); // score 50
        let candidates = vec!["slow".to_string(), "fast".to_string()];

        let route = router.select("chat", &candidates).unwrap();
        assert_eq!(route.primary, "fast");
        assert_eq!(route.fallback, Some("slow".to_string()));
    }

    #[test]
    fn test_open_breaker_excluded() {
        let router = router_with(&["fast", "slow"]);
        seed_score(&router, "fast", "chat", 200);
        seed_score(&router, "slow", "chat", 500);
        for _ in 0..10 {
            router.breakers.get("fast").record(false);
        }
        let candidates = vec!["fast".to_string(), "slow".to_string()];

        let route = router.select("chat", &candidates).unwrap();
        assert_eq!(route.primary, "slow");
        assert_eq!(route.fallback, None);
    }

    #[test]
    fn test_all_breakers_open_is_unavailable() {
        let router = router_with(&["a", "b"]);
        for provider in ["a", "b"] {
            for _ in 0..10 {
                router.breakers.get(provider).record(false);
            }
        }
        let candidates = vec!["a".to_string(), "b".to_string()];
        assert!(matches!(
            router.select("chat", &candidates),
            Err(OrchestratorError::ProviderUnavailable { .. })
        ));
    }

    #[test]
    fn test_health_floor_excludes_before_breaker_opens() {
        let router = router_with(&["shaky", "steady"]);
        // 7 failures in a 9-observation window: under min_sample so the
        // breaker stays closed, but the rolling rate (0.22) sits below the
        // 0.3 floor.
        for i in 0..9 {
            router.breakers.get("shaky").record(i < 2);
        }
        assert_eq!(
            router.breakers.get("shaky").state(),
            crate::circuit_breaker::CircuitState::Closed
        );
        let candidates = vec!["shaky".to_string(), "steady".to_string()];

        let route = router.select("chat", &candidates).unwrap();
        assert_eq!(route.primary, "steady");
    }

    #[test]
    fn test_below_floor_provider_still_routed_as_last_resort() {
        let router = router_with(&["shaky"]);
        for _ in 0..5 {
            router.breakers.get("shaky").record(false);
        }
        // Demoted by the floor, but the only callable candidate.
        let route = router.select("chat", &["shaky".to_string()]).unwrap();
        assert_eq!(route.primary, "shaky");
    }

    #[test]
    fn test_sticky_preference_holds_under_margin() {
        let router = router_with(&["a", "b"]);
        seed_score(&router, "a", "chat", 300); // score 70
        router.select("chat", &["a".to_string(), "b".to_string()]).unwrap();

        // b now scores 80: higher, but under the 30% margin over 70.
        seed_score(&router, "b", "chat", 200);
        let route = router.select("chat", &["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(route.primary, "a");
    }

    #[test]
    fn test_preference_switches_over_margin() {
        let router = router_with(&["a", "b"]);
        seed_score(&router, "a", "chat", 400); // score 60
        router.select("chat", &["a".to_string(), "b".to_string()]).unwrap();

        // b scores 90: at least 30% above 60, so preference moves.
        seed_score(&router, "b", "chat", 100);
        let route = router.select("chat", &["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(route.primary, "b");
        assert_eq!(route.fallback, Some("a".to_string()));
    }

    #[test]
    fn test_single_candidate_has_no_fallback() {
        let router = router_with(&["only"]);
        let route = router.select("chat", &["only".to_string()]).unwrap();
        assert_eq!(route.primary, "only");
        assert_eq!(route.fallback, None);
    }
}
