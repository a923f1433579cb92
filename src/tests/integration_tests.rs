//! Full-pipeline tests: routing, breaker-guarded calls, and recovery
//! working together through the public submit surface.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::circuit_breaker::CircuitState;
use crate::config::OrchestratorConfig;
use crate::queue::Orchestrator;
use crate::tests::support::{ScriptedInvoker, Step};
use crate::types::{
    FailureKind, OrchestratorError, Priority, ProviderFailure, RecoveryAction, WorkItem,
};

fn item(marker: &str) -> WorkItem {
    WorkItem::new("tester", "chat", Priority::Normal, json!({ "marker": marker }))
}

fn quick_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(50),
        ..Default::default()
    }
}

fn refused() -> Step {
    Step::Err(ProviderFailure::ConnectionRefused("no route".to_string()))
}

#[tokio::test]
async fn test_unavailable_provider_fails_over() {
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .script("bad", vec![refused()])
            .script("good", vec![Step::ok(Duration::ZERO)]),
    );
    let orchestrator = Orchestrator::new(
        quick_config(),
        vec!["bad".to_string(), "good".to_string()],
        invoker.clone(),
    )
    .unwrap();

    let completed = orchestrator.submit(item("job")).await.unwrap();

    assert_eq!(completed.provider, "good");
    assert_eq!(completed.attempts, 2);
    assert_eq!(invoker.called_providers(), vec!["bad", "good"]);
}

#[tokio::test]
async fn test_rate_limited_call_retries_then_succeeds() {
    let throttle = ProviderFailure::Http {
        status: 429,
        message: "too many requests".to_string(),
    };
    let invoker = Arc::new(ScriptedInvoker::new().script(
        "alpha",
        vec![
            Step::Err(throttle.clone()),
            Step::Err(throttle),
            Step::ok(Duration::ZERO),
        ],
    ));
    let orchestrator =
        Orchestrator::new(quick_config(), vec!["alpha".to_string()], invoker.clone()).unwrap();

    let completed = orchestrator.submit(item("job")).await.unwrap();

    // Both throttled attempts were absorbed and retried on the same provider.
    assert_eq!(completed.provider, "alpha");
    assert_eq!(completed.attempts, 3);
    assert_eq!(invoker.called_providers(), vec!["alpha", "alpha", "alpha"]);

    // The learned table saw one failed retry and one resolved retry on top
    // of the seeded prior (4 of 5).
    let entry = orchestrator
        .recovery_effectiveness()
        .into_iter()
        .find(|e| e.kind == FailureKind::RateLimited && e.action == RecoveryAction::RetryWithBackoff)
        .unwrap();
    assert_eq!(entry.attempts, 7);
    assert_eq!(entry.successes, 5);
}

#[tokio::test]
async fn test_recovery_exhaustion_is_terminal_for_item_only() {
    let invoker = Arc::new(ScriptedInvoker::new().script("alpha", vec![refused()]));
    let orchestrator =
        Orchestrator::new(quick_config(), vec!["alpha".to_string()], invoker.clone()).unwrap();

    let failed = orchestrator.submit(item("doomed")).await;
    assert!(matches!(
        failed,
        Err(OrchestratorError::CallFailed { kind: FailureKind::Unavailable, .. })
    ));

    // The queue keeps operating for subsequent items.
    assert_eq!(orchestrator.status().in_flight_global, 0);
    assert!(orchestrator.submit(item("next")).await.is_err());
    assert_eq!(orchestrator.status().queue_depth, 0);
}

#[tokio::test]
async fn test_breaker_opens_and_select_reports_unavailable() {
    let config = OrchestratorConfig {
        breaker_min_sample: 4,
        breaker_open_timeout: Duration::from_secs(60),
        ..quick_config()
    };
    let invoker = Arc::new(ScriptedInvoker::new().script("alpha", vec![refused()]));
    let orchestrator =
        Orchestrator::new(config, vec!["alpha".to_string()], invoker.clone()).unwrap();

    // Four failing calls fill the window and open the circuit.
    for _ in 0..4 {
        assert!(orchestrator.submit(item("fail")).await.is_err());
    }
    assert_eq!(
        orchestrator.status().breaker_states.get("alpha"),
        Some(&CircuitState::Open)
    );

    // With every breaker open, admission still works but selection cannot
    // produce a provider, and the invoker is not touched again.
    let calls_before = invoker.call_count();
    let unavailable = orchestrator.submit(item("blocked")).await;
    assert!(matches!(
        unavailable,
        Err(OrchestratorError::ProviderUnavailable { .. })
    ));
    assert_eq!(invoker.call_count(), calls_before);
}

#[tokio::test]
async fn test_quality_drop_fails_over_and_is_recorded() {
    let mut steps = vec![Step::ok_with_quality(Duration::ZERO, 0.9); 6];
    steps.push(Step::ok_with_quality(Duration::ZERO, 0.3));
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .script("primary", steps)
            .script("backup", vec![Step::ok(Duration::ZERO)]),
    );
    let orchestrator = Orchestrator::new(
        quick_config(),
        vec!["primary".to_string(), "backup".to_string()],
        invoker.clone(),
    )
    .unwrap();

    // Six healthy calls establish the rolling quality baseline.
    for i in 0..6 {
        let completed = orchestrator.submit(item(&format!("warm{i}"))).await.unwrap();
        assert_eq!(completed.provider, "primary");
    }

    // The collapsed-quality response is treated as a failure and the work
    // fails over, even though the provider "succeeded".
    let completed = orchestrator.submit(item("drop")).await.unwrap();
    assert_eq!(completed.provider, "backup");

    let events = orchestrator.recent_failures(FailureKind::DegradedQuality);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].provider, "primary");
}

#[tokio::test]
async fn test_failure_history_visible_per_tag() {
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .script("bad", vec![refused()])
            .script("good", vec![Step::ok(Duration::ZERO)]),
    );
    let orchestrator = Orchestrator::new(
        quick_config(),
        vec!["bad".to_string(), "good".to_string()],
        invoker.clone(),
    )
    .unwrap();

    orchestrator.submit(item("one")).await.unwrap();
    orchestrator.submit(item("two")).await.unwrap();

    let events = orchestrator.recent_failures(FailureKind::Unavailable);
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.provider == "bad"));
    assert!(orchestrator.recent_failures(FailureKind::Timeout).is_empty());
}

#[tokio::test]
async fn test_router_learns_to_avoid_failing_provider() {
    let invoker = Arc::new(
        ScriptedInvoker::new()
            .script("bad", vec![refused()])
            .script("good", vec![Step::ok(Duration::ZERO)]),
    );
    let orchestrator = Orchestrator::new(
        quick_config(),
        vec!["bad".to_string(), "good".to_string()],
        invoker.clone(),
    )
    .unwrap();

    // First item pays the discovery cost; later items route straight to the
    // healthy provider because the ledger and stickiness have learned.
    let first = orchestrator.submit(item("first")).await.unwrap();
    assert_eq!(first.attempts, 2);

    for i in 0..3 {
        let completed = orchestrator.submit(item(&format!("later{i}"))).await.unwrap();
        assert_eq!(completed.provider, "good");
        assert_eq!(completed.attempts, 1);
    }
    // "bad" was only ever called once.
    let bad_calls = invoker
        .called_providers()
        .into_iter()
        .filter(|p| p == "bad")
        .count();
    assert_eq!(bad_calls, 1);
}
