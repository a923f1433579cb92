//! Admission queue and orchestrator entry point
//!
//! Accepts work items, enforces queue-depth backpressure and global plus
//! per-submitter concurrency ceilings, and drains four priority sub-queues
//! with a bounded worker pool. Each admitted item runs the full pipeline:
//! router selection, breaker-guarded provider call, and recovery on failure,
//! with the outcome delivered back to the submitter over a oneshot channel.
//!
//! Each mutable resource lives in its own exclusion domain: the sub-queues
//! under one lock, the per-submitter map under another, the global in-flight
//! count as an atomic, one mutex per breaker. The dequeue decision is the
//! one place two of them nest: the sub-queues and the submitter map are held
//! together (queues first) so the per-submitter ceiling check and the charge
//! are one atomic step. No lock is held across an await.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerConfig, BreakerRegistry, CircuitState};
use crate::config::OrchestratorConfig;
use crate::ledger::{PerformanceLedger, ProfileSnapshot};
use crate::recovery::{CallSignal, EffectivenessEntry, RecoveryConfig, RecoveryEngine};
use crate::router::{AdaptiveRouter, RouterConfig};
use crate::types::{
    Completed, FailureEvent, FailureKind, OrchestratorError, ProviderInvoker, RecoveryAction,
    Result, WorkItem,
};

/// Read-only snapshot for monitoring collaborators. Taking one never blocks
/// admission beyond the brief per-resource locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Items queued across all priority classes
    pub queue_depth: usize,
    /// Calls currently executing
    pub in_flight_global: usize,
    /// Calls currently executing, by submitter identity
    pub in_flight_by_submitter: HashMap<String, usize>,
    /// Circuit state per provider
    pub breaker_states: HashMap<String, CircuitState>,
    /// Ledger profile per (provider, workload-class)
    pub provider_scores: Vec<ProfileSnapshot>,
    /// Whether the degraded-service flag is set
    pub degraded_mode: bool,
}

struct QueuedItem {
    item: WorkItem,
    enqueued_at: Instant,
    deadline: Instant,
    respond: oneshot::Sender<Result<Completed>>,
}

struct Shared {
    config: OrchestratorConfig,
    providers: Vec<String>,
    /// One FIFO per priority class, indexed by `Priority::index`
    queues: Mutex<[VecDeque<QueuedItem>; 4]>,
    /// Wakes workers on enqueue and on freed capacity
    wake: Notify,
    in_flight_global: AtomicUsize,
    in_flight_by_submitter: Mutex<HashMap<String, usize>>,
    ledger: Arc<PerformanceLedger>,
    breakers: Arc<BreakerRegistry>,
    router: AdaptiveRouter,
    recovery: RecoveryEngine,
    invoker: Arc<dyn ProviderInvoker>,
    shutting_down: AtomicBool,
}

impl Shared {
    fn queue_depth(&self) -> usize {
        self.queues.lock().unwrap().iter().map(VecDeque::len).sum()
    }

    /// Reserves one unit of global concurrency, or fails without blocking.
    fn try_reserve_slot(&self) -> bool {
        let mut current = self.in_flight_global.load(Ordering::SeqCst);
        loop {
            if current >= self.config.max_concurrent_global {
                return false;
            }
            match self.in_flight_global.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Frees a slot whose call finished and wakes a worker for the capacity.
    fn release_slot(&self) {
        self.in_flight_global.fetch_sub(1, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Returns an unused reservation without waking anyone. Notifying here
    /// would have idle workers hand each other wakeups in a loop: every
    /// failed dequeue would schedule another failed dequeue, forever.
    fn cancel_reservation(&self) {
        self.in_flight_global.fetch_sub(1, Ordering::SeqCst);
    }

    /// Pops the next dispatchable item in strict priority order, holding a
    /// reserved concurrency slot, and charges it to its submitter. Items
    /// whose submitter sits at its ceiling stay queued; completion of one of
    /// that submitter's calls frees the slot and wakes a worker to retry
    /// them. Returns `None` when nothing is dispatchable.
    fn try_dequeue(&self) -> Option<QueuedItem> {
        if !self.try_reserve_slot() {
            return None;
        }
        let mut queues = self.queues.lock().unwrap();
        let mut by_submitter = self.in_flight_by_submitter.lock().unwrap();
        for queue in queues.iter_mut() {
            let dispatchable = queue.iter().position(|queued| {
                by_submitter
                    .get(&queued.item.submitter)
                    .copied()
                    .unwrap_or(0)
                    < self.config.max_concurrent_per_submitter
            });
            if let Some(index) = dispatchable {
                if let Some(queued) = queue.remove(index) {
                    *by_submitter
                        .entry(queued.item.submitter.clone())
                        .or_insert(0) += 1;
                    return Some(queued);
                }
            }
        }
        drop(by_submitter);
        drop(queues);
        self.cancel_reservation();
        None
    }

    /// Undoes the submitter charge taken at dequeue.
    fn uncharge_submitter(&self, submitter: &str) {
        let mut by_submitter = self.in_flight_by_submitter.lock().unwrap();
        if let Some(count) = by_submitter.get_mut(submitter) {
            *count -= 1;
            if *count == 0 {
                by_submitter.remove(submitter);
            }
        }
    }
}

/// The resilient request-orchestration core.
///
/// Construct with a validated config, the fixed provider set, and the
/// caller's provider invoker; submit work with [`submit`](Self::submit) and
/// observe health with [`status`](Self::status). Construction spawns the
/// worker pool and therefore requires a running tokio runtime.
pub struct Orchestrator {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Builds the orchestrator and spawns its worker pool.
    ///
    /// Fails with `Configuration` for a malformed config or an empty
    /// provider set; this is the only error raised before work is accepted.
    pub fn new(
        config: OrchestratorConfig,
        providers: Vec<String>,
        invoker: Arc<dyn ProviderInvoker>,
    ) -> Result<Self> {
        config.validate()?;
        if providers.is_empty() {
            return Err(OrchestratorError::Configuration(
                "at least one provider is required".to_string(),
            ));
        }

        let ledger = Arc::new(PerformanceLedger::new());
        let breakers = Arc::new(BreakerRegistry::new(&providers, BreakerConfig::from(&config)));
        let router = AdaptiveRouter::new(
            RouterConfig::from(&config),
            Arc::clone(&ledger),
            Arc::clone(&breakers),
        );
        let recovery = RecoveryEngine::new(RecoveryConfig::from(&config));

        let shared = Arc::new(Shared {
            providers,
            queues: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            wake: Notify::new(),
            in_flight_global: AtomicUsize::new(0),
            in_flight_by_submitter: Mutex::new(HashMap::new()),
            ledger,
            breakers,
            router,
            recovery,
            invoker,
            shutting_down: AtomicBool::new(false),
            config,
        });

        let mut workers = Vec::with_capacity(shared.config.workers);
        for worker_id in 0..shared.config.workers {
            let shared = Arc::clone(&shared);
            workers.push(tokio::spawn(worker_loop(shared, worker_id)));
        }
        info!(
            workers = %shared.config.workers,
            providers = %shared.providers.len(),
            "Orchestrator started"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Submits a work item and waits for its outcome.
    ///
    /// Admission fails fast, without touching the provider invoker, on
    /// backpressure (`BackpressureRejected`) or a saturated submitter
    /// (`OverSubmitterLimit`). Accepted items are dequeued in strict
    /// priority order and FIFO within a class; items that outlive their
    /// expiration deadline before dispatch resolve to `Expired`.
    pub async fn submit(&self, item: WorkItem) -> Result<Completed> {
        let shared = &self.shared;
        if shared.shutting_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Internal(
                "orchestrator is shutting down".to_string(),
            ));
        }

        let reject_threshold = shared.config.reject_threshold();
        let outstanding =
            shared.queue_depth() + shared.in_flight_global.load(Ordering::SeqCst);
        if outstanding >= reject_threshold {
            counter!("orchestrator_backpressure_rejected_total", 1);
            warn!(
                outstanding = %outstanding,
                threshold = %reject_threshold,
                submitter = %item.submitter,
                "Admission rejected for backpressure"
            );
            return Err(OrchestratorError::BackpressureRejected {
                outstanding,
                threshold: reject_threshold,
            });
        }

        {
            let in_flight = shared.in_flight_by_submitter.lock().unwrap();
            let current = in_flight.get(&item.submitter).copied().unwrap_or(0);
            if current >= shared.config.max_concurrent_per_submitter {
                counter!("orchestrator_submitter_limited_total", 1);
                return Err(OrchestratorError::OverSubmitterLimit {
                    submitter: item.submitter.clone(),
                    in_flight: current,
                    limit: shared.config.max_concurrent_per_submitter,
                });
            }
        }

        if outstanding + 1 >= shared.config.warn_threshold() {
            warn!(
                outstanding = %(outstanding + 1),
                capacity = %shared.config.queue_capacity,
                "Queue depth past warning ratio"
            );
            counter!("orchestrator_backpressure_warning_total", 1);
        }

        let now = Instant::now();
        let ttl = item.ttl.unwrap_or(shared.config.expiration);
        let (respond, outcome) = oneshot::channel();
        let priority = item.priority;
        let depth = {
            let mut queues = shared.queues.lock().unwrap();
            // Re-checked under the queues lock: a shutdown landing between
            // the entry check and this push would otherwise leave the item
            // queued behind an exiting worker pool.
            if shared.shutting_down.load(Ordering::SeqCst) {
                return Err(OrchestratorError::Internal(
                    "orchestrator is shutting down".to_string(),
                ));
            }
            queues[priority.index()].push_back(QueuedItem {
                item,
                enqueued_at: now,
                deadline: now + ttl,
                respond,
            });
            queues.iter().map(VecDeque::len).sum::<usize>()
        };
        gauge!("orchestrator_queue_depth", depth as f64);
        debug!(depth = %depth, priority = %priority, "Work item admitted");
        shared.wake.notify_one();

        outcome
            .await
            .map_err(|_| OrchestratorError::Internal("outcome channel dropped".to_string()))?
    }

    /// Read-only health snapshot for dashboards and alerting.
    pub fn status(&self) -> StatusSnapshot {
        let shared = &self.shared;
        StatusSnapshot {
            queue_depth: shared.queue_depth(),
            in_flight_global: shared.in_flight_global.load(Ordering::SeqCst),
            in_flight_by_submitter: shared.in_flight_by_submitter.lock().unwrap().clone(),
            breaker_states: shared.breakers.states(),
            provider_scores: shared.ledger.snapshot(),
            degraded_mode: shared.recovery.is_degraded(),
        }
    }

    /// Whether the degraded-service flag is set. Upstream collaborators poll
    /// this to disable optional, expensive feature paths.
    pub fn degraded_mode(&self) -> bool {
        self.shared.recovery.is_degraded()
    }

    /// Recent failure events for one classification tag, oldest first.
    pub fn recent_failures(&self, kind: FailureKind) -> Vec<FailureEvent> {
        self.shared.recovery.recent_failures(kind)
    }

    /// Read-only copy of the learned recovery-effectiveness table.
    pub fn recovery_effectiveness(&self) -> Vec<EffectivenessEntry> {
        self.shared.recovery.effectiveness_snapshot()
    }

    /// Stops accepting work, drains the queues, and joins the worker pool.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        // A submission racing the flag store can slip an item in after the
        // workers decided to exit; answer it instead of stranding the
        // submitter on a oneshot nobody holds.
        let leftovers: Vec<QueuedItem> = {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.iter_mut().flat_map(|queue| queue.drain(..)).collect()
        };
        for queued in leftovers {
            let _ = queued.respond.send(Err(OrchestratorError::Internal(
                "orchestrator is shutting down".to_string(),
            )));
        }
        info!("Orchestrator stopped");
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    debug!(worker = %worker_id, "Worker started");
    loop {
        let wake = shared.wake.notified();
        tokio::pin!(wake);
        // Register interest before inspecting state, so a notification
        // landing between the dequeue attempt and the await is not lost.
        wake.as_mut().enable();
        if let Some(queued) = shared.try_dequeue() {
            process_item(&shared, queued).await;
            continue;
        }
        if shared.shutting_down.load(Ordering::SeqCst) && shared.queue_depth() == 0 {
            break;
        }
        wake.await;
    }
    debug!(worker = %worker_id, "Worker stopped");
}

/// Runs one dequeued item, holding the already-reserved concurrency slot.
async fn process_item(shared: &Arc<Shared>, queued: QueuedItem) {
    let QueuedItem {
        item,
        enqueued_at,
        deadline,
        respond,
    } = queued;

    // Stale work is discarded without executing it; serving it would only
    // add load while the submitter has already given up.
    if Instant::now() >= deadline {
        shared.uncharge_submitter(&item.submitter);
        shared.release_slot();
        let queued_ms = enqueued_at.elapsed().as_millis() as u64;
        counter!("orchestrator_expired_total", 1);
        debug!(work_id = %item.id, queued_ms = %queued_ms, "Discarding expired work item");
        let _ = respond.send(Err(OrchestratorError::Expired { queued_ms }));
        return;
    }

    gauge!(
        "orchestrator_in_flight",
        shared.in_flight_global.load(Ordering::SeqCst) as f64
    );

    let result = execute(shared, &item, enqueued_at, deadline).await;

    shared.uncharge_submitter(&item.submitter);
    shared.release_slot();

    let _ = respond.send(result);
}

/// The full call pipeline for one work item: route, guard with the breaker,
/// invoke under the remaining deadline, and recover on failure until the
/// item succeeds, expires, or exhausts every candidate.
async fn execute(
    shared: &Arc<Shared>,
    item: &WorkItem,
    enqueued_at: Instant,
    deadline: Instant,
) -> Result<Completed> {
    let route = shared.router.select(&item.workload_class, &shared.providers)?;
    let mut current = route.primary;
    let mut fallback = route.fallback;
    let mut tried: HashSet<String> = HashSet::new();
    // Backoff-class recovery attempts on the current provider; resets on switch.
    let mut recovery_attempts: u32 = 0;
    let mut total_attempts: u32 = 0;
    // Last recovery decision whose outcome is still unobserved.
    let mut pending_learn: Option<(FailureKind, RecoveryAction)> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            if let Some((kind, action)) = pending_learn.take() {
                shared.recovery.record_outcome(kind, action, false);
            }
            return Err(OrchestratorError::Expired {
                queued_ms: enqueued_at.elapsed().as_millis() as u64,
            });
        }

        let event = if !shared.breakers.get(&current).allow() {
            shared
                .recovery
                .classify(&current, &item.workload_class, CallSignal::BreakerRejected, Duration::ZERO)
        } else {
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                remaining,
                shared.invoker.invoke(&current, &item.payload, remaining),
            )
            .await;
            let latency = started.elapsed();
            total_attempts += 1;

            match outcome {
                Ok(Ok(response)) => {
                    // A successful payload with a collapsed quality signal
                    // still counts as a failure for routing and recovery.
                    let quality_drop = response
                        .quality
                        .and_then(|q| shared.recovery.check_quality(&item.workload_class, q).map(|b| (q, b)));
                    if let Some((quality, baseline)) = quality_drop {
                        shared
                            .router
                            .record(&current, &item.workload_class, false, latency, response.cost);
                        shared.recovery.classify(
                            &current,
                            &item.workload_class,
                            CallSignal::QualityDrop { quality, baseline },
                            latency,
                        )
                    } else {
                        shared
                            .router
                            .record(&current, &item.workload_class, true, latency, response.cost);
                        if let Some((kind, action)) = pending_learn.take() {
                            shared.recovery.record_outcome(kind, action, true);
                        }
                        shared.recovery.note_success();
                        // Slow successes return their payload but steer the
                        // router away from this provider next time.
                        if shared
                            .recovery
                            .classify_slow(&current, &item.workload_class, latency)
                            .is_some()
                        {
                            shared.router.clear_preference(&item.workload_class);
                        }
                        return Ok(Completed {
                            work_id: item.id,
                            provider: current,
                            payload: response.payload,
                            latency,
                            attempts: total_attempts,
                        });
                    }
                }
                Ok(Err(failure)) => {
                    shared
                        .router
                        .record(&current, &item.workload_class, false, latency, 0.0);
                    shared.recovery.classify(
                        &current,
                        &item.workload_class,
                        CallSignal::Failed(&failure),
                        latency,
                    )
                }
                Err(_) => {
                    shared
                        .router
                        .record(&current, &item.workload_class, false, latency, 0.0);
                    shared.recovery.classify(
                        &current,
                        &item.workload_class,
                        CallSignal::DeadlineElapsed,
                        latency,
                    )
                }
            }
        };

        // Failure path: the previous recovery decision, if any, did not
        // resolve things.
        if let Some((kind, action)) = pending_learn.take() {
            shared.recovery.record_outcome(kind, action, false);
        }

        let plan = shared.recovery.recover(&event, recovery_attempts);
        pending_learn = Some((event.kind, plan.action));

        match plan.action {
            RecoveryAction::RetryWithBackoff => {
                recovery_attempts += 1;
                if let Some(delay) = plan.delay {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(delay.min(remaining)).await;
                }
            }
            RecoveryAction::DegradeService => {
                shared.recovery.set_degraded();
                recovery_attempts += 1;
            }
            RecoveryAction::ClearCache => {
                shared.recovery.clear_soft_state();
                shared.router.clear_all_preferences();
                recovery_attempts += 1;
            }
            RecoveryAction::SwitchProvider => {
                tried.insert(current.clone());
                let next = next_provider(shared, item, &tried, &mut fallback);
                match next {
                    Some(next) => {
                        info!(
                            work_id = %item.id,
                            from = %current,
                            to = %next,
                            kind = %event.kind,
                            "Switching provider"
                        );
                        current = next;
                        recovery_attempts = 0;
                    }
                    None => {
                        shared
                            .recovery
                            .record_outcome(event.kind, RecoveryAction::SwitchProvider, false);
                        return Err(terminal_error(item, &current, event));
                    }
                }
            }
            RecoveryAction::None => {
                shared.recovery.record_outcome(event.kind, RecoveryAction::None, false);
                return Err(terminal_error(item, &current, event));
            }
        }
    }
}

/// Next provider after a switch: the routed fallback if it is still untried
/// and callable, otherwise a fresh selection over the untried remainder.
fn next_provider(
    shared: &Arc<Shared>,
    item: &WorkItem,
    tried: &HashSet<String>,
    fallback: &mut Option<String>,
) -> Option<String> {
    if let Some(candidate) = fallback.take() {
        if !tried.contains(&candidate) && shared.breakers.get(&candidate).is_callable() {
            return Some(candidate);
        }
    }
    let remaining: Vec<String> = shared
        .providers
        .iter()
        .filter(|provider| !tried.contains(*provider))
        .cloned()
        .collect();
    if remaining.is_empty() {
        return None;
    }
    match shared.router.select(&item.workload_class, &remaining) {
        Ok(route) => {
            *fallback = route.fallback;
            Some(route.primary)
        }
        Err(_) => None,
    }
}

fn terminal_error(item: &WorkItem, provider: &str, event: FailureEvent) -> OrchestratorError {
    if event.kind == FailureKind::BreakerOpen {
        OrchestratorError::ProviderUnavailable {
            workload_class: item.workload_class.clone(),
        }
    } else {
        OrchestratorError::CallFailed {
            provider: provider.to_string(),
            kind: event.kind,
            detail: event.detail,
        }
    }
}
