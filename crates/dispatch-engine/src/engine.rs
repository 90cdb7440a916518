//! The dispatch engine facade.
//!
//! Owns the work queue and the assignment ledger, and wires the registry,
//! health monitor, throttle controller, and matcher together. The queue
//! lock is held across a dispatch batch so a batch observes a consistent
//! queue; per-worker capacity commits still go through the registry's
//! per-worker locks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info};

use dispatch_health::{HealthEvent, HealthMonitor};
use dispatch_matcher::DispatchMatcher;
use dispatch_registry::{
    Assignment, AssignmentOutcome, HealthSample, HealthState, PolicyHandle, Priority,
    ThrottlePolicy, WorkItem, WorkItemId, WorkItemStatus, Worker, WorkerFilter, WorkerRegistry,
};
use dispatch_throttle::{RestartFn, ThrottleController, ThrottleMode};

use crate::error::{EngineError, EngineResult};

/// A work item plus its admission sequence number, the final dispatch
/// tie-break for items that share a priority and arrival millisecond.
pub(crate) struct QueuedItem {
    pub(crate) seq: u64,
    pub(crate) item: WorkItem,
}

#[derive(Default)]
pub(crate) struct WorkLedger {
    pub(crate) items: HashMap<WorkItemId, QueuedItem>,
    pub(crate) assignments: HashMap<String, Assignment>,
    pub(crate) next_seq: u64,
}

/// Facade over the whole dispatch stack.
///
/// Cloning is cheap and shares all underlying state.
#[derive(Clone)]
pub struct DispatchEngine {
    pub(crate) registry: WorkerRegistry,
    pub(crate) policy: PolicyHandle,
    pub(crate) monitor: HealthMonitor,
    pub(crate) throttle: ThrottleController,
    pub(crate) matcher: DispatchMatcher,
    pub(crate) ledger: Arc<Mutex<WorkLedger>>,
}

impl DispatchEngine {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self::build(PolicyHandle::new(policy), None)
    }

    /// Build with a restart callback for the external lifecycle collaborator.
    pub fn with_restart_fn(policy: ThrottlePolicy, restart_fn: RestartFn) -> Self {
        Self::build(PolicyHandle::new(policy), Some(restart_fn))
    }

    fn build(policy: PolicyHandle, restart_fn: Option<RestartFn>) -> Self {
        let registry = WorkerRegistry::new();
        let monitor = HealthMonitor::new(registry.clone(), policy.clone());
        let mut throttle = ThrottleController::new(registry.clone(), policy.clone());
        if let Some(f) = restart_fn {
            throttle = throttle.with_restart_fn(f);
        }
        let matcher = DispatchMatcher::new(registry.clone(), policy.clone());
        Self {
            registry,
            policy,
            monitor,
            throttle,
            matcher,
            ledger: Arc::new(Mutex::new(WorkLedger::default())),
        }
    }

    /// The shared policy handle, for reloads.
    pub fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Register a worker. Its capability tags must all be in the policy's
    /// recognized catalog.
    pub async fn register_worker(&self, worker: Worker) -> EngineResult<()> {
        let policy = self.policy.load();
        for capability in &worker.capabilities {
            if !policy.recognizes(capability) {
                return Err(EngineError::InvalidCapability(capability.clone()));
            }
        }
        self.registry.register(worker).await?;
        Ok(())
    }

    /// Remove a worker, returning its final state. Assignments already in
    /// flight on it stay in the ledger; their outcomes are still accepted,
    /// the slot release is just a no-op.
    pub async fn deregister_worker(&self, worker_id: &str) -> EngineResult<Worker> {
        Ok(self.registry.deregister(worker_id).await?)
    }

    /// Snapshot of one worker.
    pub async fn worker_status(&self, worker_id: &str) -> EngineResult<Worker> {
        Ok(self.registry.get(worker_id).await?)
    }

    /// Snapshot of all workers matching the filter.
    pub async fn list_workers(&self, filter: &WorkerFilter) -> Vec<Worker> {
        self.registry.list(filter).await
    }

    /// Current throttle mode for a worker.
    pub async fn throttle_mode(&self, worker_id: &str) -> ThrottleMode {
        self.throttle.mode(worker_id).await
    }

    // ── Work items ─────────────────────────────────────────────────

    /// Submit a work item to the queue. The item enters pending regardless
    /// of the status it arrived with.
    pub async fn submit_work(
        &self,
        id: impl Into<WorkItemId>,
        required_capability: impl Into<String>,
        priority: Priority,
    ) -> EngineResult<()> {
        let item = WorkItem::new(id, required_capability, priority);
        if !self.policy.load().recognizes(&item.required_capability) {
            return Err(EngineError::InvalidCapability(item.required_capability));
        }

        let mut ledger = self.ledger.lock().await;
        if ledger.items.contains_key(&item.id) {
            return Err(EngineError::DuplicateId(item.id));
        }
        debug!(item_id = %item.id, capability = %item.required_capability, ?item.priority, "work submitted");
        let seq = ledger.next_seq;
        ledger.next_seq += 1;
        ledger.items.insert(item.id.clone(), QueuedItem { seq, item });
        Ok(())
    }

    /// Withdraw a pending item from the queue.
    ///
    /// Only pending items can be withdrawn; once dispatched the item is
    /// settled through its assignment's outcome.
    pub async fn withdraw_item(&self, item_id: &str) -> EngineResult<WorkItem> {
        let mut ledger = self.ledger.lock().await;
        match ledger.items.remove(item_id) {
            None => Err(EngineError::NotFound(item_id.to_string())),
            Some(queued) if queued.item.status != WorkItemStatus::Pending => {
                ledger.items.insert(queued.item.id.clone(), queued);
                Err(EngineError::AlreadyDispatched(item_id.to_string()))
            }
            Some(queued) => {
                info!(%item_id, "work item withdrawn");
                Ok(queued.item)
            }
        }
    }

    /// Current snapshot of a work item.
    pub async fn work_item(&self, item_id: &str) -> Option<WorkItem> {
        self.ledger
            .lock()
            .await
            .items
            .get(item_id)
            .map(|queued| queued.item.clone())
    }

    /// Number of items waiting for placement.
    pub async fn pending_count(&self) -> usize {
        self.ledger
            .lock()
            .await
            .items
            .values()
            .filter(|queued| queued.item.status == WorkItemStatus::Pending)
            .count()
    }

    // ── Dispatch ───────────────────────────────────────────────────

    /// Dispatch up to `max_items` pending items, highest priority and
    /// earliest arrival first. Items with no eligible worker stay pending.
    pub async fn dispatch_batch(&self, max_items: usize) -> Vec<Assignment> {
        let mut ledger = self.ledger.lock().await;

        let mut pending: Vec<(u64, WorkItem)> = ledger
            .items
            .values()
            .filter(|queued| queued.item.status == WorkItemStatus::Pending)
            .map(|queued| (queued.seq, queued.item.clone()))
            .collect();
        // Same-millisecond submissions fall back to submission order.
        pending.sort_by(|(a_seq, a), (b_seq, b)| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at_ms.cmp(&b.submitted_at_ms))
                .then(a_seq.cmp(b_seq))
        });
        pending.truncate(max_items);
        let mut batch: Vec<WorkItem> = pending.into_iter().map(|(_, item)| item).collect();

        let assignments = self.matcher.dispatch_batch(&mut batch).await;

        for item in batch {
            if let Some(queued) = ledger.items.get_mut(&item.id) {
                queued.item = item;
            }
        }
        for assignment in &assignments {
            ledger
                .assignments
                .insert(assignment.id.clone(), assignment.clone());
        }
        assignments
    }

    /// Record an assignment's outcome.
    ///
    /// Terminal outcomes release the worker slot exactly once; a second
    /// terminal report is rejected. A `Rejected` outcome puts the item back
    /// in the pending queue; `Completed` and `Failed` settle it.
    pub async fn report_outcome(
        &self,
        assignment_id: &str,
        outcome: AssignmentOutcome,
    ) -> EngineResult<Assignment> {
        let (assignment, release) = {
            let mut ledger = self.ledger.lock().await;
            let assignment = ledger
                .assignments
                .get_mut(assignment_id)
                .ok_or_else(|| EngineError::NotFound(assignment_id.to_string()))?;
            if assignment.outcome.is_terminal() {
                return Err(EngineError::AlreadyTerminal(assignment_id.to_string()));
            }
            assignment.outcome = outcome;
            let assignment = assignment.clone();

            let release = if outcome.is_terminal() {
                let item_status = match outcome {
                    AssignmentOutcome::Completed => WorkItemStatus::Completed,
                    AssignmentOutcome::Failed => WorkItemStatus::Failed,
                    // Rejected work goes back in the queue.
                    _ => WorkItemStatus::Pending,
                };
                if let Some(queued) = ledger.items.get_mut(&assignment.item_id) {
                    queued.item.status = item_status;
                }
                true
            } else {
                false
            };
            (assignment, release)
        };

        if release {
            let completed = outcome == AssignmentOutcome::Completed;
            match self.registry.release(&assignment.worker_id, completed).await {
                Ok(_) => {}
                // The worker may have been deregistered or restarted since
                // the assignment; its slot accounting no longer applies.
                Err(e) => debug!(worker_id = %assignment.worker_id, error = %e, "slot release skipped"),
            }
            info!(
                %assignment_id,
                worker_id = %assignment.worker_id,
                ?outcome,
                "assignment settled"
            );
        }
        Ok(assignment)
    }

    /// Current snapshot of an assignment.
    pub async fn assignment(&self, assignment_id: &str) -> Option<Assignment> {
        self.ledger
            .lock()
            .await
            .assignments
            .get(assignment_id)
            .cloned()
    }

    // ── Health & lifecycle ─────────────────────────────────────────

    /// Ingest a health sample for a worker.
    pub async fn ingest_health_sample(
        &self,
        worker_id: &str,
        sample: HealthSample,
    ) -> EngineResult<HealthState> {
        Ok(self.monitor.ingest(worker_id, sample).await?)
    }

    /// Subscribe to health state transitions.
    pub fn health_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.monitor.subscribe()
    }

    /// The lifecycle collaborator reports a finished restart.
    pub async fn restart_completed(&self, worker_id: &str) -> EngineResult<Worker> {
        Ok(self.throttle.restart_completed(worker_id).await?)
    }

    /// One health sweep plus one throttle pass.
    ///
    /// The background runner does this on the check interval; drivers can
    /// call it directly for deterministic stepping.
    pub async fn poll(&self) {
        self.monitor.sweep().await;
        self.throttle.tick().await;
    }

    /// Spawn the health and throttle background loops.
    ///
    /// Returns the shutdown handle; sending `true` stops both loops.
    pub fn spawn_background(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);

        let monitor = self.monitor.clone();
        let monitor_rx = rx.clone();
        tokio::spawn(async move { monitor.run(monitor_rx).await });

        let throttle = self.throttle.clone();
        tokio::spawn(async move { throttle.run(rx).await });

        info!("dispatch engine background loops started");
        tx
    }
}
