//! Dispatch matcher — batch placement of pending work items.
//!
//! Selection happens over a snapshot; the commit re-validates under the
//! worker's lock via `try_admit`, so a concurrent throttle change or a
//! competing dispatcher can never over-admit. Losing the race just moves on
//! to the next candidate; an unplaceable item stays pending for the next
//! batch, which is not an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use dispatch_registry::{
    now_ms, Assignment, AssignmentOutcome, PolicyHandle, RegistryResult, Strategy, WorkItem,
    WorkItemStatus, Worker, WorkerFilter, WorkerId, WorkerRegistry,
};

use crate::strategy;

/// Binds pending work items to eligible workers.
///
/// Cloning shares the round-robin cursor and the assignment id sequence.
#[derive(Clone)]
pub struct DispatchMatcher {
    registry: WorkerRegistry,
    policy: PolicyHandle,
    /// Worker that received the most recent automatic assignment.
    last_assigned: Arc<Mutex<Option<WorkerId>>>,
    seq: Arc<AtomicU64>,
}

impl DispatchMatcher {
    pub fn new(registry: WorkerRegistry, policy: PolicyHandle) -> Self {
        Self {
            registry,
            policy,
            last_assigned: Arc::new(Mutex::new(None)),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Dispatch a batch of items.
    ///
    /// Items are processed priority-descending, arrival-ascending (stable).
    /// Each assigned item flips to `Assigned` in place; items with no
    /// eligible worker are left `Pending`. The returned assignments preserve
    /// the processing order.
    pub async fn dispatch_batch(&self, items: &mut [WorkItem]) -> Vec<Assignment> {
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at_ms.cmp(&b.submitted_at_ms))
        });

        let strategy = self.policy.load().strategy;
        let order = self.registry.registration_order().await;
        let mut assignments = Vec::new();

        for item in items.iter_mut() {
            if item.status != WorkItemStatus::Pending {
                continue;
            }

            let mut candidates = self.eligible(&item.required_capability).await;
            while !candidates.is_empty() {
                let Some(choice) = self.select(strategy, &candidates, &order).await else {
                    break;
                };
                let worker_id = choice.id.clone();

                match self
                    .registry
                    .try_admit(&worker_id, &item.required_capability)
                    .await
                {
                    Ok(_) => {
                        let assignment = self.commit(item, &worker_id);
                        *self.last_assigned.lock().await = Some(worker_id);
                        assignments.push(assignment);
                        break;
                    }
                    Err(e) => {
                        // Snapshot went stale; drop this candidate and retry.
                        debug!(item_id = %item.id, %worker_id, error = %e, "admission lost the race");
                        candidates.retain(|w| w.id != worker_id);
                    }
                }
            }
        }

        if !assignments.is_empty() {
            info!(assigned = assignments.len(), "dispatch batch committed");
        }
        assignments
    }

    /// Assign one item to one specific worker, bypassing selection.
    ///
    /// Capability, health, and capacity are still validated atomically; on
    /// failure neither the item nor the worker changes.
    pub async fn assign_to(
        &self,
        item: &mut WorkItem,
        worker_id: &str,
    ) -> RegistryResult<Assignment> {
        self.registry
            .try_admit(worker_id, &item.required_capability)
            .await?;
        Ok(self.commit(item, worker_id))
    }

    async fn eligible(&self, capability: &str) -> Vec<Worker> {
        let filter = WorkerFilter {
            health: None,
            capability: Some(capability.to_string()),
        };
        let mut workers = self.registry.list(&filter).await;
        workers.retain(|w| w.accepts_work() && w.has_capacity());
        workers
    }

    async fn select<'a>(
        &self,
        strategy: Strategy,
        candidates: &'a [Worker],
        order: &[WorkerId],
    ) -> Option<&'a Worker> {
        match strategy {
            Strategy::LeastLoaded => strategy::least_loaded(candidates),
            Strategy::FastestResponse => strategy::fastest_response(candidates),
            Strategy::WeightedByRank => strategy::weighted_by_rank(candidates),
            Strategy::RoundRobin => {
                let last = self.last_assigned.lock().await;
                strategy::next_round_robin(candidates, order, last.as_ref())
            }
        }
    }

    fn commit(&self, item: &mut WorkItem, worker_id: &str) -> Assignment {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        item.status = WorkItemStatus::Assigned;
        let assignment = Assignment {
            id: format!("asg-{n}"),
            item_id: item.id.clone(),
            worker_id: worker_id.to_string(),
            assigned_at_ms: now_ms(),
            outcome: AssignmentOutcome::Pending,
        };
        debug!(
            assignment_id = %assignment.id,
            item_id = %item.id,
            %worker_id,
            "item assigned"
        );
        assignment
    }
}
