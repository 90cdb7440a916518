//! Manual override gateway.
//!
//! Operator-initiated actions that cut across the automatic loops. Every
//! override still re-validates against current state under the same locks
//! the automatic paths use; an operator can bypass selection, never an
//! invariant.

use tracing::info;

use dispatch_registry::{Assignment, WorkItemStatus, Worker};

use crate::engine::DispatchEngine;
use crate::error::{EngineError, EngineResult};

impl DispatchEngine {
    /// Pin a worker's effective limit to an explicit value.
    ///
    /// Validated like any other limit change: not above the base limit and
    /// not below the current in-flight count. Taking a loaded worker out of
    /// service goes through the restart path, not a manual pin.
    pub async fn manual_throttle(&self, worker_id: &str, limit: u32) -> EngineResult<Worker> {
        self.registry
            .set_effective_limit(worker_id, limit, false)
            .await?;
        let worker = self.registry.get(worker_id).await?;
        info!(%worker_id, limit, "manual throttle applied");
        Ok(worker)
    }

    /// Request an immediate restart of a worker.
    ///
    /// Takes the same path as an automatic escalation: limit to zero,
    /// restarting mode, deadline armed.
    pub async fn manual_restart(&self, worker_id: &str) -> EngineResult<()> {
        info!(%worker_id, "manual restart requested");
        Ok(self.throttle.request_restart(worker_id).await?)
    }

    /// Assign a specific pending item to a specific worker, bypassing the
    /// selection strategy.
    ///
    /// Capability, health, and capacity are still validated atomically; on
    /// failure neither the item nor the worker changes.
    pub async fn manual_assign(
        &self,
        item_id: &str,
        worker_id: &str,
    ) -> EngineResult<Assignment> {
        let mut ledger = self.ledger.lock().await;
        let queued = ledger
            .items
            .get(item_id)
            .ok_or_else(|| EngineError::NotFound(item_id.to_string()))?;
        if queued.item.status != WorkItemStatus::Pending {
            return Err(EngineError::AlreadyDispatched(item_id.to_string()));
        }

        let mut item = queued.item.clone();
        let assignment = self.matcher.assign_to(&mut item, worker_id).await?;

        if let Some(queued) = ledger.items.get_mut(item_id) {
            queued.item = item;
        }
        ledger
            .assignments
            .insert(assignment.id.clone(), assignment.clone());
        info!(%item_id, %worker_id, assignment_id = %assignment.id, "manual assignment");
        Ok(assignment)
    }
}
