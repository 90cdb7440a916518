//! Worker registry — the authoritative set of workers.
//!
//! Mutations that touch a single worker's invariant run under that worker's
//! own lock; cross-worker reads return a snapshot, never a live-mutating
//! view. The critical sections are read-decide-commit with no I/O inside.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::types::{HealthState, Worker, WorkerFilter, WorkerId};

#[derive(Default)]
struct RegistryInner {
    workers: HashMap<WorkerId, Arc<Mutex<Worker>>>,
    /// Registration order; drives round-robin iteration.
    order: Vec<WorkerId>,
}

/// The authoritative worker set.
///
/// Cloning is cheap and shares the underlying state.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new worker. Fails if the id is already taken.
    pub async fn register(&self, worker: Worker) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        if inner.workers.contains_key(&worker.id) {
            return Err(RegistryError::DuplicateWorker(worker.id));
        }
        let id = worker.id.clone();
        info!(worker_id = %id, base_limit = worker.base_limit, "worker registered");
        inner.order.push(id.clone());
        inner.workers.insert(id, Arc::new(Mutex::new(worker)));
        Ok(())
    }

    /// Remove a worker and return its final state.
    pub async fn deregister(&self, id: &str) -> RegistryResult<Worker> {
        let mut inner = self.inner.write().await;
        let handle = inner
            .workers
            .remove(id)
            .ok_or_else(|| RegistryError::WorkerNotFound(id.to_string()))?;
        inner.order.retain(|w| w != id);
        drop(inner);

        let worker = handle.lock().await.clone();
        info!(worker_id = %id, "worker deregistered");
        Ok(worker)
    }

    /// Snapshot of one worker's current state.
    pub async fn get(&self, id: &str) -> RegistryResult<Worker> {
        let handle = self.handle(id).await?;
        Ok(handle.lock().await.clone())
    }

    /// Snapshot of all workers matching the filter, in registration order.
    pub async fn list(&self, filter: &WorkerFilter) -> Vec<Worker> {
        let handles: Vec<Arc<Mutex<Worker>>> = {
            let inner = self.inner.read().await;
            inner
                .order
                .iter()
                .filter_map(|id| inner.workers.get(id).cloned())
                .collect()
        };

        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let worker = handle.lock().await.clone();
            if filter.matches(&worker) {
                out.push(worker);
            }
        }
        out
    }

    /// Current registration order.
    pub async fn registration_order(&self) -> Vec<WorkerId> {
        self.inner.read().await.order.clone()
    }

    /// Run a mutation under the worker's lock and return its result.
    pub async fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Worker) -> T,
    ) -> RegistryResult<T> {
        let handle = self.handle(id).await?;
        let mut worker = handle.lock().await;
        Ok(f(&mut worker))
    }

    /// Set a worker's effective concurrency limit.
    ///
    /// Fails with `InvalidLimit` above the base limit. Unless
    /// `allow_below_in_flight` is set (throttle/restart paths), lowering the
    /// limit below the current in-flight count fails with `CapacityExceeded`.
    pub async fn set_effective_limit(
        &self,
        id: &str,
        limit: u32,
        allow_below_in_flight: bool,
    ) -> RegistryResult<u32> {
        let handle = self.handle(id).await?;
        let mut worker = handle.lock().await;

        if limit > worker.base_limit {
            return Err(RegistryError::InvalidLimit {
                worker_id: id.to_string(),
                limit,
                base: worker.base_limit,
            });
        }
        if !allow_below_in_flight && limit < worker.in_flight {
            return Err(RegistryError::CapacityExceeded {
                worker_id: id.to_string(),
                in_flight: worker.in_flight,
                effective_limit: worker.effective_limit,
            });
        }

        debug!(
            worker_id = %id,
            from = worker.effective_limit,
            to = limit,
            "effective limit changed"
        );
        worker.effective_limit = limit;
        Ok(limit)
    }

    /// Atomically admit one unit of work: validate capability, health, and
    /// capacity under the worker's lock, then increment the in-flight count.
    ///
    /// Returns the post-admission snapshot. On any failure nothing changes.
    pub async fn try_admit(&self, id: &str, capability: &str) -> RegistryResult<Worker> {
        let handle = self.handle(id).await?;
        let mut worker = handle.lock().await;

        if !worker.capabilities.contains(capability) {
            return Err(RegistryError::CapabilityMismatch {
                worker_id: id.to_string(),
                capability: capability.to_string(),
            });
        }
        if !worker.accepts_work() {
            return Err(RegistryError::WorkerUnavailable {
                worker_id: id.to_string(),
                health: worker.health,
            });
        }
        if !worker.has_capacity() {
            return Err(RegistryError::CapacityExceeded {
                worker_id: id.to_string(),
                in_flight: worker.in_flight,
                effective_limit: worker.effective_limit,
            });
        }

        worker.in_flight += 1;
        Ok(worker.clone())
    }

    /// Release one in-flight slot after a terminal assignment outcome.
    ///
    /// The count saturates at zero: an outcome reported for work that
    /// predates a restart must not underflow the fresh worker.
    pub async fn release(&self, id: &str, completed: bool) -> RegistryResult<Worker> {
        let handle = self.handle(id).await?;
        let mut worker = handle.lock().await;

        worker.in_flight = worker.in_flight.saturating_sub(1);
        if completed {
            worker.completed_total += 1;
        }
        Ok(worker.clone())
    }

    /// Set a worker's health state, returning the previous state.
    pub async fn set_health(&self, id: &str, health: HealthState) -> RegistryResult<HealthState> {
        self.update(id, |worker| {
            let prev = worker.health;
            worker.health = health;
            prev
        })
        .await
    }

    /// Reset a worker after a completed restart: zero in-flight, base limit
    /// restored, metrics cleared, freshly healthy.
    pub async fn reset_after_restart(&self, id: &str) -> RegistryResult<Worker> {
        let snapshot = self
            .update(id, |worker| {
                worker.in_flight = 0;
                worker.effective_limit = worker.base_limit;
                worker.metrics.clear();
                worker.health = HealthState::Healthy;
                worker.restart_expired = false;
                worker.clone()
            })
            .await?;
        info!(worker_id = %id, base_limit = snapshot.base_limit, "worker reset after restart");
        Ok(snapshot)
    }

    async fn handle(&self, id: &str) -> RegistryResult<Arc<Mutex<Worker>>> {
        let inner = self.inner.read().await;
        inner
            .workers
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::WorkerNotFound(id.to_string()))
    }
}
