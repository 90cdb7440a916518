//! Health monitor — folds samples and tracks worker health state.
//!
//! Samples arrive per worker via [`HealthMonitor::ingest`]; a background
//! [`HealthMonitor::run`] loop sweeps for workers that stopped reporting.
//! State transitions are published on a broadcast channel consumed by the
//! throttle controller and external observability.

use dispatch_registry::{
    now_ms, HealthSample, HealthState, PolicyHandle, RegistryResult, Worker, WorkerFilter,
    WorkerId, WorkerRegistry,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// A health state transition for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub worker_id: WorkerId,
    pub from: HealthState,
    pub to: HealthState,
    pub at_ms: u64,
}

/// Folds health samples into the registry and classifies worker health.
#[derive(Clone)]
pub struct HealthMonitor {
    registry: WorkerRegistry,
    policy: PolicyHandle,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(registry: WorkerRegistry, policy: PolicyHandle) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            registry,
            policy,
            events,
        }
    }

    /// Subscribe to health state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Ingest one sample: fold into the rolling aggregate and reclassify,
    /// atomically under the worker's lock.
    ///
    /// A worker swept offline for missing samples reclassifies as soon as
    /// samples resume. A worker whose restart missed its deadline stays
    /// offline until re-registration or a late restart completion.
    pub async fn ingest(
        &self,
        worker_id: &str,
        sample: HealthSample,
    ) -> RegistryResult<HealthState> {
        let policy = self.policy.load();
        let now = now_ms();
        let interval_ms = policy.check_interval_ms();

        let (from, to) = self
            .registry
            .update(worker_id, |worker| {
                worker.metrics.fold(&sample, policy.ewma_alpha);
                let from = worker.health;
                if worker.restart_expired {
                    debug!(%worker_id, "sample for expired-restart worker ignored for classification");
                    return (from, from);
                }
                let to = crate::classifier::classify(
                    &worker.metrics,
                    &policy.thresholds,
                    last_seen_ms(worker),
                    now,
                    interval_ms,
                );
                worker.health = to;
                (from, to)
            })
            .await?;

        if from != to {
            info!(%worker_id, ?from, ?to, "health state changed");
            self.emit(worker_id, from, to, now);
        }
        Ok(to)
    }

    /// Mark workers that stopped reporting as offline.
    ///
    /// Returns the number of workers newly marked offline.
    pub async fn sweep(&self) -> usize {
        let policy = self.policy.load();
        let now = now_ms();
        let interval_ms = policy.check_interval_ms();

        let mut marked = 0;
        for snapshot in self.registry.list(&WorkerFilter::default()).await {
            if snapshot.health == HealthState::Offline {
                continue;
            }
            if now.saturating_sub(last_seen_ms(&snapshot)) <= 2 * interval_ms {
                continue;
            }

            // Re-check under the worker's lock; the snapshot may be stale.
            let Ok(from) = self
                .registry
                .update(&snapshot.id, |worker| {
                    let from = worker.health;
                    if now.saturating_sub(last_seen_ms(worker)) > 2 * interval_ms {
                        worker.health = HealthState::Offline;
                    }
                    from
                })
                .await
            else {
                continue; // Deregistered since the snapshot.
            };

            if from != HealthState::Offline {
                warn!(worker_id = %snapshot.id, ?from, "no samples within 2x interval, marking offline");
                self.emit(&snapshot.id, from, HealthState::Offline, now);
                marked += 1;
            }
        }
        marked
    }

    /// Background loop: sweep on every health-check interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("health monitor started");
        loop {
            let interval = std::time::Duration::from_millis(self.policy.load().check_interval_ms());
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }

    fn emit(&self, worker_id: &str, from: HealthState, to: HealthState, at_ms: u64) {
        // No receivers is fine; events are best-effort observability.
        let _ = self.events.send(HealthEvent {
            worker_id: worker_id.to_string(),
            from,
            to,
            at_ms,
        });
    }
}

/// Most recent sample timestamp, or registration time before any sample.
fn last_seen_ms(worker: &Worker) -> u64 {
    if worker.metrics.samples_seen == 0 {
        worker.registered_at_ms
    } else {
        worker.metrics.last_sample_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_registry::{RegistryError, ThrottlePolicy};

    fn setup() -> (WorkerRegistry, HealthMonitor) {
        let registry = WorkerRegistry::new();
        let monitor = HealthMonitor::new(registry.clone(), PolicyHandle::default());
        (registry, monitor)
    }

    fn sample(cpu: f64, err: f64) -> HealthSample {
        HealthSample {
            cpu_pct: cpu,
            memory_pct: 40.0,
            queue_depth: 0,
            response_ms: 100.0,
            error_rate: err,
            taken_at_ms: now_ms(),
        }
    }

    #[tokio::test]
    async fn ingest_unknown_worker_fails() {
        let (_registry, monitor) = setup();
        let result = monitor.ingest("ghost", sample(10.0, 0.0)).await;
        assert!(matches!(result, Err(RegistryError::WorkerNotFound(_))));
    }

    #[tokio::test]
    async fn breach_transitions_to_overloaded_and_emits() {
        let (registry, monitor) = setup();
        registry
            .register(Worker::new("w1", ["dry_van"], 3))
            .await
            .unwrap();
        let mut events = monitor.subscribe();

        let state = monitor.ingest("w1", sample(95.0, 0.0)).await.unwrap();
        assert_eq!(state, HealthState::Overloaded);

        let event = events.recv().await.unwrap();
        assert_eq!(event.worker_id, "w1");
        assert_eq!(event.from, HealthState::Healthy);
        assert_eq!(event.to, HealthState::Overloaded);
    }

    #[tokio::test]
    async fn recovery_needs_the_ewma_to_drain() {
        let (registry, monitor) = setup();
        registry
            .register(Worker::new("w1", ["dry_van"], 3))
            .await
            .unwrap();

        monitor.ingest("w1", sample(95.0, 0.0)).await.unwrap();
        // 0.3 * 10 + 0.7 * 95 = 69.5, back under the 80 threshold.
        let state = monitor.ingest("w1", sample(10.0, 0.0)).await.unwrap();
        assert_eq!(state, HealthState::Healthy);

        let worker = registry.get("w1").await.unwrap();
        assert!(worker.metrics.cpu_pct < 95.0);
    }

    #[tokio::test]
    async fn no_event_when_state_is_unchanged() {
        let (registry, monitor) = setup();
        registry
            .register(Worker::new("w1", ["dry_van"], 3))
            .await
            .unwrap();
        let mut events = monitor.subscribe();

        monitor.ingest("w1", sample(10.0, 0.0)).await.unwrap();
        monitor.ingest("w1", sample(12.0, 0.0)).await.unwrap();

        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn fresh_samples_revive_a_swept_offline_worker() {
        let (registry, monitor) = setup();
        registry
            .register(Worker::new("w1", ["dry_van"], 3))
            .await
            .unwrap();
        registry
            .update("w1", |worker| {
                worker.metrics.samples_seen = 1;
                worker.metrics.last_sample_at_ms = now_ms().saturating_sub(60_000);
            })
            .await
            .unwrap();
        assert_eq!(monitor.sweep().await, 1);
        assert_eq!(registry.get("w1").await.unwrap().health, HealthState::Offline);

        // The sampler hiccuped, not the worker: quiet readings resume and
        // the worker is back in rotation.
        let state = monitor.ingest("w1", sample(20.0, 0.0)).await.unwrap();
        assert_eq!(state, HealthState::Healthy);
        assert_eq!(registry.get("w1").await.unwrap().health, HealthState::Healthy);
    }

    #[tokio::test]
    async fn expired_restart_keeps_the_worker_offline() {
        let (registry, monitor) = setup();
        registry
            .register(Worker::new("w1", ["dry_van"], 3))
            .await
            .unwrap();
        registry
            .update("w1", |worker| {
                worker.health = HealthState::Offline;
                worker.restart_expired = true;
            })
            .await
            .unwrap();

        let state = monitor.ingest("w1", sample(10.0, 0.0)).await.unwrap();
        assert_eq!(state, HealthState::Offline);
        assert_eq!(registry.get("w1").await.unwrap().health, HealthState::Offline);
    }

    #[tokio::test]
    async fn sweep_marks_stale_workers_offline() {
        let (registry, monitor) = setup();
        registry
            .register(Worker::new("w1", ["dry_van"], 3))
            .await
            .unwrap();

        // Backdate the last sample far past 2x the 5s default interval.
        registry
            .update("w1", |worker| {
                worker.metrics.samples_seen = 1;
                worker.metrics.last_sample_at_ms = now_ms().saturating_sub(60_000);
            })
            .await
            .unwrap();

        let mut events = monitor.subscribe();
        assert_eq!(monitor.sweep().await, 1);
        assert_eq!(registry.get("w1").await.unwrap().health, HealthState::Offline);

        let event = events.recv().await.unwrap();
        assert_eq!(event.to, HealthState::Offline);

        // Idempotent: already-offline workers are skipped.
        assert_eq!(monitor.sweep().await, 0);
    }

    #[tokio::test]
    async fn sweep_spares_recently_registered_workers() {
        let (registry, monitor) = setup();
        registry
            .register(Worker::new("w1", ["dry_van"], 3))
            .await
            .unwrap();

        // Never sampled, but registered just now.
        assert_eq!(monitor.sweep().await, 0);
        assert_eq!(registry.get("w1").await.unwrap().health, HealthState::Healthy);
    }

    #[tokio::test]
    async fn run_loop_sweeps_and_shuts_down() {
        let registry = WorkerRegistry::new();
        let policy = PolicyHandle::new(ThrottlePolicy {
            check_interval: "10ms".to_string(),
            ..ThrottlePolicy::default()
        });
        let monitor = HealthMonitor::new(registry.clone(), policy);

        registry
            .register(Worker::new("w1", ["dry_van"], 3))
            .await
            .unwrap();
        registry
            .update("w1", |worker| {
                worker.metrics.samples_seen = 1;
                worker.metrics.last_sample_at_ms = now_ms().saturating_sub(60_000);
            })
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_monitor = monitor.clone();
        let handle = tokio::spawn(async move { loop_monitor.run(shutdown_rx).await });

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(registry.get("w1").await.unwrap().health, HealthState::Offline);
    }
}
