//! Throttle controller — per-worker state machine over health classifications.
//!
//! States are `normal → throttled → restarting`. Each tick reads worker
//! snapshots from the registry, decides an adjustment, and applies it under
//! the worker's lock. The restart request itself is an async callback to the
//! external lifecycle collaborator; completion arrives via
//! [`ThrottleController::restart_completed`]. A restart that misses its
//! deadline marks the worker offline — reported, never retried, so a flapping
//! worker cannot cause a restart storm.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use dispatch_registry::{
    now_ms, HealthState, PolicyHandle, RegistryResult, Worker, WorkerFilter, WorkerId,
    WorkerRegistry,
};

/// Controller state for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleMode {
    Normal,
    Throttled,
    Restarting,
}

/// One tick's decision for one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    NoChange,
    StepDown { new_limit: u32 },
    StepUp { new_limit: u32 },
    Restart,
    MarkOffline,
}

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Callback asking the external lifecycle collaborator to restart a worker.
pub type RestartFn = Arc<dyn Fn(WorkerId) -> BoxFuture + Send + Sync>;

/// Effective limits never step below this while throttling; escalation to
/// restart takes over from here.
const FLOOR_LIMIT: u32 = 1;

#[derive(Debug, Default, Clone)]
struct WorkerThrottle {
    mode: Option<ThrottleMode>, // None until first tick; defaults to Normal.
    healthy_since_ms: Option<u64>,
    at_floor_since_ms: Option<u64>,
    restart_deadline_ms: Option<u64>,
}

impl WorkerThrottle {
    fn mode(&self) -> ThrottleMode {
        self.mode.unwrap_or(ThrottleMode::Normal)
    }
}

/// Evaluates worker health against the policy and adjusts effective limits.
///
/// Cloning shares the underlying per-worker state.
#[derive(Clone)]
pub struct ThrottleController {
    registry: WorkerRegistry,
    policy: PolicyHandle,
    states: Arc<Mutex<HashMap<WorkerId, WorkerThrottle>>>,
    restart_fn: Option<RestartFn>,
}

impl ThrottleController {
    pub fn new(registry: WorkerRegistry, policy: PolicyHandle) -> Self {
        Self {
            registry,
            policy,
            states: Arc::new(Mutex::new(HashMap::new())),
            restart_fn: None,
        }
    }

    /// Set the callback used to request worker restarts.
    pub fn with_restart_fn(mut self, f: RestartFn) -> Self {
        self.restart_fn = Some(f);
        self
    }

    /// Current controller mode for a worker.
    pub async fn mode(&self, worker_id: &str) -> ThrottleMode {
        self.states
            .lock()
            .await
            .get(worker_id)
            .map(WorkerThrottle::mode)
            .unwrap_or(ThrottleMode::Normal)
    }

    /// Evaluate every worker once and apply the decisions.
    pub async fn tick(&self) -> Vec<(WorkerId, ThrottleDecision)> {
        let now = now_ms();
        let workers = self.registry.list(&WorkerFilter::default()).await;

        let mut decisions = Vec::with_capacity(workers.len());
        {
            // Drop state for workers that were deregistered.
            let mut states = self.states.lock().await;
            states.retain(|id, _| workers.iter().any(|w| &w.id == id));
        }

        for worker in workers {
            let decision = self.evaluate(&worker, now).await;
            self.apply(&worker, decision, now).await;
            decisions.push((worker.id, decision));
        }
        decisions
    }

    /// Background loop: tick on every health-check interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("throttle controller started");
        loop {
            let interval = Duration::from_millis(self.policy.load().check_interval_ms());
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("throttle controller shutting down");
                    break;
                }
            }
        }
    }

    /// Request a restart out of band (manual override path).
    ///
    /// Same commitment as an escalation: limit to zero, restarting mode,
    /// deadline armed.
    pub async fn request_restart(&self, worker_id: &str) -> RegistryResult<()> {
        // Validate existence before touching controller state.
        let worker = self.registry.get(worker_id).await?;
        let now = now_ms();
        self.begin_restart(&worker, now).await?;
        Ok(())
    }

    /// The lifecycle collaborator reports a completed restart: the worker
    /// resumes freshly healthy at its base limit with cleared metrics.
    pub async fn restart_completed(&self, worker_id: &str) -> RegistryResult<Worker> {
        let worker = self.registry.reset_after_restart(worker_id).await?;
        let mut states = self.states.lock().await;
        states.insert(worker_id.to_string(), WorkerThrottle::default());
        info!(%worker_id, "restart completed, worker back to normal");
        Ok(worker)
    }

    // ── Decision logic ──────────────────────────────────────────────

    async fn evaluate(&self, worker: &Worker, now: u64) -> ThrottleDecision {
        let policy = self.policy.load();
        let mut states = self.states.lock().await;
        let st = states.entry(worker.id.clone()).or_default();

        match st.mode() {
            ThrottleMode::Restarting => {
                if let Some(deadline) = st.restart_deadline_ms
                    && now >= deadline
                {
                    st.restart_deadline_ms = None;
                    return ThrottleDecision::MarkOffline;
                }
                ThrottleDecision::NoChange
            }
            mode @ (ThrottleMode::Normal | ThrottleMode::Throttled) => match worker.health {
                HealthState::Offline => {
                    st.healthy_since_ms = None;
                    st.at_floor_since_ms = None;
                    ThrottleDecision::NoChange
                }
                HealthState::Overloaded => {
                    st.healthy_since_ms = None;

                    if mode == ThrottleMode::Throttled
                        && worker.metrics.error_rate > policy.thresholds.critical_error_rate
                    {
                        return ThrottleDecision::Restart;
                    }

                    if worker.effective_limit > FLOOR_LIMIT {
                        st.at_floor_since_ms = None;
                        let stepped = worker
                            .effective_limit
                            .saturating_sub(policy.throttle_step)
                            .max(FLOOR_LIMIT);
                        // Admit nothing above present load: drop straight to
                        // the in-flight count when that is lower than a step.
                        ThrottleDecision::StepDown {
                            new_limit: stepped.min(worker.in_flight),
                        }
                    } else {
                        match st.at_floor_since_ms {
                            None => {
                                st.at_floor_since_ms = Some(now);
                                ThrottleDecision::NoChange
                            }
                            Some(since)
                                if now.saturating_sub(since)
                                    >= policy.sustained_overload_ms() =>
                            {
                                ThrottleDecision::Restart
                            }
                            Some(_) => ThrottleDecision::NoChange,
                        }
                    }
                }
                HealthState::Healthy => {
                    st.at_floor_since_ms = None;
                    if mode == ThrottleMode::Normal {
                        return ThrottleDecision::NoChange;
                    }
                    if worker.effective_limit >= worker.base_limit {
                        // Fully restored (e.g. manually); leave throttled mode.
                        st.mode = Some(ThrottleMode::Normal);
                        st.healthy_since_ms = None;
                        return ThrottleDecision::NoChange;
                    }
                    let since = *st.healthy_since_ms.get_or_insert(now);
                    if now.saturating_sub(since) >= policy.stabilization_ms() {
                        ThrottleDecision::StepUp {
                            new_limit: worker
                                .effective_limit
                                .saturating_add(policy.throttle_step)
                                .min(worker.base_limit),
                        }
                    } else {
                        ThrottleDecision::NoChange
                    }
                }
                HealthState::Degraded => {
                    // Stabilization requires continuous *healthy* state.
                    st.healthy_since_ms = None;
                    st.at_floor_since_ms = None;
                    ThrottleDecision::NoChange
                }
            },
        }
    }

    async fn apply(&self, worker: &Worker, decision: ThrottleDecision, now: u64) {
        match decision {
            ThrottleDecision::NoChange => {}
            ThrottleDecision::StepDown { new_limit } => {
                if let Err(e) = self
                    .registry
                    .set_effective_limit(&worker.id, new_limit, true)
                    .await
                {
                    error!(worker_id = %worker.id, error = %e, "throttle step-down failed");
                    return;
                }
                let mut states = self.states.lock().await;
                let st = states.entry(worker.id.clone()).or_default();
                st.mode = Some(ThrottleMode::Throttled);
                st.healthy_since_ms = None;
                if new_limit <= FLOOR_LIMIT {
                    st.at_floor_since_ms.get_or_insert(now);
                }
                warn!(
                    worker_id = %worker.id,
                    from = worker.effective_limit,
                    to = new_limit,
                    "throttled down"
                );
            }
            ThrottleDecision::StepUp { new_limit } => {
                if let Err(e) = self
                    .registry
                    .set_effective_limit(&worker.id, new_limit, true)
                    .await
                {
                    error!(worker_id = %worker.id, error = %e, "throttle step-up failed");
                    return;
                }
                let mut states = self.states.lock().await;
                let st = states.entry(worker.id.clone()).or_default();
                if new_limit >= worker.base_limit {
                    st.mode = Some(ThrottleMode::Normal);
                    st.healthy_since_ms = None;
                } else {
                    st.mode = Some(ThrottleMode::Throttled);
                    // One step per stabilization window: restart the clock.
                    st.healthy_since_ms = Some(now);
                }
                info!(
                    worker_id = %worker.id,
                    from = worker.effective_limit,
                    to = new_limit,
                    "throttle restored one step"
                );
            }
            ThrottleDecision::Restart => {
                if let Err(e) = self.begin_restart(worker, now).await {
                    error!(worker_id = %worker.id, error = %e, "restart escalation failed");
                }
            }
            ThrottleDecision::MarkOffline => {
                let marked = self
                    .registry
                    .update(&worker.id, |w| {
                        w.health = HealthState::Offline;
                        w.restart_expired = true;
                    })
                    .await;
                if let Err(e) = marked {
                    error!(worker_id = %worker.id, error = %e, "failed to mark worker offline");
                    return;
                }
                warn!(
                    worker_id = %worker.id,
                    "restart did not complete within timeout, worker marked offline until re-registration"
                );
            }
        }
    }

    async fn begin_restart(&self, worker: &Worker, now: u64) -> RegistryResult<()> {
        self.registry
            .set_effective_limit(&worker.id, 0, true)
            .await?;
        {
            let mut states = self.states.lock().await;
            let st = states.entry(worker.id.clone()).or_default();
            st.mode = Some(ThrottleMode::Restarting);
            st.healthy_since_ms = None;
            st.at_floor_since_ms = None;
            st.restart_deadline_ms = Some(now + self.policy.load().restart_timeout_ms());
        }
        warn!(worker_id = %worker.id, "restart requested, admitting no new work");

        if let Some(ref restart_fn) = self.restart_fn {
            if let Err(e) = restart_fn(worker.id.clone()).await {
                error!(worker_id = %worker.id, error = %e, "restart request failed");
            }
        } else {
            debug!(worker_id = %worker.id, "no restart collaborator wired, deadline still armed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use dispatch_registry::ThrottlePolicy;

    fn policy(stabilization: &str, sustained: &str, restart_timeout: &str) -> PolicyHandle {
        PolicyHandle::new(ThrottlePolicy {
            stabilization: stabilization.to_string(),
            sustained_overload: sustained.to_string(),
            restart_timeout: restart_timeout.to_string(),
            ..ThrottlePolicy::default()
        })
    }

    async fn setup(policy: PolicyHandle) -> (WorkerRegistry, ThrottleController) {
        let registry = WorkerRegistry::new();
        registry
            .register(Worker::new("w1", ["dry_van"], 3))
            .await
            .unwrap();
        let controller = ThrottleController::new(registry.clone(), policy);
        (registry, controller)
    }

    #[tokio::test]
    async fn healthy_worker_is_left_alone() {
        let (registry, controller) = setup(policy("15s", "15s", "30s")).await;

        let decisions = controller.tick().await;
        assert_eq!(decisions[0].1, ThrottleDecision::NoChange);
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 3);
        assert_eq!(controller.mode("w1").await, ThrottleMode::Normal);
    }

    #[tokio::test]
    async fn overload_steps_down_one_step_per_tick() {
        let (registry, controller) = setup(policy("15s", "15s", "30s")).await;
        registry.try_admit("w1", "dry_van").await.unwrap();
        registry.try_admit("w1", "dry_van").await.unwrap();
        registry.try_admit("w1", "dry_van").await.unwrap();
        registry
            .set_health("w1", HealthState::Overloaded)
            .await
            .unwrap();

        controller.tick().await;
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 2);
        assert_eq!(controller.mode("w1").await, ThrottleMode::Throttled);

        controller.tick().await;
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 1);

        // At the floor: no further decrease.
        controller.tick().await;
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 1);
    }

    #[tokio::test]
    async fn step_down_clamps_to_in_flight_when_lower() {
        let (registry, controller) = setup(policy("15s", "15s", "30s")).await;
        // 0 in flight, overloaded: admit nothing above present load.
        registry
            .set_health("w1", HealthState::Overloaded)
            .await
            .unwrap();

        let decisions = controller.tick().await;
        assert_eq!(decisions[0].1, ThrottleDecision::StepDown { new_limit: 0 });
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 0);
    }

    #[tokio::test]
    async fn recovery_waits_for_stabilization_then_steps_up() {
        let (registry, controller) = setup(policy("40ms", "15s", "30s")).await;
        registry.try_admit("w1", "dry_van").await.unwrap();
        registry
            .set_health("w1", HealthState::Overloaded)
            .await
            .unwrap();
        // One in flight: the step-down clamps straight to the load.
        controller.tick().await;
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 1);

        registry.set_health("w1", HealthState::Healthy).await.unwrap();

        // First healthy tick arms the stabilization timer, no change yet.
        controller.tick().await;
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        controller.tick().await; // 1 -> 2, one step, not a jump to base.
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 2);
        assert_eq!(controller.mode("w1").await, ThrottleMode::Throttled);

        // The step restarts the stabilization clock; an immediate tick
        // changes nothing.
        controller.tick().await;
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        controller.tick().await; // 2 -> 3, fully restored.
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 3);
        assert_eq!(controller.mode("w1").await, ThrottleMode::Normal);
    }

    #[tokio::test]
    async fn degraded_resets_the_stabilization_timer() {
        let (registry, controller) = setup(policy("40ms", "15s", "30s")).await;
        registry.try_admit("w1", "dry_van").await.unwrap();
        registry
            .set_health("w1", HealthState::Overloaded)
            .await
            .unwrap();
        controller.tick().await;
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 1);

        registry.set_health("w1", HealthState::Healthy).await.unwrap();
        controller.tick().await; // arms timer
        tokio::time::sleep(Duration::from_millis(30)).await;

        registry.set_health("w1", HealthState::Degraded).await.unwrap();
        controller.tick().await; // resets timer

        registry.set_health("w1", HealthState::Healthy).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        controller.tick().await; // re-armed 30ms ago at most: still waiting
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 1);
    }

    #[tokio::test]
    async fn sustained_floor_escalates_to_restart() {
        let restarts = Arc::new(AtomicUsize::new(0));
        let counter = restarts.clone();
        let restart_fn: RestartFn = Arc::new(move |_id| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let (registry, controller) = setup(policy("15s", "0ms", "30s")).await;
        let controller = controller.with_restart_fn(restart_fn);
        registry.try_admit("w1", "dry_van").await.unwrap();
        registry
            .set_health("w1", HealthState::Overloaded)
            .await
            .unwrap();

        controller.tick().await; // 3 -> 2
        controller.tick().await; // 2 -> 1 (floor)
        controller.tick().await; // floor timer armed
        controller.tick().await; // sustained (0ms) elapsed -> restart

        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(controller.mode("w1").await, ThrottleMode::Restarting);
        assert_eq!(registry.get("w1").await.unwrap().effective_limit, 0);

        // No restart storm: further ticks do not re-request.
        controller.tick().await;
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn critical_error_rate_escalates_from_throttled() {
        let (registry, controller) = setup(policy("15s", "15s", "30s")).await;
        registry.try_admit("w1", "dry_van").await.unwrap();
        registry
            .update("w1", |worker| {
                worker.health = HealthState::Overloaded;
                worker.metrics.error_rate = 0.5; // over the 0.25 critical line
            })
            .await
            .unwrap();

        controller.tick().await; // normal -> throttled (step down)
        let decisions = controller.tick().await; // throttled + critical -> restart
        assert_eq!(decisions[0].1, ThrottleDecision::Restart);
        assert_eq!(controller.mode("w1").await, ThrottleMode::Restarting);
    }

    #[tokio::test]
    async fn restart_timeout_marks_worker_offline() {
        let (registry, controller) = setup(policy("15s", "0ms", "20ms")).await;
        controller.request_restart("w1").await.unwrap();
        assert_eq!(controller.mode("w1").await, ThrottleMode::Restarting);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let decisions = controller.tick().await;
        assert_eq!(decisions[0].1, ThrottleDecision::MarkOffline);
        let worker = registry.get("w1").await.unwrap();
        assert_eq!(worker.health, HealthState::Offline);
        // Samples cannot revive this worker; only the lifecycle path can.
        assert!(worker.restart_expired);

        // Reported once; later ticks leave the worker alone.
        let decisions = controller.tick().await;
        assert_eq!(decisions[0].1, ThrottleDecision::NoChange);
    }

    #[tokio::test]
    async fn restart_completed_restores_fresh_worker() {
        let (registry, controller) = setup(policy("15s", "15s", "30s")).await;
        registry.try_admit("w1", "dry_van").await.unwrap();
        controller.request_restart("w1").await.unwrap();

        let worker = controller.restart_completed("w1").await.unwrap();
        assert_eq!(worker.in_flight, 0);
        assert_eq!(worker.effective_limit, 3);
        assert_eq!(worker.health, HealthState::Healthy);
        assert_eq!(controller.mode("w1").await, ThrottleMode::Normal);
    }

    #[tokio::test]
    async fn request_restart_unknown_worker_fails() {
        let (_registry, controller) = setup(policy("15s", "15s", "30s")).await;
        assert!(controller.request_restart("ghost").await.is_err());
    }

    #[tokio::test]
    async fn deregistered_workers_drop_controller_state() {
        let (registry, controller) = setup(policy("15s", "15s", "30s")).await;
        controller.request_restart("w1").await.unwrap();
        registry.deregister("w1").await.unwrap();

        controller.tick().await;
        assert_eq!(controller.mode("w1").await, ThrottleMode::Normal);
    }
}
