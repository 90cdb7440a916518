//! Domain types for the dispatch engine.
//!
//! These types model the work items, workers, assignments, and health
//! samples the engine moves around. All types are serializable so callers
//! can ship them over whatever transport they own.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a worker.
pub type WorkerId = String;

/// Unique identifier for a work item.
pub type WorkItemId = String;

/// Unique identifier for an assignment.
pub type AssignmentId = String;

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Work items ─────────────────────────────────────────────────────

/// Priority of a work item. Declaration order is ranking order:
/// `Urgent` outranks `High` outranks `Normal` outranks `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

/// A unit of work awaiting placement on a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub id: WorkItemId,
    /// Capability tag a worker must carry to take this item.
    pub required_capability: String,
    pub priority: Priority,
    /// Unix timestamp (ms) when the item was submitted.
    pub submitted_at_ms: u64,
    pub status: WorkItemStatus,
}

impl WorkItem {
    pub fn new(
        id: impl Into<WorkItemId>,
        required_capability: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            id: id.into(),
            required_capability: required_capability.into(),
            priority,
            submitted_at_ms: now_ms(),
            status: WorkItemStatus::Pending,
        }
    }
}

// ── Health ─────────────────────────────────────────────────────────

/// Classification of a worker's operational condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Overloaded,
    Offline,
}

/// One raw health observation for a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSample {
    /// CPU utilization, 0.0–100.0.
    pub cpu_pct: f64,
    /// Memory utilization, 0.0–100.0.
    pub memory_pct: f64,
    /// Depth of the worker's local queue.
    pub queue_depth: u32,
    /// Response time of the observation window, milliseconds.
    pub response_ms: f64,
    /// Error rate over the observation window, 0.0–1.0.
    pub error_rate: f64,
    /// Unix timestamp (ms) when the sample was taken.
    pub taken_at_ms: u64,
}

/// Rolling aggregate of a worker's health metrics.
///
/// Exponentially-weighted moving average with a fixed decay. The first
/// sample seeds the aggregate verbatim so a fresh worker's reading is not
/// diluted toward zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RollingMetrics {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub queue_depth: f64,
    pub avg_response_ms: f64,
    pub error_rate: f64,
    /// Unix timestamp (ms) of the most recent sample, 0 if none yet.
    pub last_sample_at_ms: u64,
    /// Number of samples folded so far.
    pub samples_seen: u64,
}

impl RollingMetrics {
    /// Fold one sample into the aggregate with decay `alpha`.
    pub fn fold(&mut self, sample: &HealthSample, alpha: f64) {
        if self.samples_seen == 0 {
            self.cpu_pct = sample.cpu_pct;
            self.memory_pct = sample.memory_pct;
            self.queue_depth = f64::from(sample.queue_depth);
            self.avg_response_ms = sample.response_ms;
            self.error_rate = sample.error_rate;
        } else {
            self.cpu_pct = alpha * sample.cpu_pct + (1.0 - alpha) * self.cpu_pct;
            self.memory_pct = alpha * sample.memory_pct + (1.0 - alpha) * self.memory_pct;
            self.queue_depth =
                alpha * f64::from(sample.queue_depth) + (1.0 - alpha) * self.queue_depth;
            self.avg_response_ms =
                alpha * sample.response_ms + (1.0 - alpha) * self.avg_response_ms;
            self.error_rate = alpha * sample.error_rate + (1.0 - alpha) * self.error_rate;
        }
        self.last_sample_at_ms = sample.taken_at_ms;
        self.samples_seen += 1;
    }

    /// Reset the aggregate, e.g. after a worker restart.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

// ── Workers ────────────────────────────────────────────────────────

/// A capacity-bounded executor of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub id: WorkerId,
    /// Capability tags this worker can serve.
    pub capabilities: BTreeSet<String>,
    /// Operator-configured maximum concurrency.
    pub base_limit: u32,
    /// Currently throttled maximum concurrency, <= `base_limit`.
    pub effective_limit: u32,
    /// Number of assignments currently in flight.
    pub in_flight: u32,
    pub metrics: RollingMetrics,
    pub health: HealthState,
    /// Set when a restart missed its deadline. The worker stays offline
    /// until re-registration or a late restart completion, regardless of
    /// what its samples say.
    pub restart_expired: bool,
    /// Total assignments this worker completed successfully.
    pub completed_total: u64,
    /// Unix timestamp (ms) of registration; registration order is the
    /// round-robin iteration order.
    pub registered_at_ms: u64,
}

impl Worker {
    pub fn new(
        id: impl Into<WorkerId>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        base_limit: u32,
    ) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            base_limit,
            effective_limit: base_limit,
            in_flight: 0,
            metrics: RollingMetrics::default(),
            health: HealthState::Healthy,
            restart_expired: false,
            completed_total: 0,
            registered_at_ms: now_ms(),
        }
    }

    /// Fraction of the effective limit currently in use.
    pub fn load_ratio(&self) -> f64 {
        if self.effective_limit == 0 {
            1.0
        } else {
            f64::from(self.in_flight) / f64::from(self.effective_limit)
        }
    }

    /// Ranking score: grows with past throughput, shrinks with error rate.
    pub fn rank_score(&self) -> f64 {
        let throughput = ((self.completed_total + 1) as f64).ln_1p();
        throughput * (1.0 - self.metrics.error_rate.clamp(0.0, 1.0))
    }

    /// Whether the dispatcher may consider this worker at all.
    pub fn accepts_work(&self) -> bool {
        matches!(self.health, HealthState::Healthy | HealthState::Degraded)
    }

    /// Whether this worker has a free slot under its effective limit.
    pub fn has_capacity(&self) -> bool {
        self.in_flight < self.effective_limit
    }
}

// ── Assignments ────────────────────────────────────────────────────

/// Outcome of an assignment once known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Pending,
    Accepted,
    Rejected,
    Completed,
    Failed,
}

impl AssignmentOutcome {
    /// Terminal outcomes release the worker slot; `Accepted` is a
    /// non-terminal progress marker.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Completed | Self::Failed)
    }
}

/// The binding of one work item to one worker at a point in time.
///
/// Immutable once created except for `outcome`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub id: AssignmentId,
    pub item_id: WorkItemId,
    pub worker_id: WorkerId,
    pub assigned_at_ms: u64,
    pub outcome: AssignmentOutcome,
}

// ── Queries ────────────────────────────────────────────────────────

/// Filter for registry listings. Empty filter matches every worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerFilter {
    pub health: Option<HealthState>,
    pub capability: Option<String>,
}

impl WorkerFilter {
    pub fn matches(&self, worker: &Worker) -> bool {
        if let Some(health) = self.health
            && worker.health != health
        {
            return false;
        }
        if let Some(ref cap) = self.capability
            && !worker.capabilities.contains(cap)
        {
            return false;
        }
        true
    }
}
