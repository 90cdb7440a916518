//! Health classification.
//!
//! Pure function over a worker's rolling aggregate and the policy
//! thresholds. First matching rule wins:
//!
//! 1. no sample within 2× the check interval → `Offline`
//! 2. any metric over its threshold → `Overloaded`
//! 3. any metric within 10% of its threshold → `Degraded`
//! 4. otherwise → `Healthy`

use dispatch_registry::{HealthState, RollingMetrics, Thresholds};

/// Fraction of a threshold that counts as "close" for the degraded rule.
const DEGRADED_MARGIN: f64 = 0.10;

/// Classify a worker's health.
///
/// `last_seen_ms` is the most recent sample timestamp, or the registration
/// timestamp if the worker has never been sampled.
pub fn classify(
    metrics: &RollingMetrics,
    thresholds: &Thresholds,
    last_seen_ms: u64,
    now_ms: u64,
    interval_ms: u64,
) -> HealthState {
    if now_ms.saturating_sub(last_seen_ms) > 2 * interval_ms {
        return HealthState::Offline;
    }

    let gauges = [
        (metrics.cpu_pct, thresholds.max_cpu_pct),
        (metrics.memory_pct, thresholds.max_memory_pct),
        (metrics.avg_response_ms, thresholds.max_response_ms),
        (metrics.error_rate, thresholds.max_error_rate),
    ];

    if gauges.iter().any(|(value, max)| value > max) {
        return HealthState::Overloaded;
    }
    if gauges
        .iter()
        .any(|(value, max)| *value > max * (1.0 - DEGRADED_MARGIN))
    {
        return HealthState::Degraded;
    }

    HealthState::Healthy
}
