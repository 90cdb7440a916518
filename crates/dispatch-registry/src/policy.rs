//! Throttle policy — configuration, not runtime state.
//!
//! Loaded at startup and hot-reloadable: a reload swaps in a whole new
//! immutable policy object through [`PolicyHandle`], never a partial
//! mutation. Duration fields are human strings ("5s", "500ms", "2m").

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load-balancing strategy for the dispatch matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastLoaded,
    FastestResponse,
    WeightedByRank,
}

/// Per-metric thresholds for health classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub max_cpu_pct: f64,
    pub max_memory_pct: f64,
    pub max_response_ms: f64,
    pub max_error_rate: f64,
    /// Error rate that escalates a throttled worker straight to restart.
    pub critical_error_rate: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_cpu_pct: 80.0,
            max_memory_pct: 85.0,
            max_response_ms: 1000.0,
            max_error_rate: 0.10,
            critical_error_rate: 0.25,
        }
    }
}

/// Engine configuration: thresholds, timing, and strategy selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlePolicy {
    pub thresholds: Thresholds,
    /// Health-check interval (e.g. "5s").
    pub check_interval: String,
    /// Steps to remove/restore on each throttle adjustment.
    pub throttle_step: u32,
    /// Continuous healthy time before a throttled worker steps back up.
    pub stabilization: String,
    /// Time at the floor limit before restart escalation.
    pub sustained_overload: String,
    /// Time allowed for a restart before the worker is marked offline.
    pub restart_timeout: String,
    pub strategy: Strategy,
    /// EWMA decay for rolling health metrics.
    pub ewma_alpha: f64,
    /// Recognized capability tags; work with any other tag is rejected.
    pub capabilities: Vec<String>,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            check_interval: "5s".to_string(),
            throttle_step: 1,
            stabilization: "15s".to_string(),
            sustained_overload: "15s".to_string(),
            restart_timeout: "30s".to_string(),
            strategy: Strategy::LeastLoaded,
            ewma_alpha: 0.3,
            capabilities: Vec::new(),
        }
    }
}

impl ThrottlePolicy {
    pub fn check_interval_ms(&self) -> u64 {
        duration_ms(&self.check_interval, 5_000)
    }

    pub fn stabilization_ms(&self) -> u64 {
        duration_ms(&self.stabilization, 15_000)
    }

    pub fn sustained_overload_ms(&self) -> u64 {
        duration_ms(&self.sustained_overload, 15_000)
    }

    pub fn restart_timeout_ms(&self) -> u64 {
        duration_ms(&self.restart_timeout, 30_000)
    }

    /// Whether a capability tag is in the recognized catalog.
    ///
    /// An empty catalog recognizes everything (the caller opted out of
    /// capability validation).
    pub fn recognizes(&self, capability: &str) -> bool {
        self.capabilities.is_empty() || self.capabilities.iter().any(|c| c == capability)
    }
}

/// Shared, atomically swappable policy.
///
/// Readers clone the inner `Arc`; a reload replaces it wholesale.
#[derive(Clone)]
pub struct PolicyHandle {
    inner: Arc<RwLock<Arc<ThrottlePolicy>>>,
}

impl PolicyHandle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(policy))),
        }
    }

    /// Current policy. Cheap; the lock is held only to clone the `Arc`.
    pub fn load(&self) -> Arc<ThrottlePolicy> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Swap in a new policy atomically.
    pub fn store(&self, policy: ThrottlePolicy) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(policy);
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(ThrottlePolicy::default())
    }
}

/// Parse a duration string like "5s", "500ms", "2m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(rest) = s.strip_suffix("ms") {
        rest.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(rest) = s.strip_suffix('s') {
        rest.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(rest) = s.strip_suffix('m') {
        rest.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn duration_ms(s: &str, fallback_ms: u64) -> u64 {
    parse_duration(s)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(fallback_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("oops"), None);
    }

    #[test]
    fn invalid_durations_fall_back_to_defaults() {
        let policy = ThrottlePolicy {
            check_interval: "bogus".to_string(),
            ..ThrottlePolicy::default()
        };
        assert_eq!(policy.check_interval_ms(), 5_000);
    }

    #[test]
    fn empty_catalog_recognizes_everything() {
        let policy = ThrottlePolicy::default();
        assert!(policy.recognizes("dry_van"));

        let policy = ThrottlePolicy {
            capabilities: vec!["dry_van".to_string()],
            ..ThrottlePolicy::default()
        };
        assert!(policy.recognizes("dry_van"));
        assert!(!policy.recognizes("reefer"));
    }

    #[test]
    fn handle_swaps_atomically() {
        let handle = PolicyHandle::new(ThrottlePolicy::default());
        assert_eq!(handle.load().throttle_step, 1);

        handle.store(ThrottlePolicy {
            throttle_step: 2,
            ..ThrottlePolicy::default()
        });
        assert_eq!(handle.load().throttle_step, 2);

        // Old clones are unaffected — immutable snapshot semantics.
        let old = handle.load();
        handle.store(ThrottlePolicy::default());
        assert_eq!(old.throttle_step, 2);
    }
}
