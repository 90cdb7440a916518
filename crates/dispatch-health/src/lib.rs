//! dispatch-health — health monitoring for dispatch workers.
//!
//! Ingests raw [`HealthSample`](dispatch_registry::HealthSample)s, folds them
//! into each worker's rolling aggregate, classifies the worker's health
//! state, and publishes state transitions for the throttle controller and
//! external observability consumers.

pub mod classifier;
pub mod monitor;

pub use classifier::classify;
pub use monitor::{HealthEvent, HealthMonitor};
