//! dispatch-engine — the capacity-aware dispatch and throttling facade.
//!
//! Ties the worker registry, health monitor, throttle controller, and
//! dispatch matcher into one engine: submit work, dispatch batches, report
//! outcomes, feed health samples, and override manually when needed.

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;

pub use config::{load_policy, reload_policy};
pub use engine::DispatchEngine;
pub use error::{EngineError, EngineResult};

pub use dispatch_health::HealthEvent;
pub use dispatch_registry::{
    now_ms, Assignment, AssignmentOutcome, HealthSample, HealthState, PolicyHandle, Priority,
    RegistryError, Strategy, Thresholds, ThrottlePolicy, WorkItem, WorkItemStatus, Worker,
    WorkerFilter,
};
pub use dispatch_throttle::{RestartFn, ThrottleMode};
