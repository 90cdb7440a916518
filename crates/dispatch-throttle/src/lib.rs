//! dispatch-throttle — health-driven concurrency throttling.
//!
//! Watches each worker's classified health and walks its effective
//! concurrency limit down under overload and back up after recovery, with
//! hysteresis against oscillation. Sustained overload escalates to a restart
//! request against the external worker-lifecycle collaborator.

pub mod controller;

pub use controller::{RestartFn, ThrottleController, ThrottleDecision, ThrottleMode};
