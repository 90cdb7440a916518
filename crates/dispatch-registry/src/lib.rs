//! dispatch-registry — authoritative worker set for the dispatch engine.
//!
//! Holds the capacity-bounded [`Worker`] records along with the work-item and
//! assignment domain types shared by the other engine crates.
//!
//! # Architecture
//!
//! Each worker lives behind its own `tokio::sync::Mutex`; the outer map is
//! only locked to look the handle up. A health-driven limit change and a
//! dispatch-driven in-flight increment therefore serialize on the same
//! per-worker lock and can never race the
//! `in_flight <= effective_limit <= base_limit` invariant.
//!
//! The `WorkerRegistry` is `Clone + Send + Sync` (backed by `Arc`) and can be
//! shared across async tasks.

pub mod error;
pub mod policy;
pub mod registry;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use policy::{parse_duration, PolicyHandle, Strategy, Thresholds, ThrottlePolicy};
pub use registry::WorkerRegistry;
pub use types::*;
