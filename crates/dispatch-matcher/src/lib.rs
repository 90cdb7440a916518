//! dispatch-matcher — binds pending work items to eligible workers.
//!
//! Items are processed priority-first; workers pass a capability filter and
//! a health/capacity gate, then one is selected by the policy's
//! load-balancing strategy. The commit (assignment created, item assigned,
//! in-flight incremented) happens atomically under the worker's lock.

pub mod matcher;
pub mod strategy;

pub use matcher::DispatchMatcher;
pub use strategy::{fastest_response, least_loaded, next_round_robin, weighted_by_rank};
