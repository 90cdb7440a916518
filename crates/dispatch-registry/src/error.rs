//! Registry error types.

use thiserror::Error;

use crate::types::HealthState;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("invalid limit {limit} for worker {worker_id} (base limit {base})")]
    InvalidLimit {
        worker_id: String,
        limit: u32,
        base: u32,
    },

    #[error("capacity exceeded for worker {worker_id} ({in_flight}/{effective_limit} in flight)")]
    CapacityExceeded {
        worker_id: String,
        in_flight: u32,
        effective_limit: u32,
    },

    #[error("worker {worker_id} lacks capability: {capability}")]
    CapabilityMismatch {
        worker_id: String,
        capability: String,
    },

    #[error("worker {worker_id} is not accepting work: {health:?}")]
    WorkerUnavailable {
        worker_id: String,
        health: HealthState,
    },
}
