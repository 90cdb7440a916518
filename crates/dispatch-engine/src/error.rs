//! Engine error types.

use thiserror::Error;

use dispatch_registry::{AssignmentId, RegistryError, WorkItemId, WorkerId};

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced at the engine's API boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("capability not in the recognized catalog: {0}")]
    InvalidCapability(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("assignment {0} already has a terminal outcome")]
    AlreadyTerminal(AssignmentId),

    #[error("work item {0} was already dispatched")]
    AlreadyDispatched(WorkItemId),

    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    #[error(transparent)]
    Registry(RegistryError),
}

impl From<RegistryError> for EngineError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::WorkerNotFound(id) => Self::UnknownWorker(id),
            RegistryError::DuplicateWorker(id) => Self::DuplicateId(id),
            other => Self::Registry(other),
        }
    }
}
