use thiserror::Error;

use crate::model::{PoolKind, SubjectId, UnitId};

/// Errors returned by the allocator and its store
///
/// All of them are recoverable by the caller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The subject already holds a unit of the pool, or the requested unit is
    /// held by somebody else
    #[error("already allocated: {0}")]
    AlreadyAllocated(String),

    #[error("no {0} unit is available")]
    PoolExhausted(PoolKind),

    #[error("unit {0} is not allocated")]
    NotAllocated(UnitId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The store could not be reached or failed to answer
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A compare-and-set lost against a concurrent writer
    #[error("conflicting update on {0}")]
    Conflict(String),
}

impl AllocError {
    pub fn unit_not_found(id: UnitId) -> Self {
        AllocError::NotFound(format!("unit {id}"))
    }

    pub fn subject_not_found(id: SubjectId) -> Self {
        AllocError::NotFound(format!("subject {id}"))
    }

    /// Short machine readable tag, used on the wire
    pub fn code(&self) -> &'static str {
        match self {
            AllocError::AlreadyAllocated(_) => "already-allocated",
            AllocError::PoolExhausted(_) => "pool-exhausted",
            AllocError::NotAllocated(_) => "not-allocated",
            AllocError::InvalidInput(_) => "invalid-input",
            AllocError::NotFound(_) => "not-found",
            AllocError::StorageUnavailable(_) => "storage-unavailable",
            AllocError::Conflict(_) => "conflict",
        }
    }
}

pub type AllocResult<T> = Result<T, AllocError>;
