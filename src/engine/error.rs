use thiserror::Error;
use ulid::Ulid;

use crate::model::DocumentKind;

/// Failures reported by a document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The uniqueness constraint on the number column fired.
    #[error("document number already taken: {0}")]
    DuplicateNumber(String),
    #[error("document already exists: {0}")]
    DuplicateId(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Every attempt collided. Nothing was inserted; the caller may retry.
    #[error("could not allocate a {kind} number after {attempts} attempts, try again")]
    Exhausted { kind: DocumentKind, attempts: u32 },
    #[error("malformed document number in store: {0}")]
    MalformedNumber(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("journal error: {0}")]
    Journal(String),
    #[error(transparent)]
    Allocation(#[from] AllocError),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateId(id) => EngineError::AlreadyExists(id),
            StoreError::LimitExceeded(msg) => EngineError::LimitExceeded(msg),
            StoreError::Unavailable(msg) => EngineError::Journal(msg),
            dup @ StoreError::DuplicateNumber(_) => EngineError::Allocation(dup.into()),
        }
    }
}
