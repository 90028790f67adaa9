use thiserror::Error;
use ulid::Ulid;

use crate::model::ModelError;
use crate::recurrence::RecurrenceError;

/// Failures applying a batch. Nothing is applied when one is returned.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("series {id} is stale: expected version {expected}, found {found}")]
    StaleSeries { id: Ulid, expected: u64, found: u64 },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("log error: {0}")]
    Wal(#[from] std::io::Error),
}

impl StoreError {
    /// Recomputing the whole change can succeed where this attempt failed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::StaleSeries { .. })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("span must have positive length")]
    InvalidSpan,
    #[error("invalid resource rules for {0}")]
    InvalidRules(Ulid),
    #[error("conflict with event: {0}")]
    Conflict(Ulid),
    #[error("too many overlapping events to evaluate (more than {0})")]
    TooManyOverlaps(usize),
    #[error("event {0} is not part of a series")]
    NotInSeries(Ulid),
    #[error("series instances {0} and {1} overlap each other")]
    SeriesOverlap(Ulid, Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error(transparent)]
    Recurrence(#[from] RecurrenceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// The store saw a stale series; recomputing may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_retriable())
    }
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::EmptySpan { .. } => EngineError::InvalidSpan,
            ModelError::InvalidRules(id) => EngineError::InvalidRules(id),
        }
    }
}
