//! Engine-level error type.
//!
//! Wraps the domain taxonomy with the storage and serialization failures that
//! only exist once state is shared and persisted.

use thiserror::Error;

use rentflow_core::DomainError;

use crate::event_store::EventStoreError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("event store: {0}")]
    Store(#[from] EventStoreError),

    /// Failed to deserialize historical event payloads into the aggregate event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl EngineError {
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            EngineError::Domain(e) => Some(e),
            _ => None,
        }
    }

    /// Integrity failures: never retried, logged at error level.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Domain(e) => e.is_fatal(),
            EngineError::Store(_) => false,
            EngineError::Deserialize(_) | EngineError::LockPoisoned(_) => true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Domain(e) => e.is_retryable(),
            EngineError::Store(EventStoreError::Concurrency(_)) => true,
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Domain(e) => e.code(),
            EngineError::Store(EventStoreError::Concurrency(_)) => "conflict",
            EngineError::Store(_) => "store_error",
            EngineError::Deserialize(_) => "deserialize_error",
            EngineError::LockPoisoned(_) => "internal_error",
        }
    }
}

/// Map a poisoned lock into an engine error.
pub(crate) fn poisoned<T>(what: &'static str) -> impl FnOnce(T) -> EngineError {
    move |_| EngineError::LockPoisoned(what)
}
