//! Error types for local state mutations.

use thiserror::Error;

/// Result type alias for local state operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("service ID missing")]
    MissingServiceId,

    #[error("CheckID missing")]
    MissingCheckId,

    #[error("service does not exist: {0}")]
    ServiceNotFound(String),

    #[error("check does not exist: {0}")]
    CheckNotFound(String),
}
