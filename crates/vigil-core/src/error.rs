//! Validation errors for registration input.

use thiserror::Error;

/// Errors raised while validating a service or check definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("bad status string {0:?}: must be passing, warning or critical")]
    InvalidStatus(String),

    #[error("service name missing")]
    MissingServiceName,

    #[error("CheckID missing")]
    MissingCheckId,

    #[error("check type is not valid: {0}")]
    InvalidCheckType(String),
}
