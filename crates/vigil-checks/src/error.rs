//! Errors raised while building a check engine.
//!
//! Probe failures are not errors; they surface as a critical status with
//! the failure text as output.

use thiserror::Error;

pub type CheckResult<T> = Result<T, CheckError>;

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("invalid check url {url:?}: {msg}")]
    InvalidUrl { url: String, msg: String },

    #[error("invalid http method {0:?}")]
    InvalidMethod(String),

    #[error("tls configuration error: {0}")]
    Tls(String),
}
