//! Agent error types.

use thiserror::Error;

use vigil_checks::CheckError;
use vigil_core::ValidationError;
use vigil_persist::PersistError;
use vigil_state::StateError;

/// Errors raised by the config cache and its RPC backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("unknown rpc method {0:?}")]
    UnknownMethod(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Errors that can occur during agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("check error: {0}")]
    Check(#[from] CheckError),

    #[error("config cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("No service registered with ID {0:?}")]
    UnknownService(String),

    #[error("CheckID {0:?} does not have associated TTL")]
    NoTtlCheck(String),

    #[error("check {0:?} needs a container exec client, none is configured")]
    ExecClientUnavailable(String),

    #[error("agent is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    CentralConfig(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
