//! Error types for the persistence layer.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Errors that can occur while reading or writing the data directory.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("failed to decode {}: {msg}", path.display())]
    Decode { path: PathBuf, msg: String },
}
