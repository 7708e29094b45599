//! Crash-safe persistence for the Vigil agent.
//!
//! Services, checks, central config defaults, TTL check state and API
//! tokens are stored as one JSON file each under the data directory, named
//! by the SHA-256 of their identifier. Scans tolerate partial writes and
//! undecodable files so a damaged entry never blocks agent startup.

pub mod error;
pub mod records;
pub mod store;

pub use error::{PersistError, PersistResult};
pub use records::*;
pub use store::{Persistence, write_file_atomic};
