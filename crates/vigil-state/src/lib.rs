//! Local agent state for Vigil.
//!
//! Holds the services and checks registered on this node together with
//! each check's latest result. Check engines write into it through the
//! [`vigil_core::CheckNotifier`] implementation.

pub mod error;
pub mod local;

pub use error::{StateError, StateResult};
pub use local::{CheckRunState, CheckState, CriticalCheck, LocalState, ServiceState};
