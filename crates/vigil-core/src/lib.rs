//! Shared vocabulary for the Vigil agent: service and check definitions,
//! health statuses, central config request types, the notifier seam
//! between check engines and local state, and the agent config file.

pub mod config;
pub mod duration;
pub mod error;
pub mod notifier;
pub mod types;

pub use config::{AgentConfig, CheckConfig, ConfigEntry, ServiceConfig, TokensConfig};
pub use error::ValidationError;
pub use notifier::CheckNotifier;
pub use types::*;
