//! Vigil agent: ties local state, check engines, persistence and central
//! config together behind one API.

pub mod agent;
pub mod cache;
pub mod config_entries;
mod engines;
pub mod error;
pub mod merge;
pub mod service_manager;
pub mod tokens;

pub use agent::{Agent, service_maint_check_id};
pub use cache::{ConfigCache, ResolvedConfigCache, Rpc, UpdateEvent};
pub use config_entries::ConfigEntryStore;
pub use error::{AgentError, AgentResult, CacheError};
pub use service_manager::{AddServiceRequest, ServiceManager};
pub use tokens::{TokenKind, TokenSource, TokenStore};
