//! On-disk record shapes.
//!
//! One JSON document per file. Every record carries what is needed to
//! re-register its entity after a restart without the original API call.

use serde::{Deserialize, Serialize};
use vigil_core::{
    CheckId, CheckType, ConfigSource, HealthCheck, HealthStatus, ServiceConfigResponse,
    ServiceDefinition, ServiceId,
};

/// A registered service with the token it was registered with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedService {
    #[serde(default)]
    pub token: String,
    pub service: ServiceDefinition,
    #[serde(default)]
    pub source: ConfigSource,
}

/// The last central defaults merged into a service registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedServiceConfig {
    pub service_id: ServiceId,
    pub defaults: ServiceConfigResponse,
}

/// A registered check plus its probe configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCheck {
    pub check: HealthCheck,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chk_type: Option<CheckType>,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub source: ConfigSource,
}

/// Last reported TTL status, valid until `expires` (unix milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCheckState {
    pub check_id: CheckId,
    pub output: String,
    pub status: HealthStatus,
    pub expires: i64,
}

/// Tokens set through the API. Empty means "not persisted".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedTokens {
    pub replication: String,
    pub agent_master: String,
    pub default: String,
    pub agent: String,
}
