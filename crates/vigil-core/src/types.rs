//! Domain types shared by every Vigil crate.
//!
//! Service and check definitions are what callers register; the central
//! config request/response pair is what the service manager exchanges with
//! the config cache. Everything serializes to JSON for the data directory
//! and to TOML for the agent config file.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::duration::{duration_str, option_duration_str};
use crate::error::ValidationError;

/// Unique identifier for a check on this node.
pub type CheckId = String;

/// Unique identifier for a service on this node.
pub type ServiceId = String;

/// Check ID of the synthetic node maintenance check.
pub const NODE_MAINT_CHECK_ID: &str = "_node_maintenance";

/// Prefix of the synthetic per-service maintenance check IDs.
pub const SERVICE_MAINT_PREFIX: &str = "_service_maintenance:";

/// Upstream destination types understood by the merge logic.
pub const UPSTREAM_DEST_TYPE_SERVICE: &str = "service";
pub const UPSTREAM_DEST_TYPE_PREPARED_QUERY: &str = "prepared_query";

/// Stable, filesystem-safe hash of an identifier (lowercase SHA-256 hex).
pub fn stable_hash(s: &str) -> String {
    hex::encode(Sha256::digest(s.as_bytes()))
}

// ── Status ─────────────────────────────────────────────────────────

/// Health status reported by a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Passing,
    Warning,
    /// New checks start here so unverified services stay out of the pool.
    #[default]
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passing" => Ok(HealthStatus::Passing),
            "warning" => Ok(HealthStatus::Warning),
            "critical" => Ok(HealthStatus::Critical),
            other => Err(ValidationError::InvalidStatus(other.to_string())),
        }
    }
}

/// Where a registration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    /// The agent configuration file.
    #[default]
    Local,
    /// The agent API.
    Remote,
}

// ── Service ───────────────────────────────────────────────────────

/// Kind of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    #[default]
    Typical,
    ConnectProxy,
    MeshGateway,
}

/// DNS SRV weights by health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weights {
    pub passing: u32,
    pub warning: u32,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            passing: 1,
            warning: 1,
        }
    }
}

/// A locally registered service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDefinition {
    /// Defaults to `service` when empty.
    pub id: ServiceId,
    /// Service name.
    pub service: String,
    pub kind: ServiceKind,
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
    pub meta: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<Weights>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            service: name,
            ..Default::default()
        }
    }

    /// Check the name and fill in the ID from it when missing.
    pub fn normalize(&mut self) -> Result<(), ValidationError> {
        if self.service.is_empty() {
            return Err(ValidationError::MissingServiceName);
        }
        if self.id.is_empty() {
            self.id = self.service.clone();
        }
        Ok(())
    }

    /// A connect proxy bound to a specific local service instance.
    pub fn is_sidecar_proxy(&self) -> bool {
        self.kind == ServiceKind::ConnectProxy
            && self
                .proxy
                .as_ref()
                .is_some_and(|p| !p.destination_service_id.is_empty())
    }
}

/// Proxy settings for connect proxies and gateways.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub destination_service_name: String,
    pub destination_service_id: String,
    pub local_service_address: String,
    pub local_service_port: u16,
    /// Opaque proxy configuration.
    pub config: Map<String, Value>,
    pub upstreams: Vec<Upstream>,
    pub mesh_gateway: MeshGatewayConfig,
    pub expose: ExposeConfig,
}

/// How traffic reaches other datacenters through mesh gateways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshGatewayMode {
    /// Unset; inherits from the next level up.
    #[default]
    #[serde(rename = "")]
    Default,
    None,
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshGatewayConfig {
    pub mode: MeshGatewayMode,
}

/// Paths exposed through the proxy without mTLS.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposeConfig {
    /// Expose every HTTP/gRPC check endpoint of the destination service.
    pub checks: bool,
    pub paths: Vec<ExposePath>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposePath {
    pub listener_port: u16,
    pub path: String,
    pub local_path_port: u16,
    pub protocol: String,
}

/// An upstream dependency of a proxy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Upstream {
    /// `service` (also when empty) or `prepared_query`.
    pub destination_type: String,
    pub destination_name: String,
    pub datacenter: String,
    pub local_bind_port: u16,
    pub config: Map<String, Value>,
    pub mesh_gateway: MeshGatewayConfig,
}

impl Upstream {
    pub fn is_service(&self) -> bool {
        self.destination_type.is_empty() || self.destination_type == UPSTREAM_DEST_TYPE_SERVICE
    }
}

// ── Central config ────────────────────────────────────────────────

/// Request for the resolved central configuration of one service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfigRequest {
    pub name: String,
    pub datacenter: String,
    pub token: String,
    pub upstream_ids: Vec<String>,
}

impl ServiceConfigRequest {
    /// Key identifying this request in the config cache. Also used as the
    /// correlation ID of its watch.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [&self.name, &self.datacenter, &self.token] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        for id in &self.upstream_ids {
            hasher.update(id.as_bytes());
            hasher.update([1u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Centrally managed defaults for a service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfigResponse {
    pub proxy_config: Map<String, Value>,
    /// Upstream name → config defaults for that upstream.
    pub upstream_configs: HashMap<String, Map<String, Value>>,
    pub mesh_gateway: MeshGatewayConfig,
    pub expose: ExposeConfig,
    /// Raft-style index; advances whenever the resolved value changes.
    pub index: u64,
}

// ── Checks ────────────────────────────────────────────────────────

/// What a check probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Probe {
    /// Run `args` directly, or `script` through `sh -c`.
    Script {
        #[serde(default)]
        script: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Http {
        url: String,
        #[serde(default)]
        method: String,
        #[serde(default)]
        headers: HashMap<String, Vec<String>>,
        #[serde(default)]
        body: String,
        #[serde(default)]
        tls_skip_verify: bool,
    },
    Tcp {
        address: String,
    },
    Ttl {
        #[serde(with = "duration_str")]
        ttl: Duration,
    },
    /// Exec inside a running container.
    Docker {
        container_id: String,
        #[serde(default)]
        shell: String,
        #[serde(default)]
        script: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Probe {
    pub fn kind(&self) -> &'static str {
        match self {
            Probe::Script { .. } => "script",
            Probe::Http { .. } => "http",
            Probe::Tcp { .. } => "tcp",
            Probe::Ttl { .. } => "ttl",
            Probe::Docker { .. } => "docker",
        }
    }
}

/// Probe configuration plus scheduling for a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckType {
    #[serde(flatten)]
    pub probe: Probe,
    #[serde(default, with = "option_duration_str", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
    #[serde(default, with = "option_duration_str", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "option_duration_str", skip_serializing_if = "Option::is_none")]
    pub deregister_critical_service_after: Option<Duration>,
    /// Output capture limit in bytes; 0 means the engine default.
    #[serde(default)]
    pub output_max_size: usize,
    #[serde(default)]
    pub success_before_passing: u32,
    #[serde(default)]
    pub failures_before_critical: u32,
}

impl CheckType {
    pub fn new(probe: Probe) -> Self {
        Self {
            probe,
            interval: None,
            timeout: None,
            deregister_critical_service_after: None,
            output_max_size: 0,
            success_before_passing: 0,
            failures_before_critical: 0,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_ttl(&self) -> bool {
        matches!(self.probe, Probe::Ttl { .. })
    }

    pub fn ttl(&self) -> Option<Duration> {
        match self.probe {
            Probe::Ttl { ttl } => Some(ttl),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |msg: &str| Err(ValidationError::InvalidCheckType(msg.to_string()));

        if let Probe::Ttl { ttl } = self.probe {
            if ttl.is_zero() {
                return invalid("ttl must be greater than zero");
            }
            return Ok(());
        }

        let interval = self.interval.unwrap_or_default();
        if interval.is_zero() {
            return invalid("interval must be greater than zero");
        }
        if self.timeout.is_some_and(|t| t > interval) {
            return invalid("timeout must not exceed interval");
        }

        match &self.probe {
            Probe::Script { script, args } if script.is_empty() && args.is_empty() => {
                invalid("script check needs a script or args")
            }
            Probe::Http { url, .. }
                if !(url.starts_with("http://") || url.starts_with("https://")) =>
            {
                invalid("http check needs an http:// or https:// url")
            }
            Probe::Tcp { address } if address.is_empty() => invalid("tcp check needs an address"),
            Probe::Docker { container_id, .. } if container_id.is_empty() => {
                invalid("docker check needs a container id")
            }
            Probe::Docker { script, args, .. } if script.is_empty() && args.is_empty() => {
                invalid("docker check needs a script or args")
            }
            _ => Ok(()),
        }
    }
}

/// A check registration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckDefinition {
    /// May be empty inside a service registration; generated from the
    /// service ID then.
    pub id: CheckId,
    pub name: String,
    pub notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ServiceId>,
    /// Initial status; critical when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<HealthStatus>,
    /// Absent for checks whose status is managed externally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_type: Option<CheckType>,
}

impl CheckDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_check_type(mut self, check_type: CheckType) -> Self {
        self.check_type = Some(check_type);
        self
    }

    pub fn for_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    /// The registered record this definition produces.
    pub fn health_check(&self) -> HealthCheck {
        HealthCheck {
            check_id: self.id.clone(),
            name: self.name.clone(),
            notes: self.notes.clone(),
            service_id: self.service_id.clone(),
            service_name: String::new(),
            status: self.status.unwrap_or_default(),
            output: String::new(),
        }
    }
}

/// A registered check as seen by readers: identity plus latest result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheck {
    pub check_id: CheckId,
    pub name: String,
    pub notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ServiceId>,
    pub service_name: String,
    pub status: HealthStatus,
    pub output: String,
}

impl HealthCheck {
    /// Rebuild a definition from a persisted record and its probe config.
    pub fn into_definition(self, check_type: Option<CheckType>) -> CheckDefinition {
        CheckDefinition {
            id: self.check_id,
            name: self.name,
            notes: self.notes,
            service_id: self.service_id,
            status: Some(self.status),
            check_type,
        }
    }
}
