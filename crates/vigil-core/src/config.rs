//! vigil.toml agent configuration parser.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::duration::duration_str;
use crate::types::{CheckDefinition, ServiceDefinition};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub node_name: String,
    pub datacenter: String,
    pub data_dir: PathBuf,
    /// Nothing is read from or written to `data_dir`.
    pub dev_mode: bool,
    #[serde(with = "duration_str")]
    pub check_reap_interval: Duration,
    /// Lower bound for a check's `deregister_critical_service_after`.
    #[serde(with = "duration_str")]
    pub check_deregister_interval_min: Duration,
    pub tokens: TokensConfig,
    pub enable_token_persistence: bool,
    pub node_meta: HashMap<String, String>,
    pub services: Vec<ServiceConfig>,
    pub checks: Vec<CheckConfig>,
    pub config_entries: Vec<ConfigEntry>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: "vigil".to_string(),
            datacenter: "dc1".to_string(),
            data_dir: PathBuf::from("/var/lib/vigil"),
            dev_mode: false,
            check_reap_interval: Duration::from_secs(30),
            check_deregister_interval_min: Duration::from_secs(60),
            tokens: TokensConfig::default(),
            enable_token_persistence: false,
            node_meta: HashMap::new(),
            services: Vec::new(),
            checks: Vec::new(),
            config_entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    pub default: String,
    pub agent: String,
    pub agent_master: String,
    pub replication: String,
}

/// A service declared in the config file, with its checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(flatten)]
    pub service: ServiceDefinition,
    #[serde(default)]
    pub checks: Vec<CheckDefinition>,
    #[serde(default)]
    pub token: String,
}

/// A standalone check declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    #[serde(flatten)]
    pub check: CheckDefinition,
    #[serde(default)]
    pub token: String,
}

/// A central config entry seeding the in-process config source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ConfigEntry {
    ServiceDefaults {
        name: String,
        #[serde(default)]
        protocol: String,
        #[serde(default)]
        mesh_gateway: crate::types::MeshGatewayConfig,
        #[serde(default)]
        expose: crate::types::ExposeConfig,
    },
    ProxyDefaults {
        #[serde(default)]
        config: Map<String, Value>,
        #[serde(default)]
        mesh_gateway: crate::types::MeshGatewayConfig,
        #[serde(default)]
        expose: crate::types::ExposeConfig,
    },
}

impl AgentConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Config for an in-memory agent that never touches disk.
    pub fn dev() -> Self {
        Self {
            dev_mode: true,
            ..Default::default()
        }
    }
}
