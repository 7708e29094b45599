//! In-process central config source.
//!
//! Holds `service-defaults` and `proxy-defaults` entries and answers
//! [`RESOLVE_SERVICE_CONFIG`] blocking queries from them, so an agent can
//! run the full reconciliation path without a server cluster.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::debug;

use vigil_core::{
    ConfigEntry, ExposeConfig, MeshGatewayConfig, MeshGatewayMode, ServiceConfigRequest,
    ServiceConfigResponse,
};

use crate::cache::{RESOLVE_SERVICE_CONFIG, ResolveArgs, Rpc};
use crate::error::CacheError;

/// Longest a blocking query waits for the index to move.
pub const DEFAULT_MAX_QUERY_TIME: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Default)]
struct ServiceDefaults {
    protocol: String,
    mesh_gateway: MeshGatewayConfig,
    expose: ExposeConfig,
}

#[derive(Debug, Clone, Default)]
struct ProxyDefaults {
    config: Map<String, Value>,
    mesh_gateway: MeshGatewayConfig,
    expose: ExposeConfig,
}

#[derive(Default)]
struct Entries {
    services: HashMap<String, ServiceDefaults>,
    proxy: Option<ProxyDefaults>,
}

pub struct ConfigEntryStore {
    entries: Mutex<Entries>,
    index: watch::Sender<u64>,
    max_query_time: Duration,
}

impl ConfigEntryStore {
    pub fn new(initial: &[ConfigEntry]) -> Self {
        let store = Self {
            entries: Mutex::new(Entries::default()),
            index: watch::Sender::new(1),
            max_query_time: DEFAULT_MAX_QUERY_TIME,
        };
        {
            let mut entries = store.lock();
            for entry in initial {
                apply(&mut entries, entry.clone());
            }
        }
        store
    }

    pub fn with_max_query_time(mut self, max: Duration) -> Self {
        self.max_query_time = max;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current raft-style index; advances on every write.
    pub fn index(&self) -> u64 {
        *self.index.borrow()
    }

    /// Insert or replace an entry.
    pub fn set(&self, entry: ConfigEntry) {
        apply(&mut self.lock(), entry);
        self.bump();
    }

    /// Delete the `service-defaults` entry for `name`. Returns whether it existed.
    pub fn delete_service_defaults(&self, name: &str) -> bool {
        let existed = self.lock().services.remove(name).is_some();
        if existed {
            self.bump();
        }
        existed
    }

    fn bump(&self) {
        self.index.send_modify(|i| *i += 1);
        debug!(index = self.index(), "config entries changed");
    }

    /// Merge the global proxy defaults with the service's own defaults and
    /// the protocol of each requested upstream.
    pub fn resolve(&self, req: &ServiceConfigRequest) -> ServiceConfigResponse {
        let entries = self.lock();
        let mut resp = ServiceConfigResponse {
            index: self.index(),
            ..Default::default()
        };

        if let Some(proxy) = &entries.proxy {
            resp.proxy_config = proxy.config.clone();
            resp.mesh_gateway = proxy.mesh_gateway;
            resp.expose = proxy.expose.clone();
        }

        if let Some(svc) = entries.services.get(&req.name) {
            if svc.expose.checks || !svc.expose.paths.is_empty() {
                resp.expose = svc.expose.clone();
            }
            if svc.mesh_gateway.mode != MeshGatewayMode::Default {
                resp.mesh_gateway = svc.mesh_gateway;
            }
            if !svc.protocol.is_empty() {
                resp.proxy_config
                    .insert("protocol".to_string(), Value::String(svc.protocol.clone()));
            }
        }

        for upstream in &req.upstream_ids {
            let Some(us) = entries.services.get(upstream) else {
                continue;
            };
            if us.protocol.is_empty() {
                continue;
            }
            let mut cfg = Map::new();
            cfg.insert("protocol".to_string(), Value::String(us.protocol.clone()));
            resp.upstream_configs.insert(upstream.clone(), cfg);
        }
        resp
    }
}

fn apply(entries: &mut Entries, entry: ConfigEntry) {
    match entry {
        ConfigEntry::ServiceDefaults {
            name,
            protocol,
            mesh_gateway,
            expose,
        } => {
            entries.services.insert(
                name,
                ServiceDefaults {
                    protocol,
                    mesh_gateway,
                    expose,
                },
            );
        }
        ConfigEntry::ProxyDefaults {
            config,
            mesh_gateway,
            expose,
        } => {
            entries.proxy = Some(ProxyDefaults {
                config,
                mesh_gateway,
                expose,
            });
        }
    }
}

#[async_trait]
impl Rpc for ConfigEntryStore {
    async fn rpc(&self, method: &str, args: Value) -> Result<Value, CacheError> {
        if method != RESOLVE_SERVICE_CONFIG {
            return Err(CacheError::UnknownMethod(method.to_string()));
        }
        let args: ResolveArgs =
            serde_json::from_value(args).map_err(|e| CacheError::Decode(e.to_string()))?;

        if args.min_index > 0 {
            let mut rx = self.index.subscribe();
            // Timing out just answers with the unchanged value.
            let _ = tokio::time::timeout(
                self.max_query_time,
                rx.wait_for(|index| *index > args.min_index),
            )
            .await;
        }

        serde_json::to_value(self.resolve(&args.request))
            .map_err(|e| CacheError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn service_defaults(name: &str, protocol: &str) -> ConfigEntry {
        ConfigEntry::ServiceDefaults {
            name: name.to_string(),
            protocol: protocol.to_string(),
            mesh_gateway: MeshGatewayConfig::default(),
            expose: ExposeConfig::default(),
        }
    }

    fn proxy_defaults() -> ConfigEntry {
        let mut config = Map::new();
        config.insert("protocol".to_string(), Value::String("tcp".to_string()));
        config.insert("connect_timeout_ms".to_string(), Value::from(5000));
        ConfigEntry::ProxyDefaults {
            config,
            mesh_gateway: MeshGatewayConfig {
                mode: MeshGatewayMode::Local,
            },
            expose: ExposeConfig::default(),
        }
    }

    fn request(name: &str, upstreams: &[&str]) -> ServiceConfigRequest {
        ServiceConfigRequest {
            name: name.to_string(),
            upstream_ids: upstreams.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn service_protocol_overrides_proxy_defaults() {
        let store = ConfigEntryStore::new(&[proxy_defaults(), service_defaults("web", "http")]);
        let resp = store.resolve(&request("web", &[]));
        assert_eq!(resp.proxy_config["protocol"], "http");
        assert_eq!(resp.proxy_config["connect_timeout_ms"], 5000);
        assert_eq!(resp.mesh_gateway.mode, MeshGatewayMode::Local);
    }

    #[test]
    fn upstream_protocols_are_resolved() {
        let store = ConfigEntryStore::new(&[service_defaults("db", "tcp"), service_defaults("api", "")]);
        let resp = store.resolve(&request("web", &["db", "api", "cache"]));
        assert_eq!(resp.upstream_configs.len(), 1);
        assert_eq!(resp.upstream_configs["db"]["protocol"], "tcp");
    }

    #[test]
    fn writes_advance_index() {
        let store = ConfigEntryStore::new(&[]);
        let before = store.index();
        store.set(service_defaults("web", "http"));
        assert!(store.index() > before);
        assert!(store.delete_service_defaults("web"));
        assert!(!store.delete_service_defaults("web"));
        assert_eq!(store.index(), before + 2);
    }

    #[tokio::test]
    async fn blocking_query_waits_for_change() {
        let store = Arc::new(ConfigEntryStore::new(&[]));
        let index = store.index();
        let args = serde_json::to_value(ResolveArgs {
            request: request("web", &[]),
            min_index: index,
        })
        .unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.rpc(RESOLVE_SERVICE_CONFIG, args).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        store.set(service_defaults("web", "http"));
        let reply: ServiceConfigResponse =
            serde_json::from_value(waiter.await.unwrap().unwrap()).unwrap();
        assert_eq!(reply.proxy_config["protocol"], "http");
        assert!(reply.index > index);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_query_times_out_with_current_value() {
        let store = ConfigEntryStore::new(&[]).with_max_query_time(Duration::from_secs(5));
        let args = serde_json::to_value(ResolveArgs {
            request: request("web", &[]),
            min_index: store.index(),
        })
        .unwrap();
        let reply: ServiceConfigResponse =
            serde_json::from_value(store.rpc(RESOLVE_SERVICE_CONFIG, args).await.unwrap()).unwrap();
        assert_eq!(reply.index, store.index());
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let store = ConfigEntryStore::new(&[]);
        let err = store.rpc("Catalog.Register", Value::Null).await.unwrap_err();
        assert_eq!(err, CacheError::UnknownMethod("Catalog.Register".to_string()));
    }
}
