#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vigil_agent::{Agent, CacheError, ConfigCache, UpdateEvent};
use vigil_core::{
    AgentConfig, CheckDefinition, CheckType, Probe, ProxyConfig, ServiceConfigRequest,
    ServiceConfigResponse, ServiceDefinition, ServiceKind,
};

struct MockWatch {
    name: String,
    correlation_id: String,
    tx: mpsc::Sender<UpdateEvent>,
    cancel: CancellationToken,
}

/// Config cache whose values and updates are driven by the test.
#[derive(Default)]
pub struct MockCache {
    defaults: Mutex<HashMap<String, ServiceConfigResponse>>,
    fail_get: AtomicBool,
    watches: Mutex<Vec<MockWatch>>,
}

impl MockCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_defaults(&self, name: &str, defaults: ServiceConfigResponse) {
        self.defaults
            .lock()
            .unwrap()
            .insert(name.to_string(), defaults);
    }

    pub fn fail_gets(&self, fail: bool) {
        self.fail_get.store(fail, Ordering::SeqCst);
    }

    pub fn notify_calls(&self) -> usize {
        self.watches.lock().unwrap().len()
    }

    /// Watches whose cancellation token has not fired.
    pub fn live_watches(&self) -> usize {
        self.watches
            .lock()
            .unwrap()
            .iter()
            .filter(|w| !w.cancel.is_cancelled())
            .count()
    }

    /// Deliver `defaults` to every live watch on `name`.
    pub async fn push(&self, name: &str, defaults: ServiceConfigResponse) {
        for (correlation_id, tx) in self.senders(name) {
            let _ = tx
                .send(UpdateEvent {
                    correlation_id,
                    result: Ok(defaults.clone()),
                })
                .await;
        }
    }

    /// Deliver `defaults` to the live watches on `name`, tagged with
    /// `correlation_id` instead of their own.
    pub async fn push_tagged(&self, name: &str, correlation_id: &str, defaults: ServiceConfigResponse) {
        for (_, tx) in self.senders(name) {
            let _ = tx
                .send(UpdateEvent {
                    correlation_id: correlation_id.to_string(),
                    result: Ok(defaults.clone()),
                })
                .await;
        }
    }

    fn senders(&self, name: &str) -> Vec<(String, mpsc::Sender<UpdateEvent>)> {
        self.watches
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.name == name && !w.cancel.is_cancelled())
            .map(|w| (w.correlation_id.clone(), w.tx.clone()))
            .collect()
    }
}

#[async_trait]
impl ConfigCache for MockCache {
    async fn get(&self, req: &ServiceConfigRequest) -> Result<ServiceConfigResponse, CacheError> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(CacheError::Rpc("no cluster leader".to_string()));
        }
        Ok(self
            .defaults
            .lock()
            .unwrap()
            .get(&req.name)
            .cloned()
            .unwrap_or_default())
    }

    async fn notify(
        &self,
        cancel: CancellationToken,
        req: ServiceConfigRequest,
        correlation_id: String,
        tx: mpsc::Sender<UpdateEvent>,
    ) -> Result<(), CacheError> {
        self.watches.lock().unwrap().push(MockWatch {
            name: req.name,
            correlation_id,
            tx,
            cancel,
        });
        Ok(())
    }
}

pub fn dev_agent(cache: Arc<MockCache>) -> Arc<Agent> {
    Agent::new(AgentConfig::dev(), cache, None)
}

pub fn disk_config(dir: &Path) -> AgentConfig {
    AgentConfig {
        data_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

pub fn ttl_check(id: &str, ttl: Duration) -> CheckDefinition {
    CheckDefinition::new(id, id).with_check_type(CheckType::new(Probe::Ttl { ttl }))
}

/// Sidecar proxy in front of `web`.
pub fn web_sidecar() -> ServiceDefinition {
    let mut svc = ServiceDefinition::new("web-sidecar-proxy");
    svc.kind = ServiceKind::ConnectProxy;
    svc.port = 21000;
    svc.proxy = Some(ProxyConfig {
        destination_service_name: "web".to_string(),
        destination_service_id: "web".to_string(),
        local_service_port: 8080,
        ..Default::default()
    });
    svc
}

pub fn protocol_defaults(protocol: &str, index: u64) -> ServiceConfigResponse {
    let mut defaults = ServiceConfigResponse {
        index,
        ..Default::default()
    };
    defaults
        .proxy_config
        .insert("protocol".to_string(), Value::String(protocol.to_string()));
    defaults
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn eventually<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Protocol in the proxy config of a registered service.
pub fn proxy_protocol(agent: &Agent, service_id: &str) -> Option<String> {
    agent
        .state()
        .service(service_id)?
        .proxy?
        .config
        .get("protocol")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
