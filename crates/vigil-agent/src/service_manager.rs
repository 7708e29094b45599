//! ServiceManager: keeps registered services reconciled with central config.
//!
//! # Architecture
//!
//! ```text
//!   add_service ──► cache.get ──► merge ──► AgentCore::add_service_locked
//!        │                                          ▲
//!        └──► cache.notify ──► WatchContext task ───┘ (re-register on change)
//! ```
//!
//! One watch per service ID. Registering a service again replaces its
//! watch; the old task is cancelled and awaited before the new one starts.
//! Every task runs on a shared [`TaskTracker`] so `stop()` can wait for all
//! of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use vigil_core::{CheckDefinition, ConfigSource, ServiceConfigResponse, ServiceDefinition, ServiceId};

use crate::agent::{AgentCore, CheckRegistry, Registration};
use crate::cache::{ConfigCache, UpdateEvent};
use crate::error::{AgentError, AgentResult};
use crate::merge::{make_config_request, merge_service_config};

/// A service registration as handed to the service manager.
#[derive(Debug, Clone)]
pub struct AddServiceRequest {
    pub service: ServiceDefinition,
    pub checks: Vec<CheckDefinition>,
    /// Write the service and its checks to the data dir.
    pub persist: bool,
    pub token: String,
    /// Remove checks of this service that are not in `checks`.
    pub replace_existing_checks: bool,
    pub source: ConfigSource,
    /// Block on the first central config fetch. When false,
    /// `previous_defaults` is merged instead.
    pub wait_for_central_config: bool,
    pub previous_defaults: Option<ServiceConfigResponse>,
    /// Write the merged-in defaults next to the service.
    pub persist_service_config: bool,
}

impl AddServiceRequest {
    pub fn new(service: ServiceDefinition) -> Self {
        Self {
            service,
            checks: Vec::new(),
            persist: true,
            token: String::new(),
            replace_existing_checks: false,
            source: ConfigSource::Remote,
            wait_for_central_config: true,
            previous_defaults: None,
            persist_service_config: true,
        }
    }

    pub fn with_checks(mut self, checks: Vec<CheckDefinition>) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }
}

struct ServiceConfigWatch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    cache_key: String,
}

pub struct ServiceManager {
    cache: Arc<dyn ConfigCache>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    watches: Mutex<HashMap<ServiceId, ServiceConfigWatch>>,
}

impl ServiceManager {
    pub(crate) fn new(cache: Arc<dyn ConfigCache>) -> Self {
        Self {
            cache,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            watches: Mutex::new(HashMap::new()),
        }
    }

    fn watches(&self) -> MutexGuard<'_, HashMap<ServiceId, ServiceConfigWatch>> {
        match self.watches.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register `req` with central defaults merged in, then start watching
    /// for changes. The caller holds the registration lock.
    ///
    /// Nothing is watched when registration fails.
    pub(crate) async fn add_service(
        &self,
        core: &Arc<AgentCore>,
        registry: &mut CheckRegistry,
        mut req: AddServiceRequest,
    ) -> AgentResult<()> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::ShuttingDown);
        }
        req.service.normalize()?;
        let service_id = req.service.id.clone();

        self.remove_service(&service_id).await;

        let config = core.config();
        let request = make_config_request(
            &req.service,
            &config.datacenter,
            &req.token,
            &core.tokens.agent_token(),
        );

        let defaults = if req.wait_for_central_config {
            match self.cache.get(&request).await {
                Ok(resp) => Some(resp),
                Err(e) => {
                    return Err(AgentError::CentralConfig(format!(
                        "could not retrieve initial service_defaults config for service {service_id:?}: {e}"
                    )));
                }
            }
        } else {
            req.previous_defaults.clone()
        };

        core.add_service_locked(
            registry,
            Registration {
                service: merge_service_config(defaults.as_ref(), &req.service),
                checks: req.checks.clone(),
                persist: req.persist,
                persist_defaults: defaults.filter(|_| req.persist_service_config),
                token: req.token.clone(),
                replace_existing_checks: req.replace_existing_checks,
                source: req.source,
            },
        )
        .await?;

        let cache_key = request.cache_key();
        let cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::channel(1);
        self.cache
            .notify(cancel.clone(), request, cache_key.clone(), tx)
            .await?;

        let ctx = WatchContext {
            core: Arc::clone(core),
            registration: req,
            cache_key: cache_key.clone(),
            cancel: cancel.clone(),
        };
        let handle = self.tracker.spawn(ctx.run(rx));
        debug!(%service_id, %cache_key, "service config watch started");
        self.watches().insert(
            service_id,
            ServiceConfigWatch {
                cancel,
                handle,
                cache_key,
            },
        );
        Ok(())
    }

    /// Stop the watch for `service_id` and wait for its task to exit.
    pub(crate) async fn remove_service(&self, service_id: &str) {
        let Some(watch) = self.watches().remove(service_id) else {
            return;
        };
        watch.cancel.cancel();
        let _ = watch.handle.await;
        debug!(%service_id, "service config watch stopped");
    }

    /// Stop every watch. Registrations after this fail.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.watches().clear();
        info!("service manager stopped");
    }

    pub fn watch_count(&self) -> usize {
        self.watches().len()
    }

    pub fn has_watch(&self, service_id: &str) -> bool {
        self.watches().contains_key(service_id)
    }

    /// Correlation ID of the live watch for `service_id`.
    pub fn watch_key(&self, service_id: &str) -> Option<String> {
        self.watches().get(service_id).map(|w| w.cache_key.clone())
    }
}

/// State of one running watch task.
struct WatchContext {
    core: Arc<AgentCore>,
    /// The registration as originally submitted, before any merge.
    registration: AddServiceRequest,
    cache_key: String,
    cancel: CancellationToken,
}

impl WatchContext {
    async fn run(self, mut rx: mpsc::Receiver<UpdateEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                return;
            };
            if let Err(e) = self.handle_update(event).await {
                error!(
                    service_id = %self.registration.service.id,
                    error = %e,
                    "failed to handle service config update"
                );
            }
        }
    }

    async fn handle_update(&self, event: UpdateEvent) -> AgentResult<()> {
        let defaults = event.result?;
        if event.correlation_id != self.cache_key {
            debug!(
                service_id = %self.registration.service.id,
                correlation_id = %event.correlation_id,
                "discarding update for a stale watch"
            );
            return Ok(());
        }

        let merged = merge_service_config(Some(&defaults), &self.registration.service);

        let mut registry = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            guard = self.core.registry.lock() => guard,
        };
        // Removal may have won the race for the lock.
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        debug!(
            service_id = %self.registration.service.id,
            index = defaults.index,
            "re-registering service with updated central config"
        );
        self.core
            .add_service_locked(
                &mut registry,
                Registration {
                    service: merged,
                    checks: self.registration.checks.clone(),
                    persist: self.registration.persist,
                    persist_defaults: Some(defaults),
                    token: self.registration.token.clone(),
                    replace_existing_checks: self.registration.replace_existing_checks,
                    source: self.registration.source,
                },
            )
            .await
    }
}
