//! Agent: owns local state, running checks, persistence, and the
//! service manager.
//!
//! # Architecture
//!
//! ```text
//!   Agent (public API)
//!     ├── ServiceManager ── watch tasks ──┐
//!     └── Arc<AgentCore>                  │
//!           ├── registry: Mutex<CheckRegistry>   (the registration lock)
//!           ├── LocalState  ◄── check engines report here
//!           ├── Persistence (absent in dev mode)
//!           └── TokenStore
//! ```
//!
//! Every registration and removal runs with the registration lock held, so
//! the running engines always match what is in local state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex, RwLock, Weak};
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_checks::{Check, ExecClient, MIN_INTERVAL, TtlCheck};
use vigil_core::duration::format_duration;
use vigil_core::{
    AgentConfig, CheckDefinition, CheckId, CheckNotifier, CheckType, ConfigSource, HealthCheck,
    HealthStatus, NODE_MAINT_CHECK_ID, SERVICE_MAINT_PREFIX, ServiceConfigResponse,
    ServiceDefinition, ServiceId, ValidationError,
};
use vigil_persist::Persistence;
use vigil_state::{LocalState, StateError};

use crate::cache::ConfigCache;
use crate::engines::{Engine, build_engine};
use crate::error::{AgentError, AgentResult};
use crate::service_manager::{AddServiceRequest, ServiceManager};
use crate::tokens::TokenStore;

const SERVICE_MAINT_NAME: &str = "Service Maintenance Mode";
const NODE_MAINT_NAME: &str = "Node Maintenance Mode";
const DEFAULT_SERVICE_MAINT_REASON: &str = "Maintenance mode is enabled for this service, but no reason was provided. This is a default message.";
const DEFAULT_NODE_MAINT_REASON: &str = "Maintenance mode is enabled for this node, but no reason was provided. This is a default message.";

static DNS_LABEL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9-]+$").ok());

/// ID of the maintenance check for `service_id`.
pub fn service_maint_check_id(service_id: &str) -> CheckId {
    format!("{SERVICE_MAINT_PREFIX}{service_id}")
}

/// Running engines, guarded by the registration lock.
#[derive(Default)]
pub(crate) struct CheckRegistry {
    checks: HashMap<CheckId, Arc<dyn Check>>,
    ttl_checks: HashMap<CheckId, Arc<TtlCheck>>,
    /// How long a check may stay critical before its service is reaped.
    reap_after: HashMap<CheckId, Duration>,
}

/// A merged registration ready to be applied.
pub(crate) struct Registration {
    pub service: ServiceDefinition,
    pub checks: Vec<CheckDefinition>,
    pub persist: bool,
    /// Central defaults to write next to the service, if any.
    pub persist_defaults: Option<ServiceConfigResponse>,
    pub token: String,
    pub replace_existing_checks: bool,
    pub source: ConfigSource,
}

/// A single check ready to be applied.
pub(crate) struct CheckRegistration<'a> {
    pub check: HealthCheck,
    pub check_type: Option<CheckType>,
    pub persist: bool,
    pub token: &'a str,
    pub source: ConfigSource,
    /// Carry over status and output from an existing check with this ID.
    pub keep_status: bool,
}

impl<'a> CheckRegistration<'a> {
    fn new(check: HealthCheck, check_type: Option<CheckType>, token: &'a str) -> Self {
        Self {
            check,
            check_type,
            persist: true,
            token,
            source: ConfigSource::Local,
            keep_status: false,
        }
    }
}

/// Raise a sub-minimum probe interval before anything is validated
/// against it.
fn raise_interval(check_id: &str, ct: &mut CheckType) {
    if ct.is_ttl() {
        return;
    }
    if let Some(interval) = ct.interval.filter(|i| *i < MIN_INTERVAL) {
        warn!(
            %check_id,
            interval = %format_duration(interval),
            minimum = %format_duration(MIN_INTERVAL),
            "check interval below minimum, raising it"
        );
        ct.interval = Some(MIN_INTERVAL);
    }
}

/// The part of the agent shared with watch tasks.
pub(crate) struct AgentCore {
    config: RwLock<Arc<AgentConfig>>,
    pub(crate) state: Arc<LocalState>,
    persistence: Option<Persistence>,
    pub(crate) tokens: Arc<TokenStore>,
    pub(crate) registry: tokio::sync::Mutex<CheckRegistry>,
    exec_client: Option<Arc<dyn ExecClient>>,
}

impl AgentCore {
    pub(crate) fn config(&self) -> Arc<AgentConfig> {
        match self.config.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn set_config(&self, config: AgentConfig) {
        let mut guard = match self.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(config);
    }

    fn notifier(&self) -> Arc<dyn CheckNotifier> {
        Arc::clone(&self.state) as Arc<dyn CheckNotifier>
    }

    /// Apply a registration: the service, then each of its checks with the
    /// status it had before, then persistence.
    pub(crate) async fn add_service_locked(
        &self,
        registry: &mut CheckRegistry,
        reg: Registration,
    ) -> AgentResult<()> {
        let mut service = reg.service;
        service.normalize()?;
        warn_dns(&service);

        let total = reg.checks.len();
        let mut checks = Vec::with_capacity(total);
        for (i, mut def) in reg.checks.into_iter().enumerate() {
            if def.id.is_empty() {
                def.id = if total == 1 {
                    format!("service:{}", service.id)
                } else {
                    format!("service:{}:{}", service.id, i + 1)
                };
            }
            if def.name.is_empty() {
                def.name = format!("Service '{}' check", service.service);
            }
            def.service_id = Some(service.id.clone());
            if let Some(ct) = def.check_type.as_mut() {
                raise_interval(&def.id, ct);
                ct.validate()?;
                build_engine(&def.id, ct, self.notifier(), self.exec_client.as_ref())?;
            }
            checks.push(def);
        }

        let existing: Vec<CheckId> = self
            .state
            .checks_for_service(&service.id)
            .into_iter()
            .map(|c| c.check_id)
            .filter(|id| !id.starts_with(SERVICE_MAINT_PREFIX))
            .collect();

        self.state.add_service(service.clone(), &reg.token, reg.source)?;
        if let Some(persistence) = &self.persistence {
            if reg.persist {
                persistence.persist_service(&service, &reg.token, reg.source)?;
            }
            if let Some(defaults) = &reg.persist_defaults {
                persistence.persist_service_config(&service.id, defaults)?;
            }
        }

        let mut registered = HashSet::with_capacity(checks.len());
        for def in checks {
            let check = def.health_check();
            registered.insert(check.check_id.clone());
            self.add_check_locked(
                registry,
                CheckRegistration {
                    check,
                    check_type: def.check_type,
                    persist: reg.persist,
                    token: &reg.token,
                    source: reg.source,
                    keep_status: true,
                },
            )
            .await?;
        }

        if reg.replace_existing_checks {
            for id in existing.iter().filter(|id| !registered.contains(*id)) {
                self.remove_check_locked(registry, id, reg.persist).await?;
            }
        }

        info!(service_id = %service.id, checks = registered.len(), "synced service");
        Ok(())
    }

    pub(crate) async fn add_check_locked(
        &self,
        registry: &mut CheckRegistry,
        reg: CheckRegistration<'_>,
    ) -> AgentResult<()> {
        let CheckRegistration {
            mut check,
            mut check_type,
            persist,
            token,
            source,
            keep_status,
        } = reg;
        if check.check_id.is_empty() {
            return Err(ValidationError::MissingCheckId.into());
        }
        if let Some(ct) = check_type.as_mut() {
            raise_interval(&check.check_id, ct);
            ct.validate()?;
        }
        if let Some(service_id) = check.service_id.as_deref() {
            if !self.state.service_exists(service_id) {
                return Err(StateError::ServiceNotFound(service_id.to_string()).into());
            }
        }

        let engine = match &check_type {
            Some(ct) => Some(build_engine(
                &check.check_id,
                ct,
                self.notifier(),
                self.exec_client.as_ref(),
            )?),
            None => None,
        };

        stop_engine(registry, &check.check_id).await;

        // Read after the old engine is gone so its last result is kept.
        if keep_status {
            if let Some(prev) = self.state.check(&check.check_id) {
                check.status = prev.status;
                check.output = prev.output;
            }
        }

        // The engine's first result must find the check registered.
        self.state.add_check(check.clone(), token, source)?;

        match engine {
            Some(Engine::Ttl(ttl)) => {
                ttl.start();
                self.restore_ttl_state(&ttl);
                registry
                    .ttl_checks
                    .insert(check.check_id.clone(), Arc::clone(&ttl));
                registry.checks.insert(check.check_id.clone(), ttl);
            }
            Some(engine @ Engine::Interval(_)) => {
                let running = engine.check();
                running.start();
                registry.checks.insert(check.check_id.clone(), running);
            }
            None => {}
        }

        match check_type
            .as_ref()
            .and_then(|ct| ct.deregister_critical_service_after)
        {
            Some(after) => {
                let min = self.config().check_deregister_interval_min;
                let after = if after < min {
                    warn!(
                        check_id = %check.check_id,
                        minimum = %format_duration(min),
                        "deregister_critical_service_after below minimum, raising it"
                    );
                    min
                } else {
                    after
                };
                registry.reap_after.insert(check.check_id.clone(), after);
            }
            None => {
                registry.reap_after.remove(&check.check_id);
            }
        }

        if persist {
            if let Some(persistence) = &self.persistence {
                persistence.persist_check(&check, check_type.as_ref(), token, source)?;
            }
        }
        debug!(check_id = %check.check_id, "check registered");
        Ok(())
    }

    /// Apply a saved TTL status if it has not expired.
    fn restore_ttl_state(&self, ttl: &TtlCheck) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        match persistence.load_check_state(ttl.check_id()) {
            Ok(Some(saved)) => {
                debug!(check_id = %saved.check_id, status = %saved.status, "restored check state");
                ttl.set_status(saved.status, &saved.output);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(check_id = %ttl.check_id(), error = %e, "failed restoring check state");
            }
        }
    }

    pub(crate) async fn remove_check_locked(
        &self,
        registry: &mut CheckRegistry,
        check_id: &str,
        persist: bool,
    ) -> AgentResult<()> {
        if check_id.is_empty() {
            return Err(ValidationError::MissingCheckId.into());
        }
        self.state.remove_check(check_id)?;
        registry.reap_after.remove(check_id);
        stop_engine(registry, check_id).await;

        if persist {
            if let Some(persistence) = &self.persistence {
                persistence.purge_check(check_id)?;
                persistence.purge_check_state(check_id)?;
            }
        }
        debug!(%check_id, "check deregistered");
        Ok(())
    }

    pub(crate) async fn remove_service_locked(
        &self,
        registry: &mut CheckRegistry,
        service_id: &str,
        persist: bool,
    ) -> AgentResult<()> {
        if service_id.is_empty() {
            return Err(StateError::MissingServiceId.into());
        }
        let checks = self.state.checks_for_service(service_id);
        self.state.remove_service(service_id)?;

        if persist {
            if let Some(persistence) = &self.persistence {
                persistence.purge_service(service_id)?;
                persistence.purge_service_config(service_id)?;
            }
        }
        for check in checks {
            self.remove_check_locked(registry, &check.check_id, persist)
                .await?;
        }
        info!(%service_id, "service deregistered");
        Ok(())
    }
}

async fn stop_engine(registry: &mut CheckRegistry, check_id: &str) {
    registry.ttl_checks.remove(check_id);
    if let Some(running) = registry.checks.remove(check_id) {
        running.stop().await;
    }
}

/// Log names and tags that DNS lookups will not find.
fn warn_dns(service: &ServiceDefinition) {
    let Some(re) = DNS_LABEL.as_ref() else {
        return;
    };
    if !re.is_match(&service.service) {
        warn!(
            service = %service.service,
            "service name will not be discoverable via DNS due to invalid characters. \
             Valid characters include all alpha-numerics and dashes."
        );
    }
    for tag in service.tags.iter().filter(|t| !re.is_match(t)) {
        debug!(
            service = %service.service,
            %tag,
            "service tag will not be discoverable via DNS due to invalid characters"
        );
    }
}

pub struct Agent {
    core: Arc<AgentCore>,
    services: ServiceManager,
    reaper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Agent {
    /// Build an agent. Nothing runs until [`Agent::start`].
    ///
    /// Without an `exec_client`, container checks are rejected at
    /// registration.
    pub fn new(
        config: AgentConfig,
        cache: Arc<dyn ConfigCache>,
        exec_client: Option<Arc<dyn ExecClient>>,
    ) -> Arc<Self> {
        let persistence = (!config.dev_mode).then(|| Persistence::new(config.data_dir.clone()));
        let tokens = Arc::new(TokenStore::new(
            persistence.clone(),
            config.enable_token_persistence,
        ));
        Arc::new(Self {
            core: Arc::new(AgentCore {
                config: RwLock::new(Arc::new(config)),
                state: Arc::new(LocalState::new()),
                persistence,
                tokens,
                registry: tokio::sync::Mutex::new(CheckRegistry::default()),
                exec_client,
            }),
            services: ServiceManager::new(cache),
            reaper: Mutex::new(None),
        })
    }

    pub fn state(&self) -> &Arc<LocalState> {
        &self.core.state
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.core.tokens
    }

    pub fn config(&self) -> Arc<AgentConfig> {
        self.core.config()
    }

    pub fn service_manager(&self) -> &ServiceManager {
        &self.services
    }

    pub fn load_tokens(&self) -> AgentResult<()> {
        self.core.tokens.load_tokens(&self.config().tokens)?;
        Ok(())
    }

    // ── Services ───────────────────────────────────────────────────

    pub async fn add_service(&self, req: AddServiceRequest) -> AgentResult<()> {
        let mut registry = self.core.registry.lock().await;
        self.services
            .add_service(&self.core, &mut registry, req)
            .await
    }

    /// Deregister a service and all of its checks.
    pub async fn remove_service(&self, service_id: &str, persist: bool) -> AgentResult<()> {
        let mut registry = self.core.registry.lock().await;
        self.services.remove_service(service_id).await;
        self.core
            .remove_service_locked(&mut registry, service_id, persist)
            .await
    }

    // ── Checks ─────────────────────────────────────────────────────

    pub async fn add_check(
        &self,
        def: CheckDefinition,
        persist: bool,
        token: &str,
        source: ConfigSource,
    ) -> AgentResult<()> {
        let check = def.health_check();
        let mut registry = self.core.registry.lock().await;
        self.core
            .add_check_locked(
                &mut registry,
                CheckRegistration {
                    persist,
                    source,
                    ..CheckRegistration::new(check, def.check_type, token)
                },
            )
            .await
    }

    pub async fn remove_check(&self, check_id: &str, persist: bool) -> AgentResult<()> {
        let mut registry = self.core.registry.lock().await;
        self.core
            .remove_check_locked(&mut registry, check_id, persist)
            .await
    }

    /// Report a TTL check result and save it so it survives a restart.
    pub async fn update_ttl_check(
        &self,
        check_id: &str,
        status: HealthStatus,
        output: &str,
    ) -> AgentResult<()> {
        let registry = self.core.registry.lock().await;
        let Some(ttl) = registry.ttl_checks.get(check_id) else {
            return Err(AgentError::NoTtlCheck(check_id.to_string()));
        };
        let output = ttl.set_status(status, output);

        if let Some(persistence) = &self.core.persistence {
            persistence.persist_check_state(check_id, status, &output, ttl.ttl())?;
        }
        Ok(())
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Mark a service critical with a maintenance check. Already enabled
    /// is a no-op.
    pub async fn enable_service_maintenance(
        &self,
        service_id: &str,
        reason: &str,
        token: &str,
    ) -> AgentResult<()> {
        let Some(service) = self.core.state.service_state(service_id) else {
            return Err(AgentError::UnknownService(service_id.to_string()));
        };
        let check_id = service_maint_check_id(service_id);
        if self.core.state.check_exists(&check_id) {
            return Ok(());
        }

        let token = if token.is_empty() {
            service.token
        } else {
            token.to_string()
        };
        let check = HealthCheck {
            check_id,
            name: SERVICE_MAINT_NAME.to_string(),
            notes: non_empty_or(reason, DEFAULT_SERVICE_MAINT_REASON),
            service_id: Some(service_id.to_string()),
            status: HealthStatus::Critical,
            ..Default::default()
        };

        let mut registry = self.core.registry.lock().await;
        self.core
            .add_check_locked(&mut registry, CheckRegistration::new(check, None, &token))
            .await?;
        info!(%service_id, "service entered maintenance mode");
        Ok(())
    }

    pub async fn disable_service_maintenance(&self, service_id: &str) -> AgentResult<()> {
        if !self.core.state.service_exists(service_id) {
            return Err(AgentError::UnknownService(service_id.to_string()));
        }
        let check_id = service_maint_check_id(service_id);
        if !self.core.state.check_exists(&check_id) {
            return Ok(());
        }

        let mut registry = self.core.registry.lock().await;
        self.core
            .remove_check_locked(&mut registry, &check_id, true)
            .await?;
        info!(%service_id, "service left maintenance mode");
        Ok(())
    }

    pub async fn enable_node_maintenance(&self, reason: &str, token: &str) -> AgentResult<()> {
        if self.core.state.check_exists(NODE_MAINT_CHECK_ID) {
            return Ok(());
        }
        let check = HealthCheck {
            check_id: NODE_MAINT_CHECK_ID.to_string(),
            name: NODE_MAINT_NAME.to_string(),
            notes: non_empty_or(reason, DEFAULT_NODE_MAINT_REASON),
            status: HealthStatus::Critical,
            ..Default::default()
        };

        let mut registry = self.core.registry.lock().await;
        self.core
            .add_check_locked(&mut registry, CheckRegistration::new(check, None, token))
            .await?;
        info!("node entered maintenance mode");
        Ok(())
    }

    pub async fn disable_node_maintenance(&self) -> AgentResult<()> {
        if !self.core.state.check_exists(NODE_MAINT_CHECK_ID) {
            return Ok(());
        }
        let mut registry = self.core.registry.lock().await;
        self.core
            .remove_check_locked(&mut registry, NODE_MAINT_CHECK_ID, true)
            .await?;
        info!("node left maintenance mode");
        Ok(())
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Current result of every registered check.
    pub fn snapshot_check_state(&self) -> HashMap<CheckId, HealthCheck> {
        self.core.state.checks()
    }

    /// Put back status and output from a snapshot. Checks that no longer
    /// exist are skipped.
    pub fn restore_check_state(&self, snapshot: HashMap<CheckId, HealthCheck>) {
        for (id, check) in snapshot {
            self.core.state.update_check(&id, check.status, &check.output);
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Register configured and persisted services and checks, then start
    /// the critical service reaper.
    pub async fn start(self: &Arc<Self>) -> AgentResult<()> {
        let config = self.config();
        self.core.state.load_metadata(&config.node_meta);
        self.load_services(&config).await?;
        self.load_checks(&config).await?;
        self.start_reaper(config.check_reap_interval);
        info!(
            node = %config.node_name,
            services = self.core.state.services().len(),
            checks = self.core.state.checks().len(),
            "agent started"
        );
        Ok(())
    }

    /// Swap in a new configuration. Check results survive the reload.
    pub async fn reload(&self, config: AgentConfig) -> AgentResult<()> {
        let snapshot = self.snapshot_check_state();

        self.unload_checks().await?;
        self.unload_services().await?;
        self.core.state.unload_metadata();

        self.core.set_config(config);
        let config = self.config();
        self.core.state.load_metadata(&config.node_meta);
        self.load_services(&config).await?;
        self.load_checks(&config).await?;

        self.restore_check_state(snapshot);
        info!("agent configuration reloaded");
        Ok(())
    }

    /// Stop the reaper, every service watch, and every check engine.
    pub async fn shutdown(&self) {
        let reaper = match self.reaper.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((cancel, handle)) = reaper {
            cancel.cancel();
            let _ = handle.await;
        }

        // Watch tasks take the registration lock, so stop them first.
        self.services.stop().await;

        let mut registry = self.core.registry.lock().await;
        registry.ttl_checks.clear();
        registry.reap_after.clear();
        for (_, running) in registry.checks.drain() {
            running.stop().await;
        }
        info!("agent stopped");
    }

    async fn load_services(&self, config: &AgentConfig) -> AgentResult<()> {
        let mut persisted_configs: HashMap<ServiceId, ServiceConfigResponse> =
            match &self.core.persistence {
                Some(p) => p
                    .read_persisted_service_configs()?
                    .into_iter()
                    .map(|c| (c.service_id, c.defaults))
                    .collect(),
                None => HashMap::new(),
            };

        for sc in &config.services {
            let mut service = sc.service.clone();
            service.normalize()?;
            let previous_defaults = persisted_configs.get(&service.id).cloned();
            self.add_service(AddServiceRequest {
                service,
                checks: sc.checks.clone(),
                persist: false,
                token: sc.token.clone(),
                replace_existing_checks: false,
                source: ConfigSource::Local,
                wait_for_central_config: false,
                previous_defaults,
                persist_service_config: true,
            })
            .await?;
        }

        let Some(persistence) = &self.core.persistence else {
            return Ok(());
        };
        for record in persistence.read_persisted_services()? {
            let mut service = record.service;
            if let Err(e) = service.normalize() {
                warn!(error = %e, "skipping unusable persisted service");
                continue;
            }

            if self.core.state.service_exists(&service.id) {
                debug!(service_id = %service.id, "service exists, not restoring from file");
                persistence.purge_service(&service.id)?;
                persistence.purge_service_config(&service.id)?;
                persisted_configs.remove(&service.id);
                continue;
            }

            debug!(service_id = %service.id, "restored service definition from file");
            let previous_defaults = persisted_configs.remove(&service.id);
            self.add_service(AddServiceRequest {
                service,
                checks: Vec::new(),
                persist: false,
                token: record.token,
                replace_existing_checks: false,
                source: record.source,
                wait_for_central_config: false,
                previous_defaults,
                persist_service_config: true,
            })
            .await?;
        }

        for service_id in persisted_configs.keys() {
            if !self.core.state.service_exists(service_id) {
                debug!(%service_id, "purging service config for a service that no longer exists");
                persistence.purge_service_config(service_id)?;
            }
        }
        Ok(())
    }

    async fn load_checks(&self, config: &AgentConfig) -> AgentResult<()> {
        for cc in &config.checks {
            self.add_check(cc.check.clone(), false, &cc.token, ConfigSource::Local)
                .await?;
        }

        let Some(persistence) = &self.core.persistence else {
            return Ok(());
        };
        for record in persistence.read_persisted_checks()? {
            let check_id = record.check.check_id.clone();
            if self.core.state.check_exists(&check_id) {
                debug!(%check_id, "check exists, not restoring from file");
                persistence.purge_check(&check_id)?;
                continue;
            }

            // Restored checks are unhealthy until they report otherwise.
            let mut check = record.check;
            check.status = HealthStatus::Critical;

            let mut registry = self.core.registry.lock().await;
            let added = self
                .core
                .add_check_locked(
                    &mut registry,
                    CheckRegistration {
                        persist: false,
                        source: record.source,
                        ..CheckRegistration::new(check, record.chk_type, &record.token)
                    },
                )
                .await;
            if let Err(e) = added {
                warn!(%check_id, error = %e, "failed to restore check, purging it");
                persistence.purge_check(&check_id)?;
                continue;
            }
            debug!(%check_id, "restored health check from file");
        }
        Ok(())
    }

    async fn unload_services(&self) -> AgentResult<()> {
        let mut registry = self.core.registry.lock().await;
        for service_id in self.core.state.services().into_keys() {
            self.services.remove_service(&service_id).await;
            self.core
                .remove_service_locked(&mut registry, &service_id, false)
                .await?;
        }
        Ok(())
    }

    async fn unload_checks(&self) -> AgentResult<()> {
        let mut registry = self.core.registry.lock().await;
        for check_id in self.core.state.checks().into_keys() {
            self.core
                .remove_check_locked(&mut registry, &check_id, false)
                .await?;
        }
        Ok(())
    }

    // ── Reaper ─────────────────────────────────────────────────────

    fn start_reaper(self: &Arc<Self>, interval: Duration) {
        let mut slot = match self.reaper.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return;
        }

        let agent: Weak<Agent> = Arc::downgrade(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(agent) = agent.upgrade() else {
                    return;
                };
                agent.reap_services().await;
            }
        });
        *slot = Some((cancel, handle));
    }

    /// Deregister every service with a check that has been critical for
    /// longer than its `deregister_critical_service_after`.
    pub async fn reap_services(&self) {
        let reap_after = self.core.registry.lock().await.reap_after.clone();
        let mut reaped: HashSet<ServiceId> = HashSet::new();

        for (check_id, critical) in self.core.state.critical_checks() {
            let Some(service_id) = critical.check.service_id else {
                continue;
            };
            if reaped.contains(&service_id) {
                continue;
            }
            let Some(timeout) = reap_after.get(&check_id) else {
                continue;
            };
            if critical.critical_for <= *timeout {
                continue;
            }

            reaped.insert(service_id.clone());
            match self.remove_service(&service_id, true).await {
                Ok(()) => info!(
                    %check_id,
                    %service_id,
                    critical_for = %format_duration(critical.critical_for),
                    "check has been critical for too long; deregistered service"
                ),
                Err(e) => warn!(%service_id, error = %e, "failed to deregister critical service"),
            }
        }
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}
