//! LocalState: the agent's view of what is registered on this node.
//!
//! # Architecture
//!
//! ```text
//!   check engines ──update_check──┐
//!   agent API ──add/remove───────►│ LocalState (one mutex) │──dirty sets──► anti-entropy
//!   snapshot/restore ─────────────┘            │
//!                                              └──sync_notify──► waiting syncer
//! ```
//!
//! Every entry carries an `in_sync` flag that any change clears. Once a
//! syncer is attached, removals are tombstoned (`deleted`) until it
//! acknowledges them; without one they are dropped immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;
use tracing::debug;

use vigil_core::{
    CheckId, CheckNotifier, ConfigSource, HealthCheck, HealthStatus, ServiceDefinition, ServiceId,
};

use crate::error::{StateError, StateResult};

/// A registered service and its sync bookkeeping.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub service: ServiceDefinition,
    pub token: String,
    pub source: ConfigSource,
    pub in_sync: bool,
    pub deleted: bool,
}

/// A registered check and its sync bookkeeping.
#[derive(Debug, Clone)]
pub struct CheckState {
    pub check: HealthCheck,
    pub token: String,
    pub source: ConfigSource,
    pub updated_at: SystemTime,
    /// When the check last turned critical; `None` while not critical.
    pub critical_since: Option<Instant>,
    pub in_sync: bool,
    pub deleted: bool,
}

/// Latest result of a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRunState {
    pub status: HealthStatus,
    pub output: String,
    /// Unix epoch milliseconds of the last result.
    pub updated_at: u64,
    pub critical_since: Option<Instant>,
}

/// A critical check and how long it has been critical.
#[derive(Debug, Clone)]
pub struct CriticalCheck {
    pub check: HealthCheck,
    pub critical_for: Duration,
}

#[derive(Default)]
struct Inner {
    services: HashMap<ServiceId, ServiceState>,
    checks: HashMap<CheckId, CheckState>,
    metadata: HashMap<String, String>,
}

#[derive(Default)]
pub struct LocalState {
    inner: Mutex<Inner>,
    discard_check_output: AtomicBool,
    syncer_attached: AtomicBool,
    sync_notify: Notify,
}

impl LocalState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn changed(&self) {
        self.sync_notify.notify_one();
    }

    /// Drop check output on every write; only status is kept.
    pub fn set_discard_check_output(&self, discard: bool) {
        self.discard_check_output.store(discard, Ordering::Relaxed);
    }

    /// Keep removed entries as tombstones until `mark_*_synced` sees them.
    pub fn attach_syncer(&self) {
        self.syncer_attached.store(true, Ordering::Relaxed);
    }

    fn keeps_tombstones(&self) -> bool {
        self.syncer_attached.load(Ordering::Relaxed)
    }

    /// Signalled whenever something needs to be pushed to the servers.
    pub fn sync_notify(&self) -> &Notify {
        &self.sync_notify
    }

    // ── Services ───────────────────────────────────────────────────

    pub fn add_service(
        &self,
        service: ServiceDefinition,
        token: &str,
        source: ConfigSource,
    ) -> StateResult<()> {
        if service.id.is_empty() {
            return Err(StateError::MissingServiceId);
        }
        debug!(service_id = %service.id, "service added to local state");
        self.lock().services.insert(
            service.id.clone(),
            ServiceState {
                service,
                token: token.to_string(),
                source,
                in_sync: false,
                deleted: false,
            },
        );
        self.changed();
        Ok(())
    }

    pub fn remove_service(&self, id: &str) -> StateResult<()> {
        {
            let mut inner = self.lock();
            if !inner.services.get(id).is_some_and(|s| !s.deleted) {
                return Err(StateError::ServiceNotFound(id.to_string()));
            }
            if !self.keeps_tombstones() {
                inner.services.remove(id);
            } else if let Some(s) = inner.services.get_mut(id) {
                s.deleted = true;
                s.in_sync = false;
            }
        }
        debug!(service_id = %id, "service removed from local state");
        self.changed();
        Ok(())
    }

    pub fn service(&self, id: &str) -> Option<ServiceDefinition> {
        self.lock()
            .services
            .get(id)
            .filter(|s| !s.deleted)
            .map(|s| s.service.clone())
    }

    pub fn service_state(&self, id: &str) -> Option<ServiceState> {
        self.lock().services.get(id).filter(|s| !s.deleted).cloned()
    }

    pub fn service_exists(&self, id: &str) -> bool {
        self.lock().services.get(id).is_some_and(|s| !s.deleted)
    }

    pub fn services(&self) -> HashMap<ServiceId, ServiceDefinition> {
        self.lock()
            .services
            .iter()
            .filter(|(_, s)| !s.deleted)
            .map(|(id, s)| (id.clone(), s.service.clone()))
            .collect()
    }

    /// Token the service was registered with; empty when unknown.
    pub fn service_token(&self, id: &str) -> String {
        self.lock()
            .services
            .get(id)
            .map(|s| s.token.clone())
            .unwrap_or_default()
    }

    // ── Checks ─────────────────────────────────────────────────────

    /// Register a check. A check bound to a service requires that service
    /// to be registered; its name is copied onto the check.
    pub fn add_check(&self, mut check: HealthCheck, token: &str, source: ConfigSource) -> StateResult<()> {
        if check.check_id.is_empty() {
            return Err(StateError::MissingCheckId);
        }
        if self.discard_check_output.load(Ordering::Relaxed) {
            check.output.clear();
        }

        {
            let mut inner = self.lock();
            if let Some(service_id) = check.service_id.as_deref() {
                match inner.services.get(service_id).filter(|s| !s.deleted) {
                    Some(s) => check.service_name = s.service.service.clone(),
                    None => return Err(StateError::ServiceNotFound(service_id.to_string())),
                }
            }

            let critical_since = (check.status == HealthStatus::Critical).then(Instant::now);
            debug!(check_id = %check.check_id, status = %check.status, "check added to local state");
            inner.checks.insert(
                check.check_id.clone(),
                CheckState {
                    check,
                    token: token.to_string(),
                    source,
                    updated_at: SystemTime::now(),
                    critical_since,
                    in_sync: false,
                    deleted: false,
                },
            );
        }
        self.changed();
        Ok(())
    }

    pub fn remove_check(&self, id: &str) -> StateResult<()> {
        {
            let mut inner = self.lock();
            if !inner.checks.get(id).is_some_and(|c| !c.deleted) {
                return Err(StateError::CheckNotFound(id.to_string()));
            }
            if !self.keeps_tombstones() {
                inner.checks.remove(id);
            } else if let Some(c) = inner.checks.get_mut(id) {
                c.deleted = true;
                c.in_sync = false;
            }
        }
        debug!(check_id = %id, "check removed from local state");
        self.changed();
        Ok(())
    }

    /// Record a check result. Unknown or removed checks are ignored.
    pub fn update_check(&self, id: &str, status: HealthStatus, output: &str) {
        let output = if self.discard_check_output.load(Ordering::Relaxed) {
            ""
        } else {
            output
        };

        let dirty = {
            let mut inner = self.lock();
            let Some(c) = inner.checks.get_mut(id).filter(|c| !c.deleted) else {
                return;
            };

            c.updated_at = SystemTime::now();
            if status == HealthStatus::Critical {
                c.critical_since.get_or_insert_with(Instant::now);
            } else {
                c.critical_since = None;
            }

            if c.check.status == status && c.check.output == output {
                false
            } else {
                debug!(check_id = %id, from = %c.check.status, to = %status, "check result changed");
                c.check.status = status;
                c.check.output = output.to_string();
                c.in_sync = false;
                true
            }
        };
        if dirty {
            self.changed();
        }
    }

    pub fn check(&self, id: &str) -> Option<HealthCheck> {
        self.lock()
            .checks
            .get(id)
            .filter(|c| !c.deleted)
            .map(|c| c.check.clone())
    }

    pub fn check_exists(&self, id: &str) -> bool {
        self.lock().checks.get(id).is_some_and(|c| !c.deleted)
    }

    pub fn checks(&self) -> HashMap<CheckId, HealthCheck> {
        self.lock()
            .checks
            .iter()
            .filter(|(_, c)| !c.deleted)
            .map(|(id, c)| (id.clone(), c.check.clone()))
            .collect()
    }

    pub fn check_state(&self, id: &str) -> Option<CheckRunState> {
        self.lock().checks.get(id).filter(|c| !c.deleted).map(|c| CheckRunState {
            status: c.check.status,
            output: c.check.output.clone(),
            updated_at: c
                .updated_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            critical_since: c.critical_since,
        })
    }

    pub fn checks_for_service(&self, service_id: &str) -> Vec<HealthCheck> {
        self.lock()
            .checks
            .values()
            .filter(|c| !c.deleted && c.check.service_id.as_deref() == Some(service_id))
            .map(|c| c.check.clone())
            .collect()
    }

    /// Currently critical checks with the time spent critical.
    pub fn critical_checks(&self) -> HashMap<CheckId, CriticalCheck> {
        let now = Instant::now();
        self.lock()
            .checks
            .iter()
            .filter(|(_, c)| !c.deleted)
            .filter_map(|(id, c)| {
                c.critical_since.map(|since| {
                    (
                        id.clone(),
                        CriticalCheck {
                            check: c.check.clone(),
                            critical_for: now.saturating_duration_since(since),
                        },
                    )
                })
            })
            .collect()
    }

    pub fn check_token(&self, id: &str) -> String {
        self.lock()
            .checks
            .get(id)
            .map(|c| c.token.clone())
            .unwrap_or_default()
    }

    // ── Node metadata ──────────────────────────────────────────────

    pub fn metadata(&self) -> HashMap<String, String> {
        self.lock().metadata.clone()
    }

    pub fn load_metadata(&self, meta: &HashMap<String, String>) {
        self.lock().metadata.extend(meta.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.changed();
    }

    pub fn unload_metadata(&self) {
        self.lock().metadata.clear();
    }

    // ── Anti-entropy hooks ─────────────────────────────────────────

    /// Services (including removed ones) not yet pushed to the servers.
    pub fn dirty_services(&self) -> Vec<ServiceId> {
        self.lock()
            .services
            .iter()
            .filter(|(_, s)| !s.in_sync)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn dirty_checks(&self) -> Vec<CheckId> {
        self.lock()
            .checks
            .iter()
            .filter(|(_, c)| !c.in_sync)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Acknowledge a pushed service; a removed one is forgotten.
    pub fn mark_service_synced(&self, id: &str) {
        let mut inner = self.lock();
        let tombstone = match inner.services.get_mut(id) {
            Some(s) if s.deleted => true,
            Some(s) => {
                s.in_sync = true;
                false
            }
            None => false,
        };
        if tombstone {
            inner.services.remove(id);
        }
    }

    pub fn mark_check_synced(&self, id: &str) {
        let mut inner = self.lock();
        let tombstone = match inner.checks.get_mut(id) {
            Some(c) if c.deleted => true,
            Some(c) => {
                c.in_sync = true;
                false
            }
            None => false,
        };
        if tombstone {
            inner.checks.remove(id);
        }
    }
}

impl CheckNotifier for LocalState {
    fn update_check(&self, check_id: &str, status: HealthStatus, output: &str) {
        LocalState::update_check(self, check_id, status, output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_web() -> LocalState {
        let state = LocalState::new();
        state
            .add_service(ServiceDefinition::new("web"), "tok", ConfigSource::Local)
            .unwrap();
        state
    }

    fn web_check(id: &str) -> HealthCheck {
        HealthCheck {
            check_id: id.to_string(),
            name: id.to_string(),
            service_id: Some("web".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn add_and_remove_service() {
        let state = state_with_web();
        assert!(state.service_exists("web"));
        assert_eq!(state.service_token("web"), "tok");

        state.remove_service("web").unwrap();
        assert!(!state.service_exists("web"));
        assert!(state.services().is_empty());
        assert_eq!(
            state.remove_service("web"),
            Err(StateError::ServiceNotFound("web".to_string()))
        );
    }

    #[test]
    fn check_requires_known_service() {
        let state = LocalState::new();
        let err = state
            .add_check(web_check("c1"), "", ConfigSource::Local)
            .unwrap_err();
        assert_eq!(err, StateError::ServiceNotFound("web".to_string()));
        assert!(err.to_string().contains("service does not exist"));
    }

    #[test]
    fn check_copies_service_name() {
        let state = state_with_web();
        state.add_check(web_check("c1"), "", ConfigSource::Local).unwrap();
        assert_eq!(state.check("c1").unwrap().service_name, "web");
        assert_eq!(state.checks_for_service("web").len(), 1);
    }

    #[test]
    fn update_tracks_changes_and_critical_time() {
        let state = state_with_web();
        state.add_check(web_check("c1"), "", ConfigSource::Local).unwrap();
        assert!(state.critical_checks().contains_key("c1"));

        state.mark_check_synced("c1");
        assert!(state.dirty_checks().is_empty());

        // Same status and output: heartbeat only.
        state.update_check("c1", HealthStatus::Critical, "");
        assert!(state.dirty_checks().is_empty());

        state.update_check("c1", HealthStatus::Passing, "ok");
        assert_eq!(state.dirty_checks(), vec!["c1".to_string()]);
        assert!(state.critical_checks().is_empty());

        let run = state.check_state("c1").unwrap();
        assert_eq!(run.status, HealthStatus::Passing);
        assert_eq!(run.output, "ok");
        assert!(run.updated_at > 0);
        assert!(run.critical_since.is_none());
    }

    #[test]
    fn update_of_unknown_check_is_ignored() {
        let state = LocalState::new();
        state.update_check("ghost", HealthStatus::Passing, "");
        assert!(state.check("ghost").is_none());
    }

    #[test]
    fn discard_output_clears_on_write() {
        let state = state_with_web();
        state.set_discard_check_output(true);
        let mut check = web_check("c1");
        check.output = "noise".to_string();
        state.add_check(check, "", ConfigSource::Local).unwrap();
        state.update_check("c1", HealthStatus::Passing, "more noise");
        assert_eq!(state.check("c1").unwrap().output, "");
    }

    #[test]
    fn synced_tombstones_are_dropped() {
        let state = state_with_web();
        state.attach_syncer();
        state.add_check(web_check("c1"), "", ConfigSource::Local).unwrap();
        state.remove_check("c1").unwrap();
        assert_eq!(state.dirty_checks(), vec!["c1".to_string()]);
        assert!(!state.check_exists("c1"));

        state.mark_check_synced("c1");
        assert!(state.dirty_checks().is_empty());

        state.remove_service("web").unwrap();
        state.mark_service_synced("web");
        assert!(state.dirty_services().is_empty());
    }

    #[test]
    fn removals_without_syncer_leave_nothing_behind() {
        let state = state_with_web();
        for i in 0..100 {
            let id = format!("c{i}");
            state.add_check(web_check(&id), "", ConfigSource::Local).unwrap();
            state.remove_check(&id).unwrap();
        }
        state.remove_service("web").unwrap();

        assert!(state.dirty_checks().is_empty());
        assert!(state.dirty_services().is_empty());
        assert!(state.lock().checks.is_empty());
        assert!(state.lock().services.is_empty());
        assert_eq!(
            state.remove_check("c0"),
            Err(StateError::CheckNotFound("c0".to_string()))
        );
    }

    #[test]
    fn metadata_load_and_unload() {
        let state = LocalState::new();
        let meta = HashMap::from([("rack".to_string(), "r1".to_string())]);
        state.load_metadata(&meta);
        assert_eq!(state.metadata()["rack"], "r1");
        state.unload_metadata();
        assert!(state.metadata().is_empty());
    }

    #[tokio::test]
    async fn changes_signal_syncer() {
        let state = state_with_web();
        // The registration above left a permit.
        tokio::time::timeout(Duration::from_secs(1), state.sync_notify().notified())
            .await
            .unwrap();
    }
}
