//! Persistence: file-per-entity storage under the agent data directory.
//!
//! Every durable write goes through [`write_file_atomic`]: a temp file in
//! the target directory, fsync, then rename over the target. A crash leaves
//! either the old file or the new one, plus at most a stray `*.tmp` file
//! that the directory scans ignore.
//!
//! # Layout
//!
//! ```text
//!   <data_dir>/
//!     services/<hash>            PersistedService
//!     services/configs/<hash>    PersistedServiceConfig
//!     checks/<hash>              PersistedCheck
//!     checks/state/<hash>        PersistedCheckState
//!     acl-tokens.json            PersistedTokens
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};
use vigil_core::{
    CheckType, ConfigSource, HealthCheck, HealthStatus, ServiceConfigResponse, ServiceDefinition,
    stable_hash,
};
use walkdir::WalkDir;

use crate::error::{PersistError, PersistResult};
use crate::records::*;

pub const SERVICES_DIR: &str = "services";
pub const SERVICE_CONFIG_DIR: &str = "configs";
pub const CHECKS_DIR: &str = "checks";
pub const CHECK_STATE_DIR: &str = "state";
pub const TOKENS_FILE: &str = "acl-tokens.json";

/// Handle on the data directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Persistence {
    data_dir: PathBuf,
}

impl Persistence {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn services_dir(&self) -> PathBuf {
        self.data_dir.join(SERVICES_DIR)
    }

    fn service_configs_dir(&self) -> PathBuf {
        self.services_dir().join(SERVICE_CONFIG_DIR)
    }

    fn checks_dir(&self) -> PathBuf {
        self.data_dir.join(CHECKS_DIR)
    }

    fn check_state_dir(&self) -> PathBuf {
        self.checks_dir().join(CHECK_STATE_DIR)
    }

    fn tokens_path(&self) -> PathBuf {
        self.data_dir.join(TOKENS_FILE)
    }

    // ── Services ───────────────────────────────────────────────────

    pub fn persist_service(
        &self,
        service: &ServiceDefinition,
        token: &str,
        source: ConfigSource,
    ) -> PersistResult<()> {
        let record = PersistedService {
            token: token.to_string(),
            service: service.clone(),
            source,
        };
        let path = self.services_dir().join(stable_hash(&service.id));
        write_file_atomic(&path, &encode(&record)?)?;
        debug!(service_id = %service.id, "service persisted");
        Ok(())
    }

    pub fn purge_service(&self, service_id: &str) -> PersistResult<()> {
        remove_if_exists(&self.services_dir().join(stable_hash(service_id)))
    }

    /// All persisted services. Files in the older bare-definition format
    /// load with an empty token and a local source.
    pub fn read_persisted_services(&self) -> PersistResult<Vec<PersistedService>> {
        scan_dir(&self.services_dir(), |buf| {
            if let Ok(record) = serde_json::from_slice::<PersistedService>(buf) {
                return Ok(record);
            }
            let service: ServiceDefinition =
                serde_json::from_slice(buf).map_err(|e| e.to_string())?;
            if service.service.is_empty() {
                return Err("not a service definition".to_string());
            }
            Ok(PersistedService {
                token: String::new(),
                service,
                source: ConfigSource::Local,
            })
        })
    }

    pub fn persist_service_config(
        &self,
        service_id: &str,
        defaults: &ServiceConfigResponse,
    ) -> PersistResult<()> {
        let record = PersistedServiceConfig {
            service_id: service_id.to_string(),
            defaults: defaults.clone(),
        };
        let path = self.service_configs_dir().join(stable_hash(service_id));
        write_file_atomic(&path, &encode(&record)?)
    }

    pub fn purge_service_config(&self, service_id: &str) -> PersistResult<()> {
        remove_if_exists(&self.service_configs_dir().join(stable_hash(service_id)))
    }

    pub fn read_persisted_service_configs(&self) -> PersistResult<Vec<PersistedServiceConfig>> {
        scan_dir(&self.service_configs_dir(), decode_json)
    }

    // ── Checks ─────────────────────────────────────────────────────

    pub fn persist_check(
        &self,
        check: &HealthCheck,
        chk_type: Option<&CheckType>,
        token: &str,
        source: ConfigSource,
    ) -> PersistResult<()> {
        let record = PersistedCheck {
            check: check.clone(),
            chk_type: chk_type.cloned(),
            token: token.to_string(),
            source,
        };
        let path = self.checks_dir().join(stable_hash(&check.check_id));
        write_file_atomic(&path, &encode(&record)?)?;
        debug!(check_id = %check.check_id, "check persisted");
        Ok(())
    }

    pub fn purge_check(&self, check_id: &str) -> PersistResult<()> {
        remove_if_exists(&self.checks_dir().join(stable_hash(check_id)))
    }

    pub fn read_persisted_checks(&self) -> PersistResult<Vec<PersistedCheck>> {
        scan_dir(&self.checks_dir(), decode_json)
    }

    // ── Check state ────────────────────────────────────────────────

    /// Record the last TTL status so it survives a restart for up to `ttl`.
    ///
    /// Written with a plain temp file and rename, without fsync.
    pub fn persist_check_state(
        &self,
        check_id: &str,
        status: HealthStatus,
        output: &str,
        ttl: Duration,
    ) -> PersistResult<()> {
        let record = PersistedCheckState {
            check_id: check_id.to_string(),
            output: output.to_string(),
            status,
            expires: SystemTime::now()
                .checked_add(ttl)
                .map_or(i64::MAX, unix_millis),
        };
        let dir = self.check_state_dir();
        create_private_dir(&dir)?;

        let path = dir.join(stable_hash(check_id));
        let tmp = tmp_sibling(&path);
        fs::write(&tmp, encode(&record)?).map_err(|source| PersistError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| PersistError::Write {
            path: path.clone(),
            source,
        })
    }

    /// Load a saved TTL status. Expired or unreadable state is purged and
    /// reported as absent.
    pub fn load_check_state(&self, check_id: &str) -> PersistResult<Option<PersistedCheckState>> {
        let path = self.check_state_dir().join(stable_hash(check_id));
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistError::Read { path, source }),
        };

        let state: PersistedCheckState = match serde_json::from_slice(&buf) {
            Ok(state) => state,
            Err(e) => {
                warn!(%check_id, error = %e, "purging corrupt check state");
                self.purge_check_state(check_id)?;
                return Ok(None);
            }
        };

        if unix_millis(SystemTime::now()) >= state.expires {
            debug!(%check_id, "check state expired");
            self.purge_check_state(check_id)?;
            return Ok(None);
        }
        Ok(Some(state))
    }

    pub fn purge_check_state(&self, check_id: &str) -> PersistResult<()> {
        remove_if_exists(&self.check_state_dir().join(stable_hash(check_id)))
    }

    // ── Tokens ─────────────────────────────────────────────────────

    pub fn persist_tokens(&self, tokens: &PersistedTokens) -> PersistResult<()> {
        write_file_atomic(&self.tokens_path(), &encode(tokens)?)
    }

    /// `Ok(None)` when no token file has been written yet.
    pub fn load_tokens(&self) -> PersistResult<Option<PersistedTokens>> {
        let path = self.tokens_path();
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistError::Read { path, source }),
        };
        serde_json::from_slice(&buf)
            .map(Some)
            .map_err(|e| PersistError::Decode {
                path,
                msg: e.to_string(),
            })
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Replace `path` with `data` so readers see the old or the new content,
/// never a partial write.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> PersistResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    create_private_dir(dir)?;

    let write_err = |source| PersistError::Write {
        path: path.to_path_buf(),
        source,
    };
    let prefix = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(data).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

fn create_private_dir(dir: &Path) -> PersistResult<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|source| PersistError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

fn remove_if_exists(path: &Path) -> PersistResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PersistError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn encode<T: Serialize>(value: &T) -> PersistResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| PersistError::Serialize(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(buf: &[u8]) -> Result<T, String> {
    serde_json::from_slice(buf).map_err(|e| e.to_string())
}

/// Decode every regular file directly under `dir`. Subdirectories and
/// leftover temp files are skipped; undecodable files are logged and skipped.
fn scan_dir<T>(
    dir: &Path,
    decode: impl Fn(&[u8]) -> Result<T, String>,
) -> PersistResult<Vec<T>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_dir() || entry.file_name().to_string_lossy().ends_with("tmp") {
            continue;
        }

        let path = entry.path();
        let buf = fs::read(path).map_err(|source| PersistError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        match decode(&buf) {
            Ok(record) => out.push(record),
            Err(msg) => error!(file = %path.display(), error = %msg, "failed decoding persisted file"),
        }
    }
    Ok(out)
}

fn unix_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
