//! Persistence for the state carried between runs.
//!
//! The engine assumes at most one run at a time. `version` gives a cheap
//! optimistic check for deployments where that does not hold: a save whose
//! expected version no longer matches is rejected instead of clobbering.

use crate::model::{AlarmState, DeviceState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceState>,
    #[serde(default)]
    pub alarms: BTreeMap<String, AlarmState>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("state store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state store is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("state store was modified concurrently (expected version {expected}, found {found})")]
    Conflict { expected: u64, found: u64 },
    #[error("state store was unreadable ({source}), moved aside to {}", .moved_to.display())]
    Quarantined { moved_to: PathBuf, source: serde_json::Error },
    #[error("{0}")]
    Unavailable(String),
}

impl StoreError {
    /// The unreadable data was moved out of the way; saving fresh state is safe.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Quarantined { .. })
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<StateSnapshot, StoreError>;

    /// Replace the stored snapshot. Fails with [`StoreError::Conflict`] when the
    /// stored version is not `expected_version`. Returns the new version.
    fn save(&self, snapshot: &StateSnapshot, expected_version: u64) -> Result<u64, StoreError>;
}

/// JSON file replaced atomically through a temp file and rename.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn quarantine(&self, source: serde_json::Error) -> StoreError {
        let mut aside = self.path.clone().into_os_string();
        aside.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ")));
        let aside = PathBuf::from(aside);
        if let Err(e) = fs::rename(&self.path, &aside) {
            tracing::error!("Failed to move unreadable state {} aside: {}", self.path.display(), e);
            return StoreError::Io(e);
        }
        tracing::error!(
            "State file {} is not valid JSON ({}), moved to {}",
            self.path.display(),
            source,
            aside.display()
        );
        StoreError::Quarantined { moved_to: aside, source }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<StateSnapshot, StoreError> {
        if !self.path.exists() {
            return Ok(StateSnapshot::default());
        }
        let content = fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|e| self.quarantine(e))
    }

    fn save(&self, snapshot: &StateSnapshot, expected_version: u64) -> Result<u64, StoreError> {
        let found = self.load()?.version;
        if found != expected_version {
            return Err(StoreError::Conflict { expected: expected_version, found });
        }

        let mut next = snapshot.clone();
        next.version = expected_version + 1;
        let content = serde_json::to_string_pretty(&next)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!("State saved to {} (version {})", self.path.display(), next.version);
        Ok(next.version)
    }
}

/// In-process store for embedding and tests.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<StateSnapshot>,
    fail_writes: Mutex<bool>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Make every following `save` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_writes.lock() {
            *flag = fail;
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<StateSnapshot, StoreError> {
        self.inner
            .lock()
            .map(|s| s.clone())
            .map_err(|_| StoreError::Unavailable("state lock poisoned".into()))
    }

    fn save(&self, snapshot: &StateSnapshot, expected_version: u64) -> Result<u64, StoreError> {
        if self.fail_writes.lock().map(|f| *f).unwrap_or(true) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Unavailable("state lock poisoned".into()))?;
        if inner.version != expected_version {
            return Err(StoreError::Conflict { expected: expected_version, found: inner.version });
        }
        *inner = snapshot.clone();
        inner.version = expected_version + 1;
        Ok(inner.version)
    }
}
