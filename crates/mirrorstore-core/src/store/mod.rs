//! The authoritative local record store.
//!
//! Holds exactly one record - the application state plus engine settings -
//! persisted as a JSON file. Every write goes through a same-directory
//! temporary file followed by an atomic rename, so a crash mid-write can
//! never leave a torn record behind. This store is the source of truth:
//! mirroring may fail entirely and a `save` here must still succeed.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised by the record store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("record store contains invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine settings persisted alongside the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Stable random identifier for this installation.
    pub device_id: String,
    /// Reference to the connected mirror file, if any.
    #[serde(default)]
    pub external_handle: Option<PathBuf>,
    /// Whether the mirror file is written encrypted.
    #[serde(default = "default_true")]
    pub mirror_encrypted: bool,
    /// When the most recent backup was written.
    #[serde(default)]
    pub last_backup: Option<DateTime<Utc>>,
    /// Record version captured by the most recent backup.
    #[serde(default)]
    pub last_backup_version: u64,
    /// Epoch milliseconds of the most recent backup; 0 means never.
    #[serde(default)]
    pub last_backup_ts: i64,
    /// Free-form options owned by the application layer.
    #[serde(default)]
    pub options: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Settings {
    fn for_new_device() -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().simple().to_string(),
            external_handle: None,
            mirror_encrypted: true,
            last_backup: None,
            last_backup_version: 0,
            last_backup_ts: 0,
            options: Map::new(),
        }
    }
}

/// The singleton record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    version: u64,
    last_modified: DateTime<Utc>,
    state: Value,
    settings: Settings,
}

/// A cloned, caller-owned view of the record's state.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: Value,
    pub version: u64,
    pub last_modified: DateTime<Utc>,
}

/// How a `save` changes the state.
///
/// `Merge` shallow-merges an object patch over the current state (falling
/// back to replacement when either side is not an object); `Replace` swaps
/// the state wholesale.
#[derive(Debug, Clone)]
pub enum StateUpdate {
    Merge(Value),
    Replace(Value),
}

/// Partial settings update; `None` fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct SettingsPatch {
    pub external_handle: Option<Option<PathBuf>>,
    pub mirror_encrypted: Option<bool>,
    pub last_backup: Option<Option<DateTime<Utc>>>,
    pub last_backup_version: Option<u64>,
    pub last_backup_ts: Option<i64>,
    pub options: Option<Map<String, Value>>,
}

/// Durable store for the singleton record.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    record: Record,
}

impl RecordStore {
    /// Open the store at `path`, initializing a fresh empty record
    /// (`version = 0`, new `device_id`) when none exists yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let record = match std::fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => Self::fresh_record(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Self::fresh_record()
            }
            Err(e) => return Err(e.into()),
        };
        let store = Self { path, record };
        store.persist()?;
        Ok(store)
    }

    fn fresh_record() -> Record {
        tracing::debug!("initializing fresh record store");
        Record {
            version: 0,
            last_modified: Utc::now(),
            state: Value::Object(Map::new()),
            settings: Settings::for_new_device(),
        }
    }

    /// Current record version.
    pub fn version(&self) -> u64 {
        self.record.version
    }

    /// Cloned snapshot of the current state; never aliases internal state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.record.state.clone(),
            version: self.record.version,
            last_modified: self.record.last_modified,
        }
    }

    /// Cloned copy of the settings.
    pub fn settings(&self) -> Settings {
        self.record.settings.clone()
    }

    /// Apply a state update, bump the version by exactly one, stamp
    /// `last_modified`, and persist atomically.
    pub fn save(&mut self, update: StateUpdate) -> Result<Snapshot, StoreError> {
        let next_state = match update {
            StateUpdate::Merge(patch) => shallow_merge(&self.record.state, patch),
            StateUpdate::Replace(state) => state,
        };
        self.record.state = next_state;
        self.record.version += 1;
        self.record.last_modified = Utc::now();
        self.persist()?;
        Ok(self.snapshot())
    }

    /// Install a state adopted from the mirror or an import, taking its
    /// version and timestamp verbatim instead of bumping.
    pub fn adopt(
        &mut self,
        state: Value,
        version: u64,
        last_modified: DateTime<Utc>,
    ) -> Result<Snapshot, StoreError> {
        self.record.state = state;
        self.record.version = version;
        self.record.last_modified = last_modified;
        self.persist()?;
        Ok(self.snapshot())
    }

    /// Apply a settings patch and persist.
    pub fn update_settings(&mut self, patch: SettingsPatch) -> Result<Settings, StoreError> {
        let settings = &mut self.record.settings;
        if let Some(handle) = patch.external_handle {
            settings.external_handle = handle;
        }
        if let Some(encrypted) = patch.mirror_encrypted {
            settings.mirror_encrypted = encrypted;
        }
        if let Some(last_backup) = patch.last_backup {
            settings.last_backup = last_backup;
        }
        if let Some(version) = patch.last_backup_version {
            settings.last_backup_version = version;
        }
        if let Some(ts) = patch.last_backup_ts {
            settings.last_backup_ts = ts;
        }
        if let Some(options) = patch.options {
            settings.options = options;
        }
        self.persist()?;
        Ok(self.record.settings.clone())
    }

    fn persist(&self) -> Result<(), StoreError> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, &self.record)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

fn shallow_merge(base: &Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in patch_map {
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, patch) => patch,
    }
}
