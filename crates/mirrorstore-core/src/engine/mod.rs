//! The composite engine: one `load`/`save` API over the primary store and
//! the optional encrypted mirror.
//!
//! The primary store is authoritative. A `save` lands there first and is
//! durable before any mirroring is attempted; everything that can go wrong
//! on the mirror path (contested lock, missing password, revoked grant,
//! I/O failure) is reported through events and the [`MirrorOutcome`] of the
//! receipt, never by failing the save. `load` adopts the mirror's state
//! only when its version counter is strictly higher.
//!
//! All mutating operations serialize on an internal mutex, so two `save`
//! calls on the same engine can never interleave their read-mutate-persist
//! sequences.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::container::{self, Container, ContainerError, ContainerMeta, SealParams};
use crate::error::EngineError;
use crate::events::{EventBus, StorageEvent};
use crate::handle::{HandleProvider, NullHandleProvider};
use crate::lock::{LOCK_RETRY_WINDOW, LOCK_TTL};
use crate::mirror::{BackupInfo, MirrorAdapter};
use crate::store::{RecordStore, Settings, SettingsPatch, Snapshot, StateUpdate};

/// Suggested mirror file names handed to the capability provider.
pub const DEFAULT_MIRROR_NAME_ENCRYPTED: &str = "mirrorstore.json.enc";
pub const DEFAULT_MIRROR_NAME_PLAIN: &str = "mirrorstore.json";

/// Callback invoked when the encrypted mirror needs a password and none is
/// cached. Returning `None` means the user declined.
pub type PasswordCallback = Box<dyn Fn() -> Option<SecretString> + Send + Sync>;

/// Result of a `load`: a cloned state snapshot plus its version.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub state: Value,
    pub version: u64,
}

impl From<Snapshot> for LoadResult {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            state: snapshot.state,
            version: snapshot.version,
        }
    }
}

/// What happened on the mirror side of a `save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// Container written (and possibly backed up).
    Written,
    /// No mirror configured, or the grant is gone. A no-op, not a fault.
    NotConnected,
    /// The advisory lock stayed contested through the retry window.
    Locked,
    /// The mirror is encrypted and no password was available.
    PasswordRequired,
    /// Sealing or writing failed; details went out as a `MirrorError` event.
    WriteFailed,
}

/// Receipt of a `save`. The version refers to the primary store, which is
/// durable regardless of the mirror outcome.
#[derive(Debug, Clone, Copy)]
pub struct SaveReceipt {
    pub version: u64,
    pub mirror: MirrorOutcome,
}

/// Which layer most recently persisted the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTarget {
    Primary,
    Mirror,
}

/// Metadata about the most recent successful save.
#[derive(Debug, Clone, Copy)]
pub struct LastSaveInfo {
    pub version: u64,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
    pub target: SaveTarget,
}

fn clone_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}

/// Builder for [`StorageEngine`].
pub struct EngineBuilder {
    store_path: PathBuf,
    provider: Box<dyn HandleProvider>,
    ask_password: Option<PasswordCallback>,
    lock_retry_window: std::time::Duration,
}

impl EngineBuilder {
    /// Bound the total time a contested mirror lock is retried before the
    /// save reports [`MirrorOutcome::Locked`].
    pub fn with_lock_retry_window(mut self, window: std::time::Duration) -> Self {
        self.lock_retry_window = window;
        self
    }

    /// Use `provider` to obtain and rebind mirror file handles. Defaults to
    /// [`NullHandleProvider`], i.e. a host without file capability.
    pub fn with_provider(mut self, provider: impl HandleProvider + 'static) -> Self {
        self.provider = Box::new(provider);
        self
    }

    /// Install the password prompt callback.
    pub fn with_password_prompt(
        mut self,
        prompt: impl Fn() -> Option<SecretString> + Send + Sync + 'static,
    ) -> Self {
        self.ask_password = Some(Box::new(prompt));
        self
    }

    /// Open the primary store and rebind the persisted mirror handle, if
    /// any. Fails fast when the local store cannot be opened - the engine
    /// is unusable without it.
    pub fn open(self) -> Result<StorageEngine, EngineError> {
        let events = EventBus::new();
        let store = RecordStore::open(self.store_path)?;
        let settings = store.settings();

        let mirror = settings.external_handle.as_ref().and_then(|reference| {
            match self.provider.restore(reference) {
                Ok(handle) => Some(MirrorAdapter::new(
                    handle,
                    &settings.device_id,
                    events.clone(),
                )),
                Err(e) => {
                    tracing::warn!(error = %e, "mirror handle could not be restored");
                    None
                }
            }
        });
        if let Some(adapter) = &mirror {
            if adapter.is_connected() {
                events.emit(StorageEvent::MirrorConnected);
            }
        }

        Ok(StorageEngine {
            inner: Mutex::new(EngineInner {
                store,
                mirror,
                provider: self.provider,
                ask_password: self.ask_password,
                cached_password: None,
                lock_retry_window: self.lock_retry_window,
                last_save: LastSaveInfo {
                    version: 0,
                    last_modified: None,
                    target: SaveTarget::Primary,
                },
            }),
            events,
        })
    }
}

struct EngineInner {
    store: RecordStore,
    mirror: Option<MirrorAdapter>,
    provider: Box<dyn HandleProvider>,
    ask_password: Option<PasswordCallback>,
    cached_password: Option<SecretString>,
    lock_retry_window: std::time::Duration,
    last_save: LastSaveInfo,
}

/// The composite storage engine.
pub struct StorageEngine {
    inner: Mutex<EngineInner>,
    events: EventBus,
}

impl StorageEngine {
    /// Start building an engine around the record store at `store_path`.
    pub fn builder(store_path: impl Into<PathBuf>) -> EngineBuilder {
        EngineBuilder {
            store_path: store_path.into(),
            provider: Box::new(NullHandleProvider),
            ask_password: None,
            lock_retry_window: LOCK_RETRY_WINDOW,
        }
    }

    /// Register an event listener.
    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    /// Whether a mirror is configured and its grant is currently usable.
    pub fn is_mirror_connected(&self) -> bool {
        self.lock_inner()
            .mirror
            .as_ref()
            .is_some_and(MirrorAdapter::is_connected)
    }

    /// Cloned copy of the engine settings.
    pub fn settings(&self) -> Settings {
        self.lock_inner().store.settings()
    }

    /// Metadata about the most recent successful save.
    pub fn last_save_info(&self) -> LastSaveInfo {
        self.lock_inner().last_save
    }

    /// Load the current state.
    ///
    /// The primary store is the baseline; when a mirror is connected and
    /// holds a strictly newer version, that state is adopted into the
    /// primary store and returned instead.
    pub fn load(&self) -> Result<LoadResult, EngineError> {
        let mut inner = self.lock_inner();
        let primary = inner.store.snapshot();

        if let Some(remote) = inner.load_from_mirror(&self.events) {
            if remote.version > primary.version {
                tracing::info!(
                    local = primary.version,
                    mirror = remote.version,
                    "adopting newer mirror state"
                );
                let adopted =
                    inner
                        .store
                        .adopt(remote.state, remote.version, remote.last_modified)?;
                return Ok(adopted.into());
            }
        }
        Ok(primary.into())
    }

    /// Apply a state update.
    ///
    /// The primary write always happens first and its success is what the
    /// `Result` reports; the mirror outcome rides along in the receipt.
    pub fn save(&self, update: StateUpdate) -> Result<SaveReceipt, EngineError> {
        let mut inner = self.lock_inner();
        let snapshot = inner.store.save(update)?;
        inner.last_save = LastSaveInfo {
            version: snapshot.version,
            last_modified: Some(snapshot.last_modified),
            target: SaveTarget::Primary,
        };

        let mirror = inner.mirror_save(&snapshot, &self.events);
        if mirror == MirrorOutcome::Written {
            inner.last_save.target = SaveTarget::Mirror;
        }
        Ok(SaveReceipt {
            version: snapshot.version,
            mirror,
        })
    }

    /// Encrypt the current state under `password` and return the container
    /// bytes. Always uses a fresh salt and DEK - exports stand alone.
    pub fn export_encrypted(&self, password: &SecretString) -> Result<Vec<u8>, EngineError> {
        if password.expose_secret().is_empty() {
            return Err(EngineError::PasswordRequired);
        }
        let inner = self.lock_inner();
        let snapshot = inner.store.snapshot();
        let settings = inner.store.settings();
        let container = container::seal(SealParams {
            state: &snapshot.state,
            password,
            meta: ContainerMeta {
                device_id: settings.device_id,
                version_counter: snapshot.version,
                last_modified: snapshot.last_modified,
                prev_version_counter: snapshot.version.checked_sub(1),
            },
            previous_header: None,
        })?;
        Ok(container.to_bytes()?)
    }

    /// Decrypt `bytes` and adopt the contained state, refusing stale
    /// containers. On rejection the local state is untouched.
    pub fn import_encrypted(
        &self,
        bytes: &[u8],
        password: &SecretString,
    ) -> Result<LoadResult, EngineError> {
        let mut inner = self.lock_inner();
        let container = Container::from_bytes(bytes)?;
        let opened = container::open(&container, password).map_err(|e| {
            if matches!(e, ContainerError::WrongPassword) {
                self.events.emit(StorageEvent::PasswordWrong);
            }
            e
        })?;

        let current = inner.store.version();
        let imported = opened.meta.version_counter;
        if imported <= current {
            return Err(EngineError::OlderVersion { imported, current });
        }

        let snapshot = inner
            .store
            .adopt(opened.state, imported, opened.meta.last_modified)?;
        inner.last_save = LastSaveInfo {
            version: snapshot.version,
            last_modified: Some(snapshot.last_modified),
            target: SaveTarget::Primary,
        };
        let mirror = inner.mirror_save(&snapshot, &self.events);
        if mirror == MirrorOutcome::Written {
            inner.last_save.target = SaveTarget::Mirror;
        }
        Ok(snapshot.into())
    }

    /// Rotate the mirror password: the DEK is rewrapped under the new KEK,
    /// the ciphertext stays as-is.
    pub fn change_password(
        &self,
        old_password: &SecretString,
        new_password: &SecretString,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock_inner();
        let Some(mirror) = inner.mirror.as_ref() else {
            return Err(EngineError::NotConnected);
        };
        if !mirror.is_connected() {
            return Err(EngineError::NotConnected);
        }
        if let Err(e) = mirror.change_password(old_password, new_password) {
            let err: EngineError = e.into();
            if matches!(err, EngineError::WrongPassword) {
                self.events.emit(StorageEvent::PasswordWrong);
            }
            self.events.emit(StorageEvent::MirrorError {
                code: err.code(),
                message: err.to_string(),
            });
            return Err(err);
        }
        inner.cached_password = Some(clone_secret(new_password));
        Ok(())
    }

    /// Obtain a mirror file grant from the host and record it in settings.
    pub fn connect_file(&self, encrypted: bool) -> Result<(), EngineError> {
        let mut inner = self.lock_inner();
        let suggested = if encrypted {
            DEFAULT_MIRROR_NAME_ENCRYPTED
        } else {
            DEFAULT_MIRROR_NAME_PLAIN
        };
        let handle = inner.provider.request(suggested).map_err(|e| {
            tracing::warn!(error = %e, "host did not grant a mirror handle");
            EngineError::NotConnected
        })?;
        let reference = handle.reference();
        let device_id = inner.store.settings().device_id;
        let adapter = MirrorAdapter::new(handle, &device_id, self.events.clone());

        inner.store.update_settings(SettingsPatch {
            external_handle: Some(reference),
            mirror_encrypted: Some(encrypted),
            ..SettingsPatch::default()
        })?;
        inner.mirror = Some(adapter);
        self.events.emit(StorageEvent::MirrorConnected);
        Ok(())
    }

    /// Forget the mirror handle. The external file itself is not deleted.
    pub fn revoke(&self) -> Result<(), EngineError> {
        let mut inner = self.lock_inner();
        inner.store.update_settings(SettingsPatch {
            external_handle: Some(None),
            ..SettingsPatch::default()
        })?;
        inner.mirror = None;
        inner.cached_password = None;
        self.events.emit(StorageEvent::MirrorDisconnected);
        Ok(())
    }

    /// Enumerate backup files next to the mirror.
    pub fn list_backups(&self) -> Vec<BackupInfo> {
        self.lock_inner()
            .mirror
            .as_ref()
            .map(MirrorAdapter::list_backups)
            .unwrap_or_default()
    }

    /// Tear the engine down. All state is already durable; this exists so
    /// callers have an explicit end-of-life point.
    pub fn close(self) {
        drop(self);
    }

    fn lock_inner(&self) -> MutexGuard<'_, EngineInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// State read back from the mirror during `load`.
struct MirrorState {
    state: Value,
    version: u64,
    last_modified: chrono::DateTime<chrono::Utc>,
}

impl EngineInner {
    /// Resolve the password for the mirror: unencrypted mirrors seal under
    /// the empty password, otherwise the cache and then the prompt.
    fn password_for_mirror(
        settings: &Settings,
        cached: &mut Option<SecretString>,
        ask: Option<&PasswordCallback>,
    ) -> Option<SecretString> {
        if !settings.mirror_encrypted {
            return Some(SecretString::from(String::new()));
        }
        if let Some(password) = cached.as_ref() {
            return Some(clone_secret(password));
        }
        let password = ask?()?;
        *cached = Some(clone_secret(&password));
        Some(password)
    }

    /// Try to read a decrypted state from the mirror. All failures are
    /// absorbed into events; the caller falls back to the primary store.
    fn load_from_mirror(&mut self, events: &EventBus) -> Option<MirrorState> {
        let EngineInner {
            store,
            mirror,
            cached_password,
            ask_password,
            ..
        } = self;
        let mirror = mirror.as_ref()?;
        if !mirror.is_connected() {
            return None;
        }

        let container = mirror.resilient_load()?;
        let settings = store.settings();
        let Some(password) =
            Self::password_for_mirror(&settings, cached_password, ask_password.as_ref())
        else {
            events.emit(StorageEvent::PasswordNeeded);
            return None;
        };

        match container::open(&container, &password) {
            Ok(opened) => Some(MirrorState {
                state: opened.state,
                version: opened.meta.version_counter,
                last_modified: opened.meta.last_modified,
            }),
            Err(e) => {
                if matches!(e, ContainerError::WrongPassword) {
                    *cached_password = None;
                    events.emit(StorageEvent::PasswordWrong);
                }
                let err: EngineError = e.into();
                events.emit(StorageEvent::MirrorError {
                    code: err.code(),
                    message: err.to_string(),
                });
                None
            }
        }
    }

    /// Mirror the freshly saved snapshot. Never fails the save; the
    /// advisory lock is released on every path out.
    fn mirror_save(&mut self, snapshot: &Snapshot, events: &EventBus) -> MirrorOutcome {
        let EngineInner {
            store,
            mirror,
            cached_password,
            ask_password,
            lock_retry_window,
            ..
        } = self;
        let Some(mirror) = mirror.as_ref() else {
            return MirrorOutcome::NotConnected;
        };
        if !mirror.is_connected() {
            return MirrorOutcome::NotConnected;
        }

        if !mirror.lock().acquire_with_retry(LOCK_TTL, *lock_retry_window) {
            events.emit(StorageEvent::LockBlocked);
            return MirrorOutcome::Locked;
        }

        // Everything below must fall through to the release.
        let outcome = (|| {
            let settings = store.settings();
            let Some(password) =
                Self::password_for_mirror(&settings, cached_password, ask_password.as_ref())
            else {
                events.emit(StorageEvent::PasswordNeeded);
                return MirrorOutcome::PasswordRequired;
            };

            // Carry the previous header forward so the salt and DEK stay
            // stable across saves.
            let previous = mirror.resilient_load();
            let sealed = container::seal(SealParams {
                state: &snapshot.state,
                password: &password,
                meta: ContainerMeta {
                    device_id: settings.device_id.clone(),
                    version_counter: snapshot.version,
                    last_modified: snapshot.last_modified,
                    prev_version_counter: snapshot.version.checked_sub(1),
                },
                previous_header: previous.as_ref().map(|c| &c.header),
            });
            let container = match sealed {
                Ok(container) => container,
                Err(e) => {
                    if matches!(e, ContainerError::WrongPassword) {
                        *cached_password = None;
                        events.emit(StorageEvent::PasswordWrong);
                    }
                    let err: EngineError = e.into();
                    events.emit(StorageEvent::MirrorError {
                        code: err.code(),
                        message: err.to_string(),
                    });
                    return MirrorOutcome::WriteFailed;
                }
            };

            if let Err(e) = mirror.write_container(&container) {
                let err: EngineError = e.into();
                events.emit(StorageEvent::MirrorError {
                    code: err.code(),
                    message: err.to_string(),
                });
                return MirrorOutcome::WriteFailed;
            }

            if let Some(stamp) = mirror.maybe_backup(&container, &settings) {
                let result = store.update_settings(SettingsPatch {
                    last_backup: Some(Some(stamp.at)),
                    last_backup_version: Some(stamp.version),
                    last_backup_ts: Some(stamp.ts_ms),
                    ..SettingsPatch::default()
                });
                if let Err(e) = result {
                    tracing::warn!(error = %e, "backup stamp not persisted");
                }
            }
            MirrorOutcome::Written
        })();

        mirror.lock().release();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::DirectoryHandleProvider;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_engine_without_provider_saves_locally() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::builder(dir.path().join("record.json"))
            .open()
            .unwrap();

        let receipt = engine
            .save(StateUpdate::Merge(json!({"note": "local only"})))
            .unwrap();
        assert_eq!(receipt.version, 1);
        assert_eq!(receipt.mirror, MirrorOutcome::NotConnected);
        assert!(!engine.is_mirror_connected());
    }

    #[test]
    fn test_connect_fails_on_null_provider() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::builder(dir.path().join("record.json"))
            .open()
            .unwrap();

        let result = engine.connect_file(true);
        assert!(matches!(result, Err(EngineError::NotConnected)));
    }

    #[test]
    fn test_last_save_info_tracks_target() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::builder(dir.path().join("record.json"))
            .with_provider(DirectoryHandleProvider::new(dir.path().join("mirror")))
            .with_password_prompt(|| Some(SecretString::from("pw".to_string())))
            .open()
            .unwrap();

        engine.save(StateUpdate::Merge(json!({"a": 1}))).unwrap();
        assert_eq!(engine.last_save_info().target, SaveTarget::Primary);

        engine.connect_file(true).unwrap();
        let receipt = engine.save(StateUpdate::Merge(json!({"a": 2}))).unwrap();
        assert_eq!(receipt.mirror, MirrorOutcome::Written);
        assert_eq!(engine.last_save_info().target, SaveTarget::Mirror);
        assert_eq!(engine.last_save_info().version, 2);
    }

    #[test]
    fn test_export_rejects_empty_password() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::builder(dir.path().join("record.json"))
            .open()
            .unwrap();
        let result = engine.export_encrypted(&SecretString::from(String::new()));
        assert!(matches!(result, Err(EngineError::PasswordRequired)));
    }
}
