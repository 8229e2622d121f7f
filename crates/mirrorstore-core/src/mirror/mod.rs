//! The mirror adapter: the encrypted external copy of the record.
//!
//! Wraps one user-authorized external file. Every successful container
//! write is shadowed to a `.prev` sibling, and periodic timestamped backups
//! accumulate next to the main file, so a corrupted or vanished main file
//! can almost always be recovered from a sibling. Shadow and backup writes
//! are strictly best-effort: their failure never fails a save.

use std::io;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use thiserror::Error;

use crate::container::{self, Container, ContainerError, RewrapOptions};
use crate::events::{EventBus, RecoverySource, StorageEvent};
use crate::handle::{Availability, ExternalDir, ExternalFile};
use crate::lock::FileLock;
use crate::store::Settings;

/// Suffix of the shadow copy holding the previous container.
pub const PREVIOUS_SUFFIX: &str = ".prev";

/// Infix of timestamped backup file names.
pub const BACKUP_INFIX: &str = ".backup-";

/// Version delta since the last backup that triggers a new one.
pub const BACKUP_VERSION_INTERVAL: u64 = 50;

/// Age of the last backup that triggers a new one.
pub const BACKUP_INTERVAL_MS: i64 = 24 * 60 * 60 * 1000;

/// Count-based retention: backups beyond this many newest are pruned.
pub const BACKUP_RETAIN: usize = 10;

/// Errors from mirror file I/O.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("mirror read failed: {0}")]
    Read(#[source] io::Error),

    #[error("mirror write failed: {0}")]
    Write(#[source] io::Error),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// Settings fields to record after a backup was written.
#[derive(Debug, Clone, Copy)]
pub struct BackupStamp {
    pub at: DateTime<Utc>,
    pub version: u64,
    pub ts_ms: i64,
}

/// One entry from [`MirrorAdapter::list_backups`].
#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub name: String,
    pub date: DateTime<Utc>,
    pub version: u64,
}

/// Manages the external mirror file, its shadow, and its backups.
#[derive(Debug)]
pub struct MirrorAdapter {
    handle: Box<dyn ExternalFile>,
    lock: FileLock,
    events: EventBus,
}

impl MirrorAdapter {
    /// Wrap a granted handle. The lock resolves its sibling `.lock` file
    /// here, once; sibling-dependent features silently disable when the
    /// capability is missing.
    pub fn new(handle: Box<dyn ExternalFile>, device_id: &str, events: EventBus) -> Self {
        let lock = FileLock::for_handle(handle.as_ref(), device_id, events.clone());
        Self {
            handle,
            lock,
            events,
        }
    }

    pub fn handle(&self) -> &dyn ExternalFile {
        self.handle.as_ref()
    }

    pub fn lock(&self) -> &FileLock {
        &self.lock
    }

    /// Re-validate that the grant is still usable. Provisional access gets
    /// one re-request attempt.
    pub fn is_connected(&self) -> bool {
        match self.handle.probe() {
            Availability::Granted => true,
            Availability::Provisional => self.handle.request_access(),
            Availability::Revoked => false,
        }
    }

    /// Read and parse the main file. An empty file is "no container yet".
    pub fn read_container(&self) -> Result<Option<Container>, MirrorError> {
        let bytes = self.handle.read().map_err(MirrorError::Read)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(Container::from_bytes(&bytes)?))
    }

    /// Write the container to the main file, then shadow it best-effort.
    pub fn write_container(&self, container: &Container) -> Result<(), MirrorError> {
        let bytes = container.to_bytes()?;
        self.handle.write(&bytes).map_err(MirrorError::Write)?;
        self.persist_shadow(&bytes);
        Ok(())
    }

    fn persist_shadow(&self, bytes: &[u8]) {
        let Some(dir) = self.handle.directory() else {
            return;
        };
        let name = format!("{}{PREVIOUS_SUFFIX}", self.handle.name());
        if let Err(e) = dir.open(&name).and_then(|file| file.write(bytes)) {
            tracing::debug!(error = %e, "shadow write skipped");
        }
    }

    /// Load the main file, falling back to the shadow and then to backups
    /// (newest first). Every successful fallback emits `MirrorRecovered`.
    pub fn resilient_load(&self) -> Option<Container> {
        match self.read_container() {
            Ok(Some(container)) => return Some(container),
            Ok(None) => tracing::debug!("main mirror file empty"),
            Err(e) => tracing::warn!(error = %e, "main mirror file unreadable"),
        }

        let dir = self.handle.directory()?;

        let shadow_name = format!("{}{PREVIOUS_SUFFIX}", self.handle.name());
        if let Some(container) = Self::try_sibling(dir, &shadow_name) {
            tracing::info!("recovered container from shadow copy");
            self.events.emit(StorageEvent::MirrorRecovered {
                source: RecoverySource::Shadow,
            });
            return Some(container);
        }

        for name in self.backup_names_newest_first(dir) {
            if let Some(container) = Self::try_sibling(dir, &name) {
                tracing::info!(backup = %name, "recovered container from backup");
                self.events.emit(StorageEvent::MirrorRecovered {
                    source: RecoverySource::Backup(name),
                });
                return Some(container);
            }
        }
        None
    }

    fn try_sibling(dir: &dyn ExternalDir, name: &str) -> Option<Container> {
        let bytes = dir.open(name).ok()?.read().ok()?;
        if bytes.is_empty() {
            return None;
        }
        Container::from_bytes(&bytes).ok()
    }

    fn backup_names_newest_first(&self, dir: &dyn ExternalDir) -> Vec<String> {
        let prefix = format!("{}{BACKUP_INFIX}", self.handle.name());
        let mut names: Vec<String> = dir
            .list()
            .unwrap_or_default()
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect();
        // Timestamps in the name sort lexicographically.
        names.sort();
        names.reverse();
        names
    }

    /// Write a timestamped backup when either the version delta since the
    /// last backup reached the interval, or a previous backup exists and
    /// has aged past 24 hours. Returns the settings stamp to persist, or
    /// `None` when no backup was due or the write failed.
    pub fn maybe_backup(&self, container: &Container, settings: &Settings) -> Option<BackupStamp> {
        let version = container.header.meta.version_counter;
        let now = Utc::now();
        let now_ms = now.timestamp_millis();

        let version_due =
            version.saturating_sub(settings.last_backup_version) >= BACKUP_VERSION_INTERVAL;
        let time_due =
            settings.last_backup_ts > 0 && now_ms - settings.last_backup_ts >= BACKUP_INTERVAL_MS;
        if !(version_due || time_due) {
            return None;
        }

        let dir = self.handle.directory()?;
        let name = format!(
            "{}{BACKUP_INFIX}{}.enc",
            self.handle.name(),
            now.format("%Y%m%dT%H%M%S")
        );
        let bytes = match container.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "backup serialization failed");
                return None;
            }
        };
        match dir.open(&name).and_then(|file| file.write(&bytes)) {
            Ok(()) => {
                tracing::info!(backup = %name, version, "backup written");
                self.prune_backups(dir);
                Some(BackupStamp {
                    at: now,
                    version,
                    ts_ms: now_ms,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "backup write failed");
                None
            }
        }
    }

    fn prune_backups(&self, dir: &dyn ExternalDir) {
        for name in self.backup_names_newest_first(dir).iter().skip(BACKUP_RETAIN) {
            if let Err(e) = dir.remove(name) {
                tracing::debug!(backup = %name, error = %e, "backup prune skipped");
            }
        }
    }

    /// Enumerate backups with the version each one carries.
    pub fn list_backups(&self) -> Vec<BackupInfo> {
        let Some(dir) = self.handle.directory() else {
            return Vec::new();
        };
        let mut backups = Vec::new();
        for name in self.backup_names_newest_first(dir) {
            let Ok(file) = dir.open(&name) else {
                continue;
            };
            let version = file
                .read()
                .ok()
                .and_then(|bytes| Container::from_bytes(&bytes).ok())
                .map_or(0, |c| c.header.meta.version_counter);
            let date = file.modified().unwrap_or_else(Utc::now);
            backups.push(BackupInfo {
                name,
                date,
                version,
            });
        }
        backups
    }

    /// Rewrap the current container under a new password. The ciphertext is
    /// untouched; the shadow copy is refreshed by the write.
    pub fn change_password(
        &self,
        old_password: &SecretString,
        new_password: &SecretString,
    ) -> Result<(), MirrorError> {
        let Some(mut container) = self.resilient_load() else {
            return Err(MirrorError::Read(io::Error::new(
                io::ErrorKind::NotFound,
                "no container to rewrap",
            )));
        };
        container::rewrap(
            &mut container,
            old_password,
            new_password,
            &RewrapOptions::default(),
        )?;
        self.write_container(&container)?;
        self.events.emit(StorageEvent::PasswordChanged);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{seal, ContainerMeta, SealParams};
    use crate::handle::FsFileHandle;
    use serde_json::json;
    use tempfile::TempDir;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    fn test_container(version: u64) -> Container {
        seal(SealParams {
            state: &json!({"v": version}),
            password: &secret("pw"),
            meta: ContainerMeta {
                device_id: "device-a".to_string(),
                version_counter: version,
                last_modified: Utc::now(),
                prev_version_counter: version.checked_sub(1),
            },
            previous_header: None,
        })
        .unwrap()
    }

    fn adapter_in(dir: &TempDir) -> MirrorAdapter {
        let handle = FsFileHandle::new(dir.path().join("mirror.json.enc"));
        MirrorAdapter::new(Box::new(handle), "device-a", EventBus::new())
    }

    fn fresh_settings() -> Settings {
        let store_dir = TempDir::new().unwrap();
        crate::store::RecordStore::open(store_dir.path().join("r.json"))
            .unwrap()
            .settings()
    }

    #[test]
    fn test_write_creates_shadow() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter_in(&dir);

        adapter.write_container(&test_container(1)).unwrap();

        assert!(dir.path().join("mirror.json.enc").exists());
        assert!(dir.path().join("mirror.json.enc.prev").exists());
        assert_eq!(
            std::fs::read(dir.path().join("mirror.json.enc")).unwrap(),
            std::fs::read(dir.path().join("mirror.json.enc.prev")).unwrap()
        );
    }

    #[test]
    fn test_empty_file_is_no_container() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter_in(&dir);
        assert!(adapter.read_container().unwrap().is_none());
    }

    #[test]
    fn test_corrupted_main_recovers_from_shadow() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new();
        let handle = FsFileHandle::new(dir.path().join("mirror.json.enc"));
        let adapter = MirrorAdapter::new(Box::new(handle), "device-a", bus.clone());
        let rx = bus.subscribe();

        adapter.write_container(&test_container(5)).unwrap();
        std::fs::write(dir.path().join("mirror.json.enc"), b"{corrupted").unwrap();

        let recovered = adapter.resilient_load().expect("shadow should recover");
        assert_eq!(recovered.header.meta.version_counter, 5);
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![StorageEvent::MirrorRecovered {
                source: RecoverySource::Shadow
            }]
        );
    }

    #[test]
    fn test_recovery_falls_back_to_backups() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter_in(&dir);

        let backup_bytes = test_container(7).to_bytes().unwrap();
        std::fs::write(
            dir.path().join("mirror.json.enc.backup-20250101T000000.enc"),
            &backup_bytes,
        )
        .unwrap();
        std::fs::write(dir.path().join("mirror.json.enc"), b"junk").unwrap();

        let recovered = adapter.resilient_load().expect("backup should recover");
        assert_eq!(recovered.header.meta.version_counter, 7);
    }

    #[test]
    fn test_no_backup_below_version_interval() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter_in(&dir);
        let settings = fresh_settings();

        assert!(adapter
            .maybe_backup(&test_container(BACKUP_VERSION_INTERVAL - 1), &settings)
            .is_none());
    }

    #[test]
    fn test_backup_at_version_interval() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter_in(&dir);
        let settings = fresh_settings();

        let stamp = adapter
            .maybe_backup(&test_container(BACKUP_VERSION_INTERVAL), &settings)
            .expect("backup due at the version interval");
        assert_eq!(stamp.version, BACKUP_VERSION_INTERVAL);
        assert_eq!(adapter.list_backups().len(), 1);
    }

    #[test]
    fn test_time_trigger_requires_existing_backup() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter_in(&dir);

        // Never backed up: age rule must not fire on the epoch default.
        let settings = fresh_settings();
        assert!(adapter.maybe_backup(&test_container(1), &settings).is_none());

        // Previous backup 25h old: age rule fires.
        let mut aged = fresh_settings();
        aged.last_backup_version = 1;
        aged.last_backup_ts = Utc::now().timestamp_millis() - 25 * 60 * 60 * 1000;
        assert!(adapter.maybe_backup(&test_container(2), &aged).is_some());
    }

    #[test]
    fn test_backup_pruning_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter_in(&dir);

        for i in 0..BACKUP_RETAIN + 3 {
            std::fs::write(
                dir.path().join(format!(
                    "mirror.json.enc.backup-2025010{}T00000{}.enc",
                    i / 10,
                    i % 10
                )),
                b"old",
            )
            .unwrap();
        }
        let settings = fresh_settings();
        adapter
            .maybe_backup(&test_container(BACKUP_VERSION_INTERVAL), &settings)
            .unwrap();

        assert_eq!(adapter.list_backups().len(), BACKUP_RETAIN);
    }

    #[test]
    fn test_list_backups_reports_versions() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter_in(&dir);

        std::fs::write(
            dir.path().join("mirror.json.enc.backup-20250101T000000.enc"),
            test_container(12).to_bytes().unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("mirror.json.enc.backup-20250201T000000.enc"),
            b"unparsable",
        )
        .unwrap();

        let backups = adapter.list_backups();
        assert_eq!(backups.len(), 2);
        // newest first; the unparsable one reads as version 0
        assert_eq!(backups[0].version, 0);
        assert_eq!(backups[1].version, 12);
    }

    #[test]
    fn test_change_password_keeps_ciphertext() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter_in(&dir);
        adapter.write_container(&test_container(3)).unwrap();
        let before = adapter.read_container().unwrap().unwrap();

        adapter
            .change_password(&secret("pw"), &secret("new-pw"))
            .unwrap();

        let after = adapter.read_container().unwrap().unwrap();
        assert_eq!(after.ciphertext, before.ciphertext);
        assert_ne!(after.header.dek_wrapped, before.header.dek_wrapped);
        assert!(container::open(&after, &secret("new-pw")).is_ok());
    }
}
