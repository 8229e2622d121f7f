//! End-to-end tests of the composite engine: conflict resolution, lock
//! behavior, export/import, crash recovery, and backup cadence.

use chrono::{TimeDelta, Utc};
use secrecy::SecretString;
use serde_json::json;
use tempfile::TempDir;

use mirrorstore_core::engine::{MirrorOutcome, StorageEngine};
use mirrorstore_core::handle::DirectoryHandleProvider;
use mirrorstore_core::lock::{LockDescriptor, LOCK_SUFFIX};
use mirrorstore_core::store::StateUpdate;
use mirrorstore_core::{EngineError, RecoverySource, StorageEvent};

const MIRROR_FILE: &str = "mirrorstore.json.enc";

fn secret(s: &str) -> SecretString {
    SecretString::from(s.to_string())
}

/// Engine whose mirror lives under `<root>/mirror` and whose password
/// prompt always answers `pw`.
fn engine_with_mirror(root: &TempDir, store_name: &str) -> StorageEngine {
    StorageEngine::builder(root.path().join(store_name))
        .with_provider(DirectoryHandleProvider::new(root.path().join("mirror")))
        .with_password_prompt(|| Some(secret("pw")))
        .open()
        .unwrap()
}

fn local_engine(root: &TempDir, store_name: &str) -> StorageEngine {
    StorageEngine::builder(root.path().join(store_name))
        .open()
        .unwrap()
}

#[test]
fn test_monotonic_versioning() {
    let root = TempDir::new().unwrap();
    let engine = local_engine(&root, "record.json");

    for i in 1..=8u64 {
        let receipt = engine.save(StateUpdate::Merge(json!({"i": i}))).unwrap();
        assert_eq!(receipt.version, i);
    }
    assert_eq!(engine.load().unwrap().version, 8);
}

#[test]
fn test_save_mirrors_and_reloads_on_second_device() {
    let root = TempDir::new().unwrap();

    let a = engine_with_mirror(&root, "record-a.json");
    a.connect_file(true).unwrap();
    let receipt = a.save(StateUpdate::Replace(json!({"owner": "a"}))).unwrap();
    assert_eq!(receipt.mirror, MirrorOutcome::Written);

    // Fresh device, same mirror file: load adopts the newer mirror state.
    let b = engine_with_mirror(&root, "record-b.json");
    b.connect_file(true).unwrap();
    let loaded = b.load().unwrap();
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.state, json!({"owner": "a"}));
}

#[test]
fn test_load_keeps_primary_when_mirror_is_older() {
    let root = TempDir::new().unwrap();

    let a = engine_with_mirror(&root, "record-a.json");
    a.connect_file(true).unwrap();
    a.save(StateUpdate::Replace(json!({"owner": "a"}))).unwrap();

    let b = engine_with_mirror(&root, "record-b.json");
    for i in 1..=3u64 {
        b.save(StateUpdate::Merge(json!({"local": i}))).unwrap();
    }
    b.connect_file(true).unwrap();

    // mirror holds version 1, primary is at 3: primary wins untouched
    let loaded = b.load().unwrap();
    assert_eq!(loaded.version, 3);
    assert_eq!(loaded.state["local"], json!(3));
}

#[test]
fn test_scenario_a_export_import_roundtrip() {
    let root = TempDir::new().unwrap();
    let engine = local_engine(&root, "record.json");
    engine
        .save(StateUpdate::Replace(json!({"foo": "bar"})))
        .unwrap();

    let bytes = engine.export_encrypted(&secret("correct-pw")).unwrap();

    let restored = local_engine(&root, "record-restored.json");
    let result = restored
        .import_encrypted(&bytes, &secret("correct-pw"))
        .unwrap();
    assert_eq!(result.state, json!({"foo": "bar"}));
    assert_eq!(result.version, 1);

    let third = local_engine(&root, "record-third.json");
    let result = third.import_encrypted(&bytes, &secret("wrong-pw"));
    assert!(matches!(result, Err(EngineError::WrongPassword)));
    // rejected import leaves the store untouched
    assert_eq!(third.load().unwrap().version, 0);
}

#[test]
fn test_stale_import_is_rejected() {
    let root = TempDir::new().unwrap();
    let engine = local_engine(&root, "record.json");
    engine.save(StateUpdate::Merge(json!({"a": 1}))).unwrap();
    engine.save(StateUpdate::Merge(json!({"a": 2}))).unwrap();

    let bytes = engine.export_encrypted(&secret("pw")).unwrap();
    let result = engine.import_encrypted(&bytes, &secret("pw"));
    assert!(matches!(
        result,
        Err(EngineError::OlderVersion {
            imported: 2,
            current: 2
        })
    ));
    assert_eq!(engine.load().unwrap().state, json!({"a": 2}));
}

#[test]
fn test_scenario_b_shadow_recovery_updates_primary() {
    let root = TempDir::new().unwrap();

    let a = engine_with_mirror(&root, "record-a.json");
    a.connect_file(true).unwrap();
    for i in 1..=5u64 {
        a.save(StateUpdate::Replace(json!({"i": i}))).unwrap();
    }

    // Second device at version 3.
    let b = engine_with_mirror(&root, "record-b.json");
    for i in 1..=3u64 {
        b.save(StateUpdate::Replace(json!({"local": i}))).unwrap();
    }
    b.connect_file(true).unwrap();

    // Main mirror file corrupted; the .prev shadow still holds version 5.
    let mirror_path = root.path().join("mirror").join(MIRROR_FILE);
    std::fs::write(&mirror_path, b"{torn write").unwrap();

    let events = b.subscribe();
    let loaded = b.load().unwrap();
    assert_eq!(loaded.version, 5);
    assert_eq!(loaded.state, json!({"i": 5}));

    let seen: Vec<_> = events.try_iter().collect();
    assert!(seen.contains(&StorageEvent::MirrorRecovered {
        source: RecoverySource::Shadow
    }));

    // The adoption is durable in the primary store.
    drop(b);
    let b_again = engine_with_mirror(&root, "record-b.json");
    assert!(b_again.load().unwrap().version >= 5);
}

#[test]
fn test_scenario_c_backup_cadence() {
    let root = TempDir::new().unwrap();
    let engine = engine_with_mirror(&root, "record.json");
    engine.connect_file(true).unwrap();

    for i in 1..=51u64 {
        let receipt = engine.save(StateUpdate::Replace(json!({"i": i}))).unwrap();
        assert_eq!(receipt.mirror, MirrorOutcome::Written);
    }

    let backups = engine.list_backups();
    assert_eq!(backups.len(), 1, "exactly one backup for the first 51 saves");
    assert_eq!(backups[0].version, 50);
    assert_eq!(engine.settings().last_backup_version, 50);
    assert!(engine.settings().last_backup.is_some());
    assert!(engine.settings().last_backup_ts > 0);
}

#[test]
fn test_contested_lock_yields_locked_outcome() {
    let root = TempDir::new().unwrap();
    let engine = StorageEngine::builder(root.path().join("record.json"))
        .with_provider(DirectoryHandleProvider::new(root.path().join("mirror")))
        .with_password_prompt(|| Some(secret("pw")))
        .with_lock_retry_window(std::time::Duration::from_millis(300))
        .open()
        .unwrap();
    engine.connect_file(true).unwrap();

    // Another device holds a live lock.
    let now = Utc::now();
    let descriptor = LockDescriptor {
        device_id: "other-device".to_string(),
        owner_heartbeat: now,
        expires_at: now + TimeDelta::seconds(120),
    };
    std::fs::write(
        root.path()
            .join("mirror")
            .join(format!("{MIRROR_FILE}{LOCK_SUFFIX}")),
        serde_json::to_vec(&descriptor).unwrap(),
    )
    .unwrap();

    let events = engine.subscribe();
    let receipt = engine.save(StateUpdate::Merge(json!({"n": 1}))).unwrap();

    // The primary save went through; only the mirror was blocked.
    assert_eq!(receipt.version, 1);
    assert_eq!(receipt.mirror, MirrorOutcome::Locked);
    assert!(events
        .try_iter()
        .any(|e| e == StorageEvent::LockBlocked));
}

#[test]
fn test_missing_password_yields_password_required() {
    let root = TempDir::new().unwrap();
    let engine = StorageEngine::builder(root.path().join("record.json"))
        .with_provider(DirectoryHandleProvider::new(root.path().join("mirror")))
        .open()
        .unwrap();
    engine.connect_file(true).unwrap();

    let events = engine.subscribe();
    let receipt = engine.save(StateUpdate::Merge(json!({"n": 1}))).unwrap();

    assert_eq!(receipt.version, 1);
    assert_eq!(receipt.mirror, MirrorOutcome::PasswordRequired);
    assert!(events
        .try_iter()
        .any(|e| e == StorageEvent::PasswordNeeded));
}

#[test]
fn test_unencrypted_mirror_needs_no_password() {
    let root = TempDir::new().unwrap();
    let engine = StorageEngine::builder(root.path().join("record.json"))
        .with_provider(DirectoryHandleProvider::new(root.path().join("mirror")))
        .open()
        .unwrap();
    engine.connect_file(false).unwrap();

    let receipt = engine.save(StateUpdate::Merge(json!({"n": 1}))).unwrap();
    assert_eq!(receipt.mirror, MirrorOutcome::Written);

    let other = StorageEngine::builder(root.path().join("record-b.json"))
        .with_provider(DirectoryHandleProvider::new(root.path().join("mirror")))
        .open()
        .unwrap();
    other.connect_file(false).unwrap();
    assert_eq!(other.load().unwrap().state["n"], json!(1));
}

#[test]
fn test_change_password_rolls_the_mirror_key() {
    let root = TempDir::new().unwrap();
    let a = engine_with_mirror(&root, "record-a.json");
    a.connect_file(true).unwrap();
    a.save(StateUpdate::Replace(json!({"secret": true}))).unwrap();

    let events = a.subscribe();
    a.change_password(&secret("pw"), &secret("rotated")).unwrap();
    assert!(events
        .try_iter()
        .any(|e| e == StorageEvent::PasswordChanged));

    // Old password no longer opens the mirror; the new one does.
    let old = StorageEngine::builder(root.path().join("record-old.json"))
        .with_provider(DirectoryHandleProvider::new(root.path().join("mirror")))
        .with_password_prompt(|| Some(secret("pw")))
        .open()
        .unwrap();
    old.connect_file(true).unwrap();
    let events = old.subscribe();
    assert_eq!(old.load().unwrap().version, 0);
    assert!(events.try_iter().any(|e| e == StorageEvent::PasswordWrong));

    let new = StorageEngine::builder(root.path().join("record-new.json"))
        .with_provider(DirectoryHandleProvider::new(root.path().join("mirror")))
        .with_password_prompt(|| Some(secret("rotated")))
        .open()
        .unwrap();
    new.connect_file(true).unwrap();
    assert_eq!(new.load().unwrap().state, json!({"secret": true}));
}

#[test]
fn test_change_password_without_mirror_fails() {
    let root = TempDir::new().unwrap();
    let engine = local_engine(&root, "record.json");
    let result = engine.change_password(&secret("a"), &secret("b"));
    assert!(matches!(result, Err(EngineError::NotConnected)));
}

#[test]
fn test_revoke_disconnects_but_keeps_external_file() {
    let root = TempDir::new().unwrap();
    let engine = engine_with_mirror(&root, "record.json");
    engine.connect_file(true).unwrap();
    engine.save(StateUpdate::Merge(json!({"n": 1}))).unwrap();

    let events = engine.subscribe();
    engine.revoke().unwrap();

    assert!(!engine.is_mirror_connected());
    assert_eq!(engine.settings().external_handle, None);
    assert!(root.path().join("mirror").join(MIRROR_FILE).exists());
    assert!(events
        .try_iter()
        .any(|e| e == StorageEvent::MirrorDisconnected));

    let receipt = engine.save(StateUpdate::Merge(json!({"n": 2}))).unwrap();
    assert_eq!(receipt.mirror, MirrorOutcome::NotConnected);
}

#[test]
fn test_reopen_restores_mirror_connection() {
    let root = TempDir::new().unwrap();
    {
        let engine = engine_with_mirror(&root, "record.json");
        engine.connect_file(true).unwrap();
        engine.save(StateUpdate::Merge(json!({"n": 1}))).unwrap();
    }

    // A new engine over the same store rebinds the persisted handle.
    let engine = engine_with_mirror(&root, "record.json");
    assert!(engine.is_mirror_connected());
    let receipt = engine.save(StateUpdate::Merge(json!({"n": 2}))).unwrap();
    assert_eq!(receipt.mirror, MirrorOutcome::Written);
}

#[test]
fn test_concurrent_saves_serialize() {
    let root = TempDir::new().unwrap();
    let engine = std::sync::Arc::new(local_engine(&root, "record.json"));

    let mut handles = Vec::new();
    for t in 0..4 {
        let engine = std::sync::Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            for i in 0..10 {
                let mut patch = serde_json::Map::new();
                patch.insert(format!("t{t}"), json!(i));
                engine
                    .save(StateUpdate::Merge(serde_json::Value::Object(patch)))
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // 40 interleaved saves, each incrementing by exactly one.
    assert_eq!(engine.load().unwrap().version, 40);
}
