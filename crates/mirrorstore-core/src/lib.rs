//! Local-first persistence with an optional encrypted mirror.
//!
//! The engine keeps an authoritative record in a durable local store and
//! opportunistically mirrors it, envelope-encrypted, to a user-authorized
//! external file that may be shared between devices through a cloud-synced
//! folder or removable media. Mirror writes are guarded by a cooperative
//! file lock, shadowed to a `.prev` copy, and periodically backed up;
//! version counters reconcile the two copies with a newer-wins policy.
//!
//! ```no_run
//! use mirrorstore_core::engine::StorageEngine;
//! use mirrorstore_core::handle::DirectoryHandleProvider;
//! use mirrorstore_core::store::StateUpdate;
//! use secrecy::SecretString;
//! use serde_json::json;
//!
//! let engine = StorageEngine::builder("app/record.json")
//!     .with_provider(DirectoryHandleProvider::new("/mnt/shared"))
//!     .with_password_prompt(|| Some(SecretString::from("password".to_string())))
//!     .open()?;
//!
//! engine.connect_file(true)?;
//! let receipt = engine.save(StateUpdate::Merge(json!({"note": "hello"})))?;
//! println!("saved version {}", receipt.version);
//! # Ok::<(), mirrorstore_core::EngineError>(())
//! ```

#![forbid(unsafe_code)]

pub mod container;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod lock;
pub mod mirror;
pub mod store;

pub use engine::{
    LastSaveInfo, LoadResult, MirrorOutcome, SaveReceipt, SaveTarget, StorageEngine,
};
pub use error::EngineError;
pub use events::{EventBus, RecoverySource, StorageEvent};
pub use store::{Settings, StateUpdate};
