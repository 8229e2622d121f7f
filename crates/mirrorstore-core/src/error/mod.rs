//! Error types for the engine crate.
//!
//! Module-level errors (`CryptoError`, `ContainerError`, `StoreError`,
//! `MirrorError`) are re-exported here; `EngineError` is the taxonomy the
//! public API speaks, with stable string codes carried by the event stream
//! and external callers.

use thiserror::Error;

pub use crate::container::ContainerError;
pub use crate::crypto::CryptoError;
pub use crate::mirror::MirrorError;
pub use crate::store::StoreError;

/// Failure taxonomy of the composite engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The mirror write lost the advisory lock race; retryable later.
    #[error("mirror file is locked by another writer")]
    Locked,

    /// No mirror is configured or the grant was revoked. A signal, not a
    /// fault.
    #[error("no mirror file connected")]
    NotConnected,

    /// The encrypted mirror needs a password that was not supplied.
    #[error("password required for the encrypted mirror")]
    PasswordRequired,

    /// KEK fingerprint mismatch.
    #[error("wrong password")]
    WrongPassword,

    /// Fingerprint matched but decrypt or hash verification failed.
    #[error("container integrity check failed")]
    IntegrityFailure,

    /// Unparsable container.
    #[error("corrupted container: {0}")]
    CorruptedFile(String),

    /// The container was written with an unsupported format version.
    #[error("unsupported container format version {found}")]
    FormatVersionMismatch { found: u32 },

    /// Import refused because the container is not strictly newer.
    #[error("imported container version {imported} is not newer than local version {current}")]
    OlderVersion { imported: u64, current: u64 },

    #[error("mirror write failed: {0}")]
    MirrorWriteFailed(String),

    #[error("mirror read failed: {0}")]
    MirrorReadFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl EngineError {
    /// Stable machine-readable code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Locked => "LOCKED",
            EngineError::NotConnected => "FS_NOT_CONNECTED",
            EngineError::PasswordRequired => "PASSWORD_REQUIRED",
            EngineError::WrongPassword => "WRONG_PASSWORD",
            EngineError::IntegrityFailure => "INTEGRITY_FAIL",
            EngineError::CorruptedFile(_) => "CORRUPTED_FILE",
            EngineError::FormatVersionMismatch { .. } => "FILE_FORMAT_VERSION_MISMATCH",
            EngineError::OlderVersion { .. } => "OLDER_VERSION",
            EngineError::MirrorWriteFailed(_) => "MIRROR_WRITE_FAIL",
            EngineError::MirrorReadFailed(_) => "MIRROR_READ_FAIL",
            EngineError::Store(_) => "STORE_FAIL",
            EngineError::Crypto(_) => "CRYPTO_FAIL",
        }
    }
}

impl From<ContainerError> for EngineError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::FormatVersionMismatch { found } => {
                EngineError::FormatVersionMismatch { found }
            }
            ContainerError::WrongPassword => EngineError::WrongPassword,
            ContainerError::IntegrityFailure => EngineError::IntegrityFailure,
            ContainerError::Corrupted(msg) => EngineError::CorruptedFile(msg),
            ContainerError::Crypto(e) => EngineError::Crypto(e),
        }
    }
}

impl From<MirrorError> for EngineError {
    fn from(err: MirrorError) -> Self {
        match err {
            MirrorError::Read(e) => EngineError::MirrorReadFailed(e.to_string()),
            MirrorError::Write(e) => EngineError::MirrorWriteFailed(e.to_string()),
            MirrorError::Container(e) => e.into(),
        }
    }
}
