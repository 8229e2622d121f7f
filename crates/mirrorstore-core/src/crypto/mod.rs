//! Cryptographic primitives for the encrypted mirror container.
//!
//! The container uses envelope encryption: a random data-encrypting key
//! (DEK) encrypts the application state with AES-256-GCM, and the DEK is
//! stored only wrapped (AES-KW, RFC 3394) under a key-encrypting key (KEK)
//! derived from the user's password with PBKDF2-HMAC-SHA256. Password
//! rotation therefore rewraps the DEK and never re-encrypts the payload.

pub mod kdf;
pub mod keys;

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
///
/// `KeyUnwrapIntegrityFailed` deserves care at call sites: when the caller
/// has already verified the KEK fingerprint, an unwrap failure means the
/// wrapped key material is corrupted or tampered with, not that the
/// password was wrong.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The RFC 3394 integrity check failed while unwrapping the DEK.
    ///
    /// Without a prior fingerprint check this is indistinguishable from a
    /// wrong password; after a matching fingerprint it indicates corruption.
    #[error("key unwrap failed - wrong key material or corrupted wrapped key")]
    KeyUnwrapIntegrityFailed,

    /// Key derivation was rejected (bad parameters, empty salt, ...).
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// The wrapped-key ciphertext has an invalid length for AES-KW.
    #[error("invalid ciphertext length for key unwrap")]
    InvalidCiphertextLength,

    /// Key material had an unexpected length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// AES-GCM encryption failed.
    #[error("payload encryption failed")]
    EncryptionFailed,

    /// AES-GCM decryption failed (authentication tag mismatch).
    #[error("payload decryption failed - ciphertext corrupted or wrong key")]
    DecryptionFailed,
}

impl From<aes_kw::Error> for CryptoError {
    fn from(err: aes_kw::Error) -> Self {
        match err {
            aes_kw::Error::IntegrityCheckFailed => CryptoError::KeyUnwrapIntegrityFailed,
            _ => CryptoError::InvalidCiphertextLength,
        }
    }
}

// Re-export commonly used types
pub use kdf::{derive_kek, generate_salt, DEFAULT_KDF_ITERATIONS, KDF_ALGO, KDF_HASH, SALT_LEN};
pub use keys::{
    decrypt_payload, encrypt_payload, generate_iv, sha256, unwrap_dek, wrap_dek, Dek, Kek, IV_LEN,
    KEY_LEN, PAYLOAD_ALGO, WRAPPED_DEK_LEN,
};
