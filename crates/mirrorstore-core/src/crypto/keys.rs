//! Key material types and the wrap/seal primitives built on them.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use aes_kw::KekAes256;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

/// Key length in bytes for both the KEK and the DEK (256-bit keys).
pub const KEY_LEN: usize = 32;

/// AES-GCM IV length in bytes.
pub const IV_LEN: usize = 12;

/// Payload cipher identifier written into container headers.
pub const PAYLOAD_ALGO: &str = "AES-GCM";

/// Key-encrypting key derived from the user's password.
///
/// Only ever used to wrap and unwrap the DEK; never touches the payload.
/// Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Kek([u8; KEY_LEN]);

impl Kek {
    /// Build a KEK from raw derived bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// SHA-256 of the raw key bytes.
    ///
    /// Stored in the container header so a supplied password can be checked
    /// cheaply, before any unwrap attempt.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        sha256(&self.0)
    }

    /// Constant-time comparison of this KEK's fingerprint against a stored one.
    #[must_use]
    pub fn fingerprint_matches(&self, expected: &[u8]) -> bool {
        let fp = self.fingerprint();
        expected.len() == fp.len() && bool::from(fp.as_slice().ct_eq(expected))
    }
}

impl std::fmt::Debug for Kek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kek").field("key", &"[REDACTED]").finish()
    }
}

/// Data-encrypting key protecting the container payload.
///
/// Generated randomly when a container is first sealed and stored only in
/// wrapped form. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Dek([u8; KEY_LEN]);

impl Dek {
    /// Generate a fresh random DEK.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for Dek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dek").field("key", &"[REDACTED]").finish()
    }
}

/// Length of a wrapped DEK: the key plus the RFC 3394 integrity block.
pub const WRAPPED_DEK_LEN: usize = KEY_LEN + 8;

/// Wrap a DEK under a KEK (AES-KW, RFC 3394).
pub fn wrap_dek(dek: &Dek, kek: &Kek) -> Result<Vec<u8>, CryptoError> {
    let kw = KekAes256::from(kek.0);
    let mut out = [0u8; WRAPPED_DEK_LEN];
    kw.wrap(&dek.0, &mut out)?;
    Ok(out.to_vec())
}

/// Unwrap a DEK previously wrapped under the same KEK.
///
/// # Errors
///
/// `CryptoError::KeyUnwrapIntegrityFailed` when the RFC 3394 integrity
/// check fails, `CryptoError::InvalidCiphertextLength` for malformed input.
pub fn unwrap_dek(wrapped: &[u8], kek: &Kek) -> Result<Dek, CryptoError> {
    if wrapped.len() != WRAPPED_DEK_LEN {
        return Err(CryptoError::InvalidCiphertextLength);
    }
    let kw = KekAes256::from(kek.0);
    let mut bytes = [0u8; KEY_LEN];
    kw.unwrap(wrapped, &mut bytes)?;
    Ok(Dek::from_bytes(bytes))
}

/// Encrypt a payload with AES-256-GCM.
///
/// The IV must be freshly random for every encryption; see [`generate_iv`].
pub fn encrypt_payload(dek: &Dek, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&dek.0).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LEN,
        actual: dek.0.len(),
    })?;
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt an AES-256-GCM payload.
pub fn decrypt_payload(dek: &Dek, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&dek.0).map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LEN,
        actual: dek.0.len(),
    })?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Generate a fresh random AES-GCM IV.
#[must_use]
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);
    iv
}

/// SHA-256 convenience wrapper.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}
