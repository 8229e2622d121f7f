//! Password-based KEK derivation.
//!
//! Deterministic given identical (password, salt, iterations) inputs, so a
//! container can be reopened on any device from the password alone.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use super::keys::{Kek, KEY_LEN};
use super::CryptoError;

/// Default PBKDF2 iteration count for newly created containers.
pub const DEFAULT_KDF_ITERATIONS: u32 = 150_000;

/// KDF algorithm identifier written into container headers.
pub const KDF_ALGO: &str = "PBKDF2";

/// KDF hash identifier written into container headers.
pub const KDF_HASH: &str = "SHA-256";

/// Length in bytes of the random KEK salt.
pub const SALT_LEN: usize = 16;

/// Derive a key-encrypting key from a password.
///
/// Runs PBKDF2-HMAC-SHA256 with the given salt and iteration count and
/// produces a 256-bit KEK.
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivationFailed` when the iteration count is
/// zero or the salt is empty; both would silently weaken the derivation.
pub fn derive_kek(
    password: &SecretString,
    salt: &[u8],
    iterations: u32,
) -> Result<Kek, CryptoError> {
    if iterations == 0 {
        return Err(CryptoError::KeyDerivationFailed(
            "iteration count must be non-zero".to_string(),
        ));
    }
    if salt.is_empty() {
        return Err(CryptoError::KeyDerivationFailed("empty salt".to_string()));
    }

    let mut out = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(
        password.expose_secret().as_bytes(),
        salt,
        iterations,
        &mut out,
    );
    Ok(Kek::from_bytes(out))
}

/// Generate a fresh random KEK salt.
#[must_use]
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        let a = derive_kek(&secret("hunter2"), &salt, 1_000).unwrap();
        let b = derive_kek(&secret("hunter2"), &salt, 1_000).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_different_passwords_differ() {
        let salt = [7u8; SALT_LEN];
        let a = derive_kek(&secret("hunter2"), &salt, 1_000).unwrap();
        let b = derive_kek(&secret("hunter3"), &salt, 1_000).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_different_salts_differ() {
        let a = derive_kek(&secret("hunter2"), &[1u8; SALT_LEN], 1_000).unwrap();
        let b = derive_kek(&secret("hunter2"), &[2u8; SALT_LEN], 1_000).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let result = derive_kek(&secret("pw"), &[1u8; SALT_LEN], 0);
        assert!(matches!(result, Err(CryptoError::KeyDerivationFailed(_))));
    }

    #[test]
    fn test_empty_salt_rejected() {
        let result = derive_kek(&secret("pw"), &[], 1_000);
        assert!(matches!(result, Err(CryptoError::KeyDerivationFailed(_))));
    }
}
