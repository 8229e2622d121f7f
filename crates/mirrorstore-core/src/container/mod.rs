//! The on-disk encrypted envelope.
//!
//! A container is a single JSON document holding a self-describing header
//! (KDF parameters, KEK fingerprint, wrapped DEK, payload cipher, version
//! metadata, plaintext hash) plus the AES-GCM ciphertext of the serialized
//! application state. Field names are part of the wire format: containers
//! written by one device must open on any other.
//!
//! Opening is staged to fail as early and as precisely as possible:
//! format gate, then a constant-time KEK fingerprint check (wrong password,
//! no unwrap attempted), and only then unwrap + decrypt + plaintext hash,
//! whose failures indicate corruption rather than a bad password.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{base64::Base64, serde_as};
use thiserror::Error;

use crate::crypto::{
    decrypt_payload, derive_kek, encrypt_payload, generate_iv, generate_salt, sha256, unwrap_dek,
    wrap_dek, CryptoError, Dek, DEFAULT_KDF_ITERATIONS, IV_LEN, KDF_ALGO, KDF_HASH, PAYLOAD_ALGO,
    SALT_LEN,
};

/// Container format version this engine reads and writes.
pub const FILE_FORMAT_VERSION: u32 = 2;

/// Schema version of the encrypted payload envelope.
pub const PAYLOAD_SCHEMA_VERSION: u32 = 1;

/// Errors raised while sealing, opening, or rewrapping a container.
#[derive(Error, Debug)]
pub enum ContainerError {
    /// The container was written by an engine with an incompatible format.
    #[error("unsupported container format version {found}, expected {FILE_FORMAT_VERSION}")]
    FormatVersionMismatch { found: u32 },

    /// The supplied password does not match the container's KEK fingerprint.
    #[error("wrong password for container")]
    WrongPassword,

    /// The fingerprint matched but unwrap, decrypt, or the plaintext hash
    /// check failed: the container bytes are damaged.
    #[error("container integrity check failed")]
    IntegrityFailure,

    /// The container (or its decrypted payload) is not parseable.
    #[error("corrupted container: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// KDF parameters recorded in the header.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfSection {
    pub algo: String,
    pub hash: String,
    pub iterations: u32,
    #[serde_as(as = "Base64")]
    pub salt_kek: Vec<u8>,
}

/// Payload cipher parameters recorded in the header.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadSection {
    pub algo: String,
    #[serde_as(as = "Base64")]
    pub iv: Vec<u8>,
}

/// Version metadata carried alongside the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMeta {
    pub device_id: String,
    pub version_counter: u64,
    pub last_modified: DateTime<Utc>,
    pub prev_version_counter: Option<u64>,
}

/// Integrity section: SHA-256 of the serialized plaintext envelope.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegritySection {
    #[serde_as(as = "Base64")]
    pub plaintext_sha256: Vec<u8>,
}

/// Cleartext container header.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerHeader {
    pub kdf: KdfSection,
    #[serde_as(as = "Base64")]
    pub kek_fingerprint: Vec<u8>,
    #[serde_as(as = "Base64")]
    pub dek_wrapped: Vec<u8>,
    pub payload: PayloadSection,
    pub meta: ContainerMeta,
    pub integrity: IntegritySection,
}

/// The full encrypted envelope as persisted to the mirror file.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub file_format_version: u32,
    pub header: ContainerHeader,
    #[serde_as(as = "Base64")]
    pub ciphertext: Vec<u8>,
}

impl Container {
    /// Serialize to the JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ContainerError> {
        serde_json::to_vec(self).map_err(|e| ContainerError::Corrupted(e.to_string()))
    }

    /// Parse a container from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContainerError> {
        serde_json::from_slice(bytes).map_err(|e| ContainerError::Corrupted(e.to_string()))
    }
}

/// What actually gets encrypted: a small envelope around the opaque state.
#[derive(Debug, Serialize, Deserialize)]
struct PayloadEnvelope {
    schema_version: u32,
    state: Value,
}

/// Result of successfully opening a container.
#[derive(Debug)]
pub struct OpenedContainer {
    pub state: Value,
    pub meta: ContainerMeta,
}

/// Inputs to [`seal`].
pub struct SealParams<'a> {
    pub state: &'a Value,
    pub password: &'a SecretString,
    pub meta: ContainerMeta,
    /// Header of the container currently on disk, if any. Sealing against it
    /// reuses its salt, iteration count, and (unwrapped) DEK so the mirror
    /// file keeps a stable key lineage across saves.
    pub previous_header: Option<&'a ContainerHeader>,
}

fn effective_iterations(n: u32) -> u32 {
    if n == 0 {
        DEFAULT_KDF_ITERATIONS
    } else {
        n
    }
}

fn map_unwrap_error(err: CryptoError, fingerprint_was_checked: bool) -> ContainerError {
    match err {
        // With a verified fingerprint the KEK is known-good, so an unwrap
        // failure means the wrapped key bytes are damaged.
        CryptoError::KeyUnwrapIntegrityFailed if fingerprint_was_checked => {
            ContainerError::IntegrityFailure
        }
        CryptoError::KeyUnwrapIntegrityFailed => ContainerError::WrongPassword,
        other => ContainerError::Crypto(other),
    }
}

/// Encrypt `state` into a fresh container.
///
/// With a `previous_header`, the KEK salt and iteration count are carried
/// forward and the previous DEK is unwrapped and reused, so the ciphertext
/// lineage survives saves and password checks stay consistent. Without one,
/// a fresh salt and a fresh DEK are generated.
///
/// # Errors
///
/// `ContainerError::WrongPassword` when the password does not match the
/// previous header's fingerprint.
pub fn seal(params: SealParams<'_>) -> Result<Container, ContainerError> {
    let (salt, iterations) = match params.previous_header {
        Some(prev) if !prev.kdf.salt_kek.is_empty() => (
            prev.kdf.salt_kek.clone(),
            effective_iterations(prev.kdf.iterations),
        ),
        _ => (generate_salt().to_vec(), DEFAULT_KDF_ITERATIONS),
    };
    let kek = derive_kek(params.password, &salt, iterations)?;

    let dek = match params.previous_header {
        Some(prev) if !prev.dek_wrapped.is_empty() => {
            let fingerprint_checked = !prev.kek_fingerprint.is_empty();
            if fingerprint_checked && !kek.fingerprint_matches(&prev.kek_fingerprint) {
                return Err(ContainerError::WrongPassword);
            }
            unwrap_dek(&prev.dek_wrapped, &kek)
                .map_err(|e| map_unwrap_error(e, fingerprint_checked))?
        }
        _ => Dek::generate(),
    };
    let dek_wrapped = wrap_dek(&dek, &kek)?;

    let iv = generate_iv();
    let envelope = PayloadEnvelope {
        schema_version: PAYLOAD_SCHEMA_VERSION,
        state: params.state.clone(),
    };
    let plaintext =
        serde_json::to_vec(&envelope).map_err(|e| ContainerError::Corrupted(e.to_string()))?;
    let ciphertext = encrypt_payload(&dek, &iv, &plaintext)?;
    let plaintext_hash = sha256(&plaintext);

    Ok(Container {
        file_format_version: FILE_FORMAT_VERSION,
        header: ContainerHeader {
            kdf: KdfSection {
                algo: KDF_ALGO.to_string(),
                hash: KDF_HASH.to_string(),
                iterations,
                salt_kek: salt,
            },
            kek_fingerprint: kek.fingerprint().to_vec(),
            dek_wrapped,
            payload: PayloadSection {
                algo: PAYLOAD_ALGO.to_string(),
                iv: iv.to_vec(),
            },
            meta: params.meta,
            integrity: IntegritySection {
                plaintext_sha256: plaintext_hash.to_vec(),
            },
        },
        ciphertext,
    })
}

/// Decrypt a container with the given password.
///
/// # Errors
///
/// * `FormatVersionMismatch` - the container is from an incompatible engine
/// * `WrongPassword` - KEK fingerprint mismatch; nothing was unwrapped
/// * `IntegrityFailure` - fingerprint matched but the bytes are damaged
/// * `Corrupted` - malformed header fields or unparsable plaintext
pub fn open(container: &Container, password: &SecretString) -> Result<OpenedContainer, ContainerError> {
    if container.file_format_version != FILE_FORMAT_VERSION {
        return Err(ContainerError::FormatVersionMismatch {
            found: container.file_format_version,
        });
    }
    let header = &container.header;

    let kek = derive_kek(
        password,
        &header.kdf.salt_kek,
        effective_iterations(header.kdf.iterations),
    )?;
    let fingerprint_checked = !header.kek_fingerprint.is_empty();
    if fingerprint_checked && !kek.fingerprint_matches(&header.kek_fingerprint) {
        return Err(ContainerError::WrongPassword);
    }

    let dek =
        unwrap_dek(&header.dek_wrapped, &kek).map_err(|e| map_unwrap_error(e, fingerprint_checked))?;

    let iv: [u8; IV_LEN] = header
        .payload
        .iv
        .as_slice()
        .try_into()
        .map_err(|_| ContainerError::Corrupted("invalid payload IV length".to_string()))?;
    let plaintext =
        decrypt_payload(&dek, &iv, &container.ciphertext).map_err(|_| ContainerError::IntegrityFailure)?;

    if !header.integrity.plaintext_sha256.is_empty()
        && sha256(&plaintext)[..] != header.integrity.plaintext_sha256[..]
    {
        return Err(ContainerError::IntegrityFailure);
    }

    let envelope: PayloadEnvelope = serde_json::from_slice(&plaintext)
        .map_err(|e| ContainerError::Corrupted(format!("payload envelope: {e}")))?;

    Ok(OpenedContainer {
        state: envelope.state,
        meta: header.meta.clone(),
    })
}

/// Options for [`rewrap`]. Defaults mean a fresh random salt and the
/// default iteration count.
#[derive(Debug, Default)]
pub struct RewrapOptions {
    pub salt: Option<[u8; SALT_LEN]>,
    pub iterations: Option<u32>,
}

/// Re-key a container from `old_password` to `new_password`.
///
/// Unwraps the DEK under the old KEK and rewraps it under a KEK derived
/// from the new password with a fresh salt. The ciphertext is untouched,
/// which is what makes password rotation cheap.
pub fn rewrap(
    container: &mut Container,
    old_password: &SecretString,
    new_password: &SecretString,
    options: &RewrapOptions,
) -> Result<(), ContainerError> {
    let header = &container.header;
    let old_kek = derive_kek(
        old_password,
        &header.kdf.salt_kek,
        effective_iterations(header.kdf.iterations),
    )?;
    let fingerprint_checked = !header.kek_fingerprint.is_empty();
    if fingerprint_checked && !old_kek.fingerprint_matches(&header.kek_fingerprint) {
        return Err(ContainerError::WrongPassword);
    }
    let dek = unwrap_dek(&header.dek_wrapped, &old_kek)
        .map_err(|e| map_unwrap_error(e, fingerprint_checked))?;

    let salt = options.salt.unwrap_or_else(generate_salt);
    let iterations = options.iterations.unwrap_or(DEFAULT_KDF_ITERATIONS);
    let new_kek = derive_kek(new_password, &salt, iterations)?;
    let dek_wrapped = wrap_dek(&dek, &new_kek)?;

    container.header.kdf = KdfSection {
        algo: KDF_ALGO.to_string(),
        hash: KDF_HASH.to_string(),
        iterations,
        salt_kek: salt.to_vec(),
    };
    container.header.kek_fingerprint = new_kek.fingerprint().to_vec();
    container.header.dek_wrapped = dek_wrapped;
    Ok(())
}
