//! Encryption at rest for artifacts flagged `encrypt`.
//!
//! Envelope layout on disk:
//!
//! ```text
//! algorithm_id: u8 | nonce: 12 bytes | ciphertext | auth_tag: 16 bytes
//! ```
//!
//! The algorithm id is authenticated as associated data, so a tampered id
//! fails decryption the same way a tampered ciphertext does.
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::Sha256;
use thiserror::Error;

use crate::platform::HostContext;

/// Envelope algorithm id for AES-256-GCM.
pub const ALG_AES_256_GCM: u8 = 0x01;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Fixed application salt for key derivation.
const KDF_SALT: &[u8] = b"statekeep/vault/v1";

/// Errors from the encryption layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The envelope is malformed, uses an unknown algorithm, or fails
    /// authentication.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// No key source is configured or the configured one cannot be read.
    #[error("encryption key unavailable: {0}")]
    KeyUnavailable(String),

    /// The cipher rejected the plaintext.
    #[error("encryption failed")]
    Encryption,
}

/// Where the passphrase for key derivation comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum KeyReference {
    /// Literal passphrase.
    Passphrase(String),
    /// Name of an environment variable holding the passphrase.
    Env(String),
    /// File whose contents (minus a trailing newline) are the passphrase.
    File(PathBuf),
}

impl fmt::Debug for KeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
            Self::Env(var) => f.debug_tuple("Env").field(var).finish(),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// Encrypts and decrypts artifact bytes with a key derived once per run.
///
/// The derived key is the only shared mutable state in a run; it lives
/// behind a single mutex and is wiped by [`Vault::clear`].
pub struct Vault {
    source: Option<KeyReference>,
    env_value: Option<String>,
    iterations: u32,
    key: Mutex<Option<[u8; KEY_LEN]>>,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("source", &self.source)
            .field("iterations", &self.iterations)
            .field("key_cached", &self.is_key_cached())
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Create a vault. `Env` references are looked up in `host`'s
    /// environment rather than the process environment.
    #[must_use]
    pub fn new(source: Option<KeyReference>, iterations: u32, host: &HostContext) -> Self {
        let env_value = match &source {
            Some(KeyReference::Env(var)) => host.env_var(var).map(ToString::to_string),
            _ => None,
        };
        Self {
            source,
            env_value,
            iterations: iterations.max(1),
            key: Mutex::new(None),
        }
    }

    /// A vault with no key source; every encrypt/decrypt fails with
    /// [`CryptoError::KeyUnavailable`].
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            source: None,
            env_value: None,
            iterations: 1,
            key: Mutex::new(None),
        }
    }

    /// Whether a derived key is currently cached.
    #[must_use]
    pub fn is_key_cached(&self) -> bool {
        self.key
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Wipe the cached key. Safe to call any number of times.
    pub fn clear(&self) {
        let mut guard = self
            .key
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(key) = guard.as_mut() {
            key.fill(0);
        }
        *guard = None;
    }

    /// Encrypt `plaintext` into an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyUnavailable`] if no key can be derived, or
    /// [`CryptoError::Encryption`] if the cipher fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.key()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &[ALG_AES_256_GCM],
                },
            )
            .map_err(|_| CryptoError::Encryption)?;

        let mut envelope = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        envelope.push(ALG_AES_256_GCM);
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&sealed);
        Ok(envelope)
    }

    /// Decrypt an envelope produced by [`Vault::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Decryption`] for short envelopes, unknown
    /// algorithm ids and authentication failures, and
    /// [`CryptoError::KeyUnavailable`] if no key can be derived.
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (&alg, rest) = envelope
            .split_first()
            .ok_or_else(|| CryptoError::Decryption("empty envelope".to_string()))?;
        if alg != ALG_AES_256_GCM {
            return Err(CryptoError::Decryption(format!(
                "unknown algorithm id 0x{alg:02x}"
            )));
        }
        if rest.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decryption(format!(
                "envelope too short ({} bytes)",
                envelope.len()
            )));
        }
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let key = self.key()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: &[alg],
                },
            )
            .map_err(|_| CryptoError::Decryption("authentication failed".to_string()))
    }

    fn key(&self) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut guard = self
            .key
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(key) = *guard {
            return Ok(key);
        }
        let passphrase = self.passphrase()?;
        let key = derive_key(passphrase.as_bytes(), KDF_SALT, self.iterations);
        *guard = Some(key);
        Ok(key)
    }

    fn passphrase(&self) -> Result<String, CryptoError> {
        let passphrase = match &self.source {
            None => {
                return Err(CryptoError::KeyUnavailable(
                    "no key source configured".to_string(),
                ));
            }
            Some(KeyReference::Passphrase(p)) => p.clone(),
            Some(KeyReference::Env(var)) => self.env_value.clone().ok_or_else(|| {
                CryptoError::KeyUnavailable(format!("environment variable {var} is not set"))
            })?,
            Some(KeyReference::File(path)) => std::fs::read_to_string(path)
                .map_err(|e| {
                    CryptoError::KeyUnavailable(format!("cannot read {}: {e}", path.display()))
                })?
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        };
        if passphrase.is_empty() {
            return Err(CryptoError::KeyUnavailable("passphrase is empty".to_string()));
        }
        Ok(passphrase)
    }
}

/// PBKDF2-HMAC-SHA256 producing one 32-byte key.
fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key);
    key
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::platform::Os;

    const FAST: u32 = 10;

    fn host() -> HostContext {
        HostContext::new("ws01", "ws01", Os::Linux)
    }

    fn vault(pass: &str) -> Vault {
        Vault::new(Some(KeyReference::Passphrase(pass.to_string())), FAST, &host())
    }

    #[test]
    fn pbkdf2_matches_rfc7914_vector() {
        // RFC 7914 section 11, first 32 bytes of dkLen=64.
        let key = derive_key(b"passwd", b"salt", 1);
        assert_eq!(
            hex::encode(key),
            "55ac046e56e3089fec1691c22544b605f94185216dde0465e68b9d57c20dacbc"
        );
    }

    #[test]
    fn key_derivation_iterates() {
        let key = derive_key(b"password", b"salt", 2);
        assert_eq!(
            hex::encode(key),
            "ae4d0c95af6b46d32d0adff928f06dd02a303f8ef3c251dfd6e2d85a95474c43"
        );
    }

    #[test]
    fn encrypt_then_decrypt_recovers_plaintext() {
        let v = vault("correct horse");
        let envelope = v.encrypt(b"secret settings").unwrap();
        assert_eq!(envelope[0], ALG_AES_256_GCM);
        assert_eq!(envelope.len(), 1 + NONCE_LEN + b"secret settings".len() + TAG_LEN);
        assert_eq!(v.decrypt(&envelope).unwrap(), b"secret settings");
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let v = vault("pw");
        let a = v.encrypt(b"x").unwrap();
        let b = v.encrypt(b"x").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_passphrase_is_a_decryption_error() {
        let envelope = vault("one").encrypt(b"data").unwrap();
        let err = vault("two").decrypt(&envelope).unwrap_err();
        assert!(matches!(err, CryptoError::Decryption(_)));
    }

    #[test]
    fn tampered_algorithm_id_fails_authentication() {
        let v = vault("pw");
        let mut envelope = v.encrypt(b"data").unwrap();
        envelope[0] = 0x02;
        assert!(matches!(v.decrypt(&envelope), Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let v = vault("pw");
        let mut envelope = v.encrypt(b"data").unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0xff;
        assert!(matches!(v.decrypt(&envelope), Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn short_and_empty_envelopes_are_rejected() {
        let v = vault("pw");
        assert!(matches!(v.decrypt(&[]), Err(CryptoError::Decryption(_))));
        assert!(matches!(
            v.decrypt(&[ALG_AES_256_GCM, 1, 2, 3]),
            Err(CryptoError::Decryption(_))
        ));
    }

    #[test]
    fn key_is_cached_and_clear_is_idempotent() {
        let v = vault("pw");
        assert!(!v.is_key_cached());
        v.encrypt(b"x").unwrap();
        assert!(v.is_key_cached());
        v.clear();
        v.clear();
        assert!(!v.is_key_cached());
    }

    #[test]
    fn env_reference_reads_host_environment() {
        let host = host().with_env("BACKUP_KEY", "from-env");
        let a = Vault::new(Some(KeyReference::Env("BACKUP_KEY".to_string())), FAST, &host);
        let b = vault("from-env");
        let envelope = a.encrypt(b"payload").unwrap();
        assert_eq!(b.decrypt(&envelope).unwrap(), b"payload");
    }

    #[test]
    fn missing_env_variable_is_key_unavailable() {
        let v = Vault::new(Some(KeyReference::Env("NOPE".to_string())), FAST, &host());
        assert!(matches!(v.encrypt(b"x"), Err(CryptoError::KeyUnavailable(_))));
    }

    #[test]
    fn file_reference_strips_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.txt");
        std::fs::write(&path, "filepass\n").unwrap();
        let a = Vault::new(Some(KeyReference::File(path)), FAST, &host());
        let envelope = a.encrypt(b"z").unwrap();
        assert_eq!(vault("filepass").decrypt(&envelope).unwrap(), b"z");
    }

    #[test]
    fn disabled_vault_has_no_key() {
        assert!(matches!(
            Vault::disabled().encrypt(b"x"),
            Err(CryptoError::KeyUnavailable(_))
        ));
    }

    #[test]
    fn debug_redacts_passphrase() {
        let text = format!("{:?}", vault("hunter2"));
        assert!(!text.contains("hunter2"));
    }
}
