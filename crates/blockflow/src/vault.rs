//! Encryption boundary for stored provider API keys.
//!
//! Blobs are `base64(nonce || ciphertext || tag)` under AES-256-GCM with a fresh random
//! 96-bit nonce per encryption. The cipher holds no mutable state, so one vault can be
//! shared across every concurrent dispatch.
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::errors::ChatError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    #[error("Vault key must be {expected} bytes, found {found}")]
    InvalidKeyLength { expected: usize, found: usize },

    #[error("Vault key is not valid base64")]
    InvalidKeyEncoding,

    #[error("Credential blob is not valid base64")]
    MalformedBlob,

    #[error("Credential blob is too short to contain a nonce and tag")]
    TruncatedBlob,

    #[error("Credential blob failed authentication")]
    Corrupted,

    #[error("Decrypted credential is not valid UTF-8")]
    InvalidUtf8,

    #[error("Encryption failed")]
    EncryptFailed,
}

impl From<VaultError> for ChatError {
    fn from(err: VaultError) -> Self {
        // VaultError messages never contain key material.
        ChatError::vault_decrypt_failed().with_diagnostic(err.to_string())
    }
}

/// A plaintext secret. Wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret(value.to_string())
    }
}

#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != KEY_LEN {
            return Err(VaultError::InvalidKeyLength {
                expected: KEY_LEN,
                found: key.len(),
            });
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| VaultError::InvalidKeyLength {
            expected: KEY_LEN,
            found: key.len(),
        })?;
        Ok(Self { cipher })
    }

    /// Build a vault from the base64 key held in server configuration
    pub fn from_base64(encoded: &str) -> Result<Self, VaultError> {
        let key = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|_| VaultError::InvalidKeyEncoding)?,
        );
        Self::new(&key)
    }

    /// Generate a fresh base64 key suitable for `from_base64`
    pub fn generate_key() -> String {
        let key = Aes256Gcm::generate_key(OsRng);
        STANDARD.encode(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::EncryptFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> Result<Secret, VaultError> {
        let raw = STANDARD
            .decode(blob.trim())
            .map_err(|_| VaultError::MalformedBlob)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::TruncatedBlob);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::Corrupted)?;

        String::from_utf8(plaintext).map(Secret).map_err(|err| {
            let mut bytes = err.into_bytes();
            bytes.zeroize();
            VaultError::InvalidUtf8
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::sync::Arc;

    fn vault() -> CredentialVault {
        CredentialVault::from_base64(&CredentialVault::generate_key()).unwrap()
    }

    #[test]
    fn test_round_trip() -> Result<(), VaultError> {
        let vault = vault();
        for plaintext in ["sk-test-123", "", "sk-or-v1-ünïcødé-🔑"] {
            let blob = vault.encrypt(plaintext)?;
            assert_ne!(blob, plaintext);
            assert_eq!(vault.decrypt(&blob)?.expose(), plaintext);
        }
        Ok(())
    }

    #[test]
    fn test_nonces_differ() -> Result<(), VaultError> {
        let vault = vault();
        assert_ne!(vault.encrypt("same")?, vault.encrypt("same")?);
        Ok(())
    }

    #[test]
    fn test_corrupted_blob_fails() -> Result<(), VaultError> {
        let vault = vault();
        let blob = vault.encrypt("sk-test-123")?;

        let mut raw = STANDARD.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = STANDARD.encode(&raw);

        assert_eq!(vault.decrypt(&tampered), Err(VaultError::Corrupted));
        Ok(())
    }

    #[test]
    fn test_malformed_blobs_fail() {
        let vault = vault();
        assert_eq!(vault.decrypt("not base64 !!!"), Err(VaultError::MalformedBlob));
        assert_eq!(
            vault.decrypt(&STANDARD.encode([0u8; 8])),
            Err(VaultError::TruncatedBlob)
        );
        assert_eq!(
            vault.decrypt(&STANDARD.encode([0u8; 40])),
            Err(VaultError::Corrupted)
        );
    }

    #[test]
    fn test_wrong_key_fails() -> Result<(), VaultError> {
        let blob = vault().encrypt("sk-test-123")?;
        assert_eq!(vault().decrypt(&blob), Err(VaultError::Corrupted));
        Ok(())
    }

    #[test]
    fn test_invalid_keys() {
        assert_eq!(
            CredentialVault::new(&[0u8; 16]).err(),
            Some(VaultError::InvalidKeyLength {
                expected: 32,
                found: 16
            })
        );
        assert_eq!(
            CredentialVault::from_base64("***").err(),
            Some(VaultError::InvalidKeyEncoding)
        );
    }

    #[test]
    fn test_decrypt_failure_maps_to_vault_error_kind() {
        let err: ChatError = VaultError::Corrupted.into();
        assert_eq!(err.kind, ErrorKind::VaultDecryptFailed);
        assert_eq!(err.message, "Stored credential could not be decrypted");
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("sk-live-abcdef");
        let printed = format!("{:?}", secret);
        assert!(!printed.contains("abcdef"));
    }

    #[test]
    fn test_concurrent_decrypt() -> Result<(), VaultError> {
        let vault = Arc::new(vault());
        let blob = vault.encrypt("sk-shared")?;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let vault = Arc::clone(&vault);
                let blob = blob.clone();
                std::thread::spawn(move || vault.decrypt(&blob).map(|s| s.expose().to_string()))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap()?, "sk-shared");
        }
        Ok(())
    }
}
