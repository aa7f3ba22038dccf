//! Passphrase key derivation and AES-256-GCM payload encryption.

use std::fmt;
use std::num::NonZeroU32;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::RngCore;
use ring::pbkdf2;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Result, StoreError};

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

pub const MIN_PASSPHRASE_CHARS: usize = 8;
pub const MIN_KDF_ITERATIONS: u32 = 250_000;

pub const ALGORITHM: &str = "AES-256-GCM";
pub const PAYLOAD_VERSION: u32 = 1;

/// A sealed JSON payload as it sits in the `body` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Base64 of the 12-byte nonce.
    pub nonce: String,
    /// Base64 of ciphertext with the GCM tag appended.
    pub ciphertext: String,
    pub algorithm: String,
    pub version: u32,
}

/// 256-bit key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

pub fn validate_passphrase(passphrase: &str) -> Result<()> {
    if passphrase.chars().count() < MIN_PASSPHRASE_CHARS {
        return Err(StoreError::Validation(format!(
            "Passphrase must be at least {MIN_PASSPHRASE_CHARS} characters"
        )));
    }
    Ok(())
}

pub fn validate_kdf_iterations(iterations: u32) -> Result<()> {
    if iterations < MIN_KDF_ITERATIONS {
        return Err(StoreError::Validation(format!(
            "Key derivation needs at least {MIN_KDF_ITERATIONS} iterations, got {iterations}"
        )));
    }
    Ok(())
}

/// PBKDF2-HMAC-SHA256 over `passphrase` and `salt`. CPU-bound; async callers
/// should run it on a blocking thread.
pub fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> Result<EncryptionKey> {
    validate_passphrase(passphrase)?;
    validate_kdf_iterations(iterations)?;
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| StoreError::Validation("Iteration count must be non-zero".to_string()))?;

    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.as_bytes(),
        &mut key,
    );
    let derived = EncryptionKey(key);
    key.zeroize();
    Ok(derived)
}

/// AES-256-GCM over JSON values. Every call draws its own random nonce.
pub struct Cipher {
    aead: Aes256Gcm,
}

impl Cipher {
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&key.0);
        Self {
            aead: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt_payload(&self, payload: &Value) -> Result<EncryptedPayload> {
        self.encrypt_payload_with_context(payload, &[])
    }

    pub fn decrypt_payload(&self, blob: &EncryptedPayload) -> Result<Value> {
        self.decrypt_payload_with_context(blob, &[])
    }

    /// Encrypt `payload`, authenticating `context` as associated data. The
    /// same context must be supplied to decrypt.
    pub fn encrypt_payload_with_context(
        &self,
        payload: &Value,
        context: &[u8],
    ) -> Result<EncryptedPayload> {
        let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(
                &nonce,
                Payload {
                    msg: &plaintext,
                    aad: context,
                },
            )
            .map_err(|_| StoreError::Storage("Payload encryption failed".to_string()))?;

        Ok(EncryptedPayload {
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
            algorithm: ALGORITHM.to_string(),
            version: PAYLOAD_VERSION,
        })
    }

    pub fn decrypt_payload_with_context(
        &self,
        blob: &EncryptedPayload,
        context: &[u8],
    ) -> Result<Value> {
        if blob.algorithm != ALGORITHM {
            return Err(StoreError::Decryption(format!(
                "Unsupported algorithm: {}",
                blob.algorithm
            )));
        }
        if blob.version != PAYLOAD_VERSION {
            return Err(StoreError::Decryption(format!(
                "Unsupported payload version: {}",
                blob.version
            )));
        }

        let nonce = STANDARD
            .decode(blob.nonce.as_bytes())
            .map_err(|e| StoreError::Decryption(format!("Invalid nonce encoding: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(StoreError::Decryption("Invalid nonce length".to_string()));
        }
        let ciphertext = STANDARD
            .decode(blob.ciphertext.as_bytes())
            .map_err(|e| StoreError::Decryption(format!("Invalid ciphertext encoding: {e}")))?;

        let plaintext = self
            .aead
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: context,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| {
                StoreError::Decryption(
                    "Authentication failed (wrong key or tampered data)".to_string(),
                )
            })?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| StoreError::Decryption(format!("Decrypted payload is not JSON: {e}")))
    }
}
