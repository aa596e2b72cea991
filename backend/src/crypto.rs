//! Credential encryption at rest.
//!
//! Format: base64(nonce_12bytes || ciphertext || tag_16bytes)

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as Base64Engine;
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::error::{ProvisioningError, ProvisioningResult};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> ProvisioningResult<String>;

    /// Fails with `Crypto` on malformed or tampered input, never panics.
    fn decrypt(&self, ciphertext: &str) -> ProvisioningResult<String>;
}

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Derives the 256-bit key from an arbitrary-length secret.
    pub fn from_secret(secret: &str) -> ProvisioningResult<Self> {
        if secret.trim().is_empty() {
            return Err(ProvisioningError::Crypto(
                "encryption secret is not configured".into(),
            ));
        }
        let key = Sha256::digest(secret.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| ProvisioningError::Crypto("invalid key".into()))?;
        Ok(Self { cipher })
    }
}

impl CredentialCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> ProvisioningResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| ProvisioningError::Crypto("encryption failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(Base64Engine.encode(blob))
    }

    fn decrypt(&self, ciphertext: &str) -> ProvisioningResult<String> {
        let data = Base64Engine
            .decode(ciphertext.trim())
            .map_err(|_| ProvisioningError::Crypto("base64 decode failed".into()))?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(ProvisioningError::Crypto("ciphertext too short".into()));
        }

        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| {
                ProvisioningError::Crypto("decryption failed (wrong key or tampered data)".into())
            })?;
        String::from_utf8(plaintext)
            .map_err(|_| ProvisioningError::Crypto("decrypted data is not valid UTF-8".into()))
    }
}
