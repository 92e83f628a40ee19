//! AES-256-GCM encryption for database passwords held in the account store.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

const ENVELOPE_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("credential key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("failed to encrypt credential")]
    Encrypt,
    #[error("failed to decrypt credential: {0}")]
    Decrypt(String),
}

/// Seals secrets as `enc:v1:<base64(nonce || ciphertext)>`.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

impl CredentialCipher {
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(format!("{ENVELOPE_PREFIX}{}", STANDARD.encode(sealed)))
    }

    /// Values without the envelope prefix were stored before a key was configured and
    /// are returned unchanged.
    pub fn decrypt(&self, stored: &str) -> Result<String, CipherError> {
        let Some(encoded) = stored.strip_prefix(ENVELOPE_PREFIX) else {
            return Ok(stored.to_owned());
        };

        let sealed = STANDARD
            .decode(encoded)
            .map_err(|err| CipherError::Decrypt(err.to_string()))?;
        if sealed.len() < NONCE_LEN {
            return Err(CipherError::Decrypt("envelope too short".into()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Decrypt("authentication failed".into()))?;
        String::from_utf8(plaintext).map_err(|err| CipherError::Decrypt(err.to_string()))
    }

    pub fn is_sealed(stored: &str) -> bool {
        stored.starts_with(ENVELOPE_PREFIX)
    }
}
