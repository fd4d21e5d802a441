use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;
use std::path::Path;
use thiserror::Error;
use tracing::error;

/// AES-256-GCM nonce size. The tag adds another 16 bytes, kept separate
/// from the ciphertext in storage.
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("master key file `{path}` could not be read: {err}")]
    KeyFileUnreadable { path: String, err: String },

    #[error("master key must be {KEY_LEN} bytes, hex or base64 encoded")]
    InvalidKey,

    #[error("missing master key: set `crypto.key_file` or SC_MASTER_KEY_FILE")]
    MissingKey,

    #[error("authentication tag mismatch")]
    TagMismatch,

    #[error("malformed encrypted payload: {0}")]
    MalformedPayload(String),
}

/// Process-wide symmetric key, loaded once at startup and read-only after.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Reads the key from a file containing the key hex or base64 encoded.
    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let content =
            std::fs::read_to_string(path).map_err(|err| CryptoError::KeyFileUnreadable {
                path: path.display().to_string(),
                err: err.to_string(),
            })?;
        Self::parse(content.trim())
    }

    /// Accepts a 64-char hex string or the base64 encoding of 32 bytes.
    pub fn parse(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded)
            .ok()
            .or_else(|| BASE64_STANDARD.decode(encoded).ok())
            .ok_or(CryptoError::InvalidKey)?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(key))
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self([7u8; KEY_LEN])
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material never reaches logs.
        write!(f, "MasterKey(..)")
    }
}

/// Encryption output with the tag split from the ciphertext, matching the
/// storage columns.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedPayload {
    pub iv: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

impl EncryptedPayload {
    pub fn from_hex_parts(iv: &str, ciphertext: &str, tag: &str) -> Result<Self, CryptoError> {
        let decode = |name: &str, value: &str| {
            hex::decode(value)
                .map_err(|err| CryptoError::MalformedPayload(format!("{name}: {err}")))
        };
        Ok(Self {
            iv: decode("iv", iv)?,
            ciphertext: decode("ciphertext", ciphertext)?,
            tag: decode("auth_tag", tag)?,
        })
    }

    pub fn iv_hex(&self) -> String {
        hex::encode(&self.iv)
    }

    pub fn ciphertext_hex(&self) -> String {
        hex::encode(&self.ciphertext)
    }

    pub fn tag_hex(&self) -> String {
        hex::encode(&self.tag)
    }
}

/// Authenticated symmetric encryption of secret payloads.
pub struct CryptoBox {
    cipher: Aes256Gcm,
}

impl CryptoBox {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0)),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
        let mut iv = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::TagMismatch)?;

        // aes-gcm appends the tag to the ciphertext.
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        Ok(EncryptedPayload {
            iv: iv.to_vec(),
            ciphertext: sealed,
            tag,
        })
    }

    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
        if payload.iv.len() != NONCE_LEN || payload.tag.len() != TAG_LEN {
            return Err(CryptoError::MalformedPayload(format!(
                "iv must be {NONCE_LEN} bytes and tag {TAG_LEN} bytes"
            )));
        }

        let mut sealed = payload.ciphertext.clone();
        sealed.extend_from_slice(&payload.tag);

        self.cipher
            .decrypt(Nonce::from_slice(&payload.iv), sealed.as_ref())
            .map_err(|_| {
                error!("secret payload failed authentication");
                CryptoError::TagMismatch
            })
    }
}
