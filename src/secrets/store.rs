use super::crypto::{CryptoBox, CryptoError, EncryptedPayload, MasterKey};
use crate::store::models::SecretMetadata;
pub use crate::store::secrets::SecretFilter;
use crate::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

const MIN_DESCRIPTION_LEN: usize = 10;
const KEY_PATH_PATTERN: &str = r"^(meta|project|service)/[a-z0-9_-]+/[a-z0-9_-]+$";

#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("{0}")]
    Validation(String),

    #[error("secret `{0}` not found")]
    NotFound(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parsed key path: `scope/owner/name` under the grammar in
/// [`KEY_PATH_PATTERN`].
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPath {
    pub scope: String,
    pub owner: String,
    pub name: String,
}

impl KeyPath {
    fn project(&self) -> Option<&str> {
        (self.scope == "project").then_some(self.owner.as_str())
    }

    fn service(&self) -> Option<&str> {
        (self.scope == "service").then_some(self.owner.as_str())
    }
}

/// Encrypted hierarchical key/value store. Plaintext exists only between
/// the crypto box and the caller of `get`; listings, audit rows and
/// errors never carry it.
pub struct SecretsStore {
    store: Store,
    crypto: CryptoBox,
    key_path_re: Regex,
}

impl SecretsStore {
    pub fn new(store: Store, master_key: &MasterKey) -> Self {
        Self {
            store,
            crypto: CryptoBox::new(master_key),
            key_path_re: Regex::new(KEY_PATH_PATTERN).expect("key path regex must compile"),
        }
    }

    pub fn parse_key_path(&self, key_path: &str) -> Result<KeyPath, SecretsError> {
        if !self.key_path_re.is_match(key_path) {
            return Err(SecretsError::Validation(format!(
                "key path `{key_path}` does not match `{KEY_PATH_PATTERN}`"
            )));
        }
        let mut segments = key_path.splitn(3, '/');
        Ok(KeyPath {
            scope: segments.next().unwrap_or_default().to_string(),
            owner: segments.next().unwrap_or_default().to_string(),
            name: segments.next().unwrap_or_default().to_string(),
        })
    }

    pub async fn set(
        &self,
        key_path: &str,
        plaintext: &str,
        description: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<SecretMetadata, SecretsError> {
        let parsed = self.parse_key_path(key_path)?;
        if description.chars().count() < MIN_DESCRIPTION_LEN {
            return Err(SecretsError::Validation(format!(
                "description must be at least {MIN_DESCRIPTION_LEN} characters"
            )));
        }

        let payload: EncryptedPayload = self.crypto.encrypt(plaintext.as_bytes())?;
        self.store
            .upsert_secret(
                key_path,
                &payload.ciphertext_hex(),
                &payload.iv_hex(),
                &payload.tag_hex(),
                description,
                &parsed.scope,
                parsed.project(),
                parsed.service(),
                expires_at,
            )
            .await?;

        debug!(key_path, "secret stored");
        self.store
            .secret_metadata(key_path)
            .await?
            .ok_or_else(|| SecretsError::NotFound(key_path.to_string()))
    }

    /// The only path that returns plaintext. Every call appends an
    /// access-log row with its outcome.
    pub async fn get(
        &self,
        key_path: &str,
        accessed_by: Option<&str>,
    ) -> Result<String, SecretsError> {
        let row = match self.store.fetch_secret(key_path).await? {
            Some(row) => row,
            None => {
                self.store
                    .log_secret_access(key_path, accessed_by, false)
                    .await?;
                return Err(SecretsError::NotFound(key_path.to_string()));
            }
        };

        let payload = EncryptedPayload::from_hex_parts(&row.iv, &row.ciphertext, &row.auth_tag)?;
        let plaintext = match self.crypto.decrypt(&payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key_path, "secret failed decryption");
                self.store
                    .log_secret_access(key_path, accessed_by, false)
                    .await?;
                return Err(err.into());
            }
        };

        self.store
            .log_secret_access(key_path, accessed_by, true)
            .await?;
        String::from_utf8(plaintext)
            .map_err(|_| SecretsError::Validation("secret payload is not valid UTF-8".to_string()))
    }

    /// Metadata only; values never appear in listings.
    pub async fn list(&self, filter: &SecretFilter) -> Result<Vec<SecretMetadata>, SecretsError> {
        Ok(self.store.list_secrets(filter).await?)
    }

    pub async fn delete(&self, key_path: &str) -> Result<(), SecretsError> {
        if !self.store.delete_secret(key_path).await? {
            return Err(SecretsError::NotFound(key_path.to_string()));
        }
        debug!(key_path, "secret deleted");
        Ok(())
    }

    pub async fn get_expiring_soon(&self, days: i64) -> Result<Vec<SecretMetadata>, SecretsError> {
        Ok(self.store.secrets_expiring_within(days).await?)
    }

    pub async fn get_needing_rotation(&self) -> Result<Vec<SecretMetadata>, SecretsError> {
        Ok(self.store.secrets_needing_rotation().await?)
    }

    pub async fn mark_for_rotation(&self, key_path: &str) -> Result<(), SecretsError> {
        if !self.store.mark_secret_for_rotation(key_path).await? {
            return Err(SecretsError::NotFound(key_path.to_string()));
        }
        Ok(())
    }
}
