use super::models::{SecretMetadata, SecretRow};
use super::{Store, StoreError};
use chrono::{DateTime, Duration, Utc};

/// Filters for metadata listings. All fields are conjunctive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SecretFilter {
    pub scope: Option<String>,
    pub project: Option<String>,
    pub service: Option<String>,
}

impl Store {
    /// Inserts or replaces the encrypted secret at `key_path`.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_secret(
        &self,
        key_path: &str,
        ciphertext: &str,
        iv: &str,
        auth_tag: &str,
        description: &str,
        scope: &str,
        project: Option<&str>,
        service: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO secrets
                (key_path, ciphertext, iv, auth_tag, description, scope, project, service,
                 expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT (key_path) DO UPDATE SET
                ciphertext = ?2, iv = ?3, auth_tag = ?4, description = ?5,
                expires_at = ?9, needs_rotation = 0, updated_at = ?10",
        )
        .bind(key_path)
        .bind(ciphertext)
        .bind(iv)
        .bind(auth_tag)
        .bind(description)
        .bind(scope)
        .bind(project)
        .bind(service)
        .bind(expires_at)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetches the encrypted columns for decryption. Bumps the access
    /// counter; the caller appends the access-log row with the outcome.
    pub async fn fetch_secret(&self, key_path: &str) -> Result<Option<SecretRow>, StoreError> {
        let row = sqlx::query_as::<_, SecretRow>(
            "SELECT key_path, ciphertext, iv, auth_tag FROM secrets WHERE key_path = ?1",
        )
        .bind(key_path)
        .fetch_optional(self.pool())
        .await?;

        if row.is_some() {
            sqlx::query(
                "UPDATE secrets SET access_count = access_count + 1, last_accessed = ?2
                 WHERE key_path = ?1",
            )
            .bind(key_path)
            .bind(Utc::now())
            .execute(self.pool())
            .await?;
        }
        Ok(row)
    }

    pub async fn secret_metadata(
        &self,
        key_path: &str,
    ) -> Result<Option<SecretMetadata>, StoreError> {
        let row = sqlx::query_as::<_, SecretMetadata>(
            "SELECT key_path, description, scope, project, service, expires_at,
                    access_count, last_accessed, needs_rotation, created_at, updated_at
             FROM secrets WHERE key_path = ?1",
        )
        .bind(key_path)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Metadata-only listing; the encrypted columns never leave the store.
    pub async fn list_secrets(
        &self,
        filter: &SecretFilter,
    ) -> Result<Vec<SecretMetadata>, StoreError> {
        let rows = sqlx::query_as::<_, SecretMetadata>(
            "SELECT key_path, description, scope, project, service, expires_at,
                    access_count, last_accessed, needs_rotation, created_at, updated_at
             FROM secrets
             WHERE (?1 IS NULL OR scope = ?1)
               AND (?2 IS NULL OR project = ?2)
               AND (?3 IS NULL OR service = ?3)
             ORDER BY key_path",
        )
        .bind(&filter.scope)
        .bind(&filter.project)
        .bind(&filter.service)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn delete_secret(&self, key_path: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM secrets WHERE key_path = ?1")
            .bind(key_path)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn secrets_expiring_within(
        &self,
        days: i64,
    ) -> Result<Vec<SecretMetadata>, StoreError> {
        let cutoff = Utc::now() + Duration::days(days);
        let rows = sqlx::query_as::<_, SecretMetadata>(
            "SELECT key_path, description, scope, project, service, expires_at,
                    access_count, last_accessed, needs_rotation, created_at, updated_at
             FROM secrets
             WHERE expires_at IS NOT NULL AND expires_at <= ?1
             ORDER BY expires_at",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn secrets_needing_rotation(&self) -> Result<Vec<SecretMetadata>, StoreError> {
        let rows = sqlx::query_as::<_, SecretMetadata>(
            "SELECT key_path, description, scope, project, service, expires_at,
                    access_count, last_accessed, needs_rotation, created_at, updated_at
             FROM secrets WHERE needs_rotation = 1 ORDER BY key_path",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn mark_secret_for_rotation(&self, key_path: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE secrets SET needs_rotation = 1, updated_at = ?2 WHERE key_path = ?1",
        )
        .bind(key_path)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn log_secret_access(
        &self,
        key_path: &str,
        accessed_by: Option<&str>,
        success: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO secret_access_log (key_path, accessed_by, success, accessed_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(key_path)
        .bind(accessed_by)
        .bind(success)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn secret_access_count(&self, key_path: &str) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM secret_access_log WHERE key_path = ?1")
                .bind(key_path)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }
}
