use super::models::AuditRow;
use super::{Store, StoreError};
use chrono::Utc;

impl Store {
    /// Appends an audit entry. The log is append-only; there is no update
    /// or delete path.
    pub async fn record_audit(
        &self,
        action: &str,
        project: Option<&str>,
        details: &serde_json::Value,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_log (timestamp, action, project, details, success, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(Utc::now())
        .bind(action)
        .bind(project)
        .bind(details.to_string())
        .bind(success)
        .bind(error_message)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditRow>, StoreError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT timestamp, action, project, details, success, error_message
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
