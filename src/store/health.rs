use super::models::TunnelHealthRow;
use super::{Store, StoreError};
use crate::tunnel::TunnelStatus;
use chrono::Utc;

impl Store {
    pub async fn record_tunnel_health(
        &self,
        status: TunnelStatus,
        uptime_s: i64,
        restart_count: i64,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tunnel_health (timestamp, status, uptime_s, restart_count, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(Utc::now())
        .bind(status.to_string())
        .bind(uptime_s)
        .bind(restart_count)
        .bind(last_error)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn recent_tunnel_health(
        &self,
        limit: i64,
    ) -> Result<Vec<TunnelHealthRow>, StoreError> {
        let rows = sqlx::query_as::<_, TunnelHealthRow>(
            "SELECT timestamp, status, uptime_s, restart_count, last_error
             FROM tunnel_health ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
