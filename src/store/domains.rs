use super::models::DomainRow;
use super::{Store, StoreError};
use chrono::{Duration, Utc};

impl Store {
    /// Replaces the cached zone list with a fresh discovery result.
    pub async fn upsert_domains(&self, zones: &[(String, String)]) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;
        let now = Utc::now();
        for (domain, zone_id) in zones {
            sqlx::query(
                "INSERT INTO cloudflare_domains (domain, zone_id, last_seen)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (domain) DO UPDATE SET zone_id = ?2, last_seen = ?3",
            )
            .bind(domain)
            .bind(zone_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn domain(&self, domain: &str) -> Result<Option<DomainRow>, StoreError> {
        let row = sqlx::query_as::<_, DomainRow>(
            "SELECT domain, zone_id, last_seen FROM cloudflare_domains WHERE domain = ?1",
        )
        .bind(domain)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn domains(&self) -> Result<Vec<DomainRow>, StoreError> {
        let rows = sqlx::query_as::<_, DomainRow>(
            "SELECT domain, zone_id, last_seen FROM cloudflare_domains ORDER BY domain",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// True when the zone cache is empty or has not been refreshed within
    /// `max_age_hours`.
    pub async fn domains_need_refresh(&self, max_age_hours: i64) -> Result<bool, StoreError> {
        // MAX() over an empty table yields a single NULL row.
        let (newest,): (Option<chrono::DateTime<Utc>>,) =
            sqlx::query_as("SELECT MAX(last_seen) FROM cloudflare_domains")
                .fetch_one(self.pool())
                .await?;
        match newest {
            None => Ok(true),
            Some(last_seen) => Ok(Utc::now() - last_seen > Duration::hours(max_age_hours)),
        }
    }
}
