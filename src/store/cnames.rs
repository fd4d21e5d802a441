use super::models::CnameRecord;
use super::{Store, StoreError};
use chrono::Utc;

/// Insert parameters for a published CNAME.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCname {
    pub subdomain: String,
    pub domain: String,
    pub full_hostname: String,
    pub target_service: String,
    pub target_type: String,
    pub container_name: Option<String>,
    pub docker_network: Option<String>,
    pub project: String,
    pub cloudflare_record_id: Option<String>,
    pub created_by: String,
}

impl Store {
    pub async fn insert_cname(&self, cname: &NewCname) -> Result<CnameRecord, StoreError> {
        let record = sqlx::query_as::<_, CnameRecord>(
            "INSERT INTO cnames
                (subdomain, domain, full_hostname, target_service, target_type,
                 container_name, docker_network, project, cloudflare_record_id,
                 created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             RETURNING *",
        )
        .bind(&cname.subdomain)
        .bind(&cname.domain)
        .bind(&cname.full_hostname)
        .bind(&cname.target_service)
        .bind(&cname.target_type)
        .bind(&cname.container_name)
        .bind(&cname.docker_network)
        .bind(&cname.project)
        .bind(&cname.cloudflare_record_id)
        .bind(&cname.created_by)
        .bind(Utc::now())
        .fetch_one(self.pool())
        .await?;
        Ok(record)
    }

    pub async fn cname_by_hostname(
        &self,
        full_hostname: &str,
    ) -> Result<Option<CnameRecord>, StoreError> {
        let record =
            sqlx::query_as::<_, CnameRecord>("SELECT * FROM cnames WHERE full_hostname = ?1")
                .bind(full_hostname)
                .fetch_optional(self.pool())
                .await?;
        Ok(record)
    }

    pub async fn cname_exists(&self, subdomain: &str, domain: &str) -> Result<bool, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM cnames WHERE subdomain = ?1 AND domain = ?2")
                .bind(subdomain)
                .bind(domain)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.is_some())
    }

    pub async fn list_cnames(
        &self,
        project: Option<&str>,
    ) -> Result<Vec<CnameRecord>, StoreError> {
        let rows = match project {
            Some(project) => {
                sqlx::query_as::<_, CnameRecord>(
                    "SELECT * FROM cnames WHERE project = ?1 ORDER BY full_hostname",
                )
                .bind(project)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, CnameRecord>("SELECT * FROM cnames ORDER BY full_hostname")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(rows)
    }

    pub async fn delete_cname(&self, full_hostname: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM cnames WHERE full_hostname = ?1")
            .bind(full_hostname)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_cname(subdomain: &str, project: &str) -> NewCname {
        NewCname {
            subdomain: subdomain.to_string(),
            domain: "153.se".to_string(),
            full_hostname: format!("{subdomain}.153.se"),
            target_service: "http://localhost:3100".to_string(),
            target_type: "localhost".to_string(),
            container_name: None,
            docker_network: None,
            project: project.to_string(),
            cloudflare_record_id: Some("rec-1".to_string()),
            created_by: project.to_string(),
        }
    }

    #[tokio::test]
    async fn insert_lookup_delete_round_trip() {
        let store = Store::in_memory().await.unwrap();

        let record = store.insert_cname(&sample_cname("app", "consilio")).await.unwrap();
        assert_eq!(record.full_hostname, "app.153.se");

        assert!(store.cname_exists("app", "153.se").await.unwrap());
        assert!(store.cname_by_hostname("app.153.se").await.unwrap().is_some());

        assert!(store.delete_cname("app.153.se").await.unwrap());
        assert!(!store.cname_exists("app", "153.se").await.unwrap());
        assert!(!store.delete_cname("app.153.se").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_subdomain_and_domain_is_a_conflict() {
        let store = Store::in_memory().await.unwrap();
        store.insert_cname(&sample_cname("app", "consilio")).await.unwrap();

        let duplicate = store.insert_cname(&sample_cname("app", "other")).await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn listing_filters_by_project() {
        let store = Store::in_memory().await.unwrap();
        store.insert_cname(&sample_cname("app", "consilio")).await.unwrap();
        store.insert_cname(&sample_cname("docs", "other")).await.unwrap();

        assert_eq!(store.list_cnames(None).await.unwrap().len(), 2);
        let mine = store.list_cnames(Some("consilio")).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].subdomain, "app");
    }
}
