use super::models::{PortAllocation, PortRangeRow};
use super::{Store, StoreError};
use crate::config::{PortRangeConfig, ProjectConfig};
use chrono::Utc;
use sqlx::SqliteConnection;

/// Options for a new allocation. Defaults match the most common case of a
/// plain TCP service on the local host.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRequest {
    pub service_type: String,
    pub host: String,
    pub protocol: String,
}

impl Default for AllocationRequest {
    fn default() -> Self {
        Self {
            service_type: "generic".to_string(),
            host: "localhost".to_string(),
            protocol: "tcp".to_string(),
        }
    }
}

impl Store {
    /// Reconciles the configured port ranges into the store. Ranges no
    /// longer present in the configuration are deactivated, never deleted.
    pub async fn sync_port_ranges(&self, ranges: &[PortRangeConfig]) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("UPDATE port_ranges SET active = 0")
            .execute(&mut *tx)
            .await?;
        for range in ranges {
            sqlx::query(
                "INSERT INTO port_ranges (name, start_port, end_port, active)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT (name)
                 DO UPDATE SET start_port = ?2, end_port = ?3, active = 1",
            )
            .bind(&range.name)
            .bind(range.start)
            .bind(range.end)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Replaces the project table with the configured projects.
    pub async fn sync_projects(&self, projects: &[ProjectConfig]) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM projects").execute(&mut *tx).await?;
        for project in projects {
            sqlx::query(
                "INSERT INTO projects (name, working_dir, port_range) VALUES (?1, ?2, ?3)",
            )
            .bind(&project.name)
            .bind(project.working_dir.display().to_string())
            .bind(&project.port_range)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn port_range_by_name(&self, name: &str) -> Result<Option<PortRangeRow>, StoreError> {
        let row = sqlx::query_as::<_, PortRangeRow>(
            "SELECT id, name, start_port, end_port, active
             FROM port_ranges WHERE name = ?1 AND active = 1",
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn project_range(&self, project: &str) -> Result<Option<PortRangeRow>, StoreError> {
        let row = sqlx::query_as::<_, PortRangeRow>(
            "SELECT r.id, r.name, r.start_port, r.end_port, r.active
             FROM port_ranges r JOIN projects p ON p.port_range = r.name
             WHERE p.name = ?1 AND r.active = 1",
        )
        .bind(project)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn active_allocation(
        &self,
        project: &str,
        service_name: &str,
    ) -> Result<Option<PortAllocation>, StoreError> {
        let row = sqlx::query_as::<_, PortAllocation>(
            "SELECT * FROM port_allocations
             WHERE project = ?1 AND service_name = ?2 AND status = 'allocated'",
        )
        .bind(project)
        .bind(service_name)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn active_allocations(
        &self,
        project: Option<&str>,
    ) -> Result<Vec<PortAllocation>, StoreError> {
        let rows = match project {
            Some(project) => {
                sqlx::query_as::<_, PortAllocation>(
                    "SELECT * FROM port_allocations
                     WHERE project = ?1 AND status = 'allocated' ORDER BY port",
                )
                .bind(project)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, PortAllocation>(
                    "SELECT * FROM port_allocations WHERE status = 'allocated' ORDER BY port",
                )
                .fetch_all(self.pool())
                .await?
            }
        };
        Ok(rows)
    }

    /// Returns the lowest port in `range` with no active allocation at
    /// `(host, protocol)`. Read-only; callers needing atomicity with the
    /// subsequent insert go through [`Store::allocate_port`].
    pub async fn find_available_port(
        &self,
        range: &PortRangeRow,
        host: &str,
        protocol: &str,
    ) -> Result<Option<u16>, StoreError> {
        let mut conn = self.pool().acquire().await?;
        lowest_free_port(&mut conn, range, host, protocol).await
    }

    /// Atomic read-then-insert of a new allocation. The whole search and
    /// insert runs under an immediate transaction so concurrent callers
    /// serialize on the database write lock.
    pub async fn allocate_port(
        &self,
        project: &str,
        range: &PortRangeRow,
        service_name: &str,
        request: &AllocationRequest,
    ) -> Result<PortAllocation, StoreError> {
        let mut conn = self.pool().acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result =
            allocate_in_tx(&mut conn, project, range, service_name, request).await;

        match &result {
            Ok(_) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
            }
            Err(_) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            }
        }
        result
    }

    /// Soft delete. Idempotent: releasing an already released or unknown
    /// service reports false and changes nothing.
    pub async fn release_allocation(
        &self,
        project: &str,
        service_name: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE port_allocations
             SET status = 'released', released_at = ?3
             WHERE project = ?1 AND service_name = ?2 AND status = 'allocated'",
        )
        .bind(project)
        .bind(service_name)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records the HTTPS hostname published for an allocation.
    pub async fn set_allocation_hostname(
        &self,
        project: &str,
        port: u16,
        hostname: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE port_allocations SET cloudflare_hostname = ?3
             WHERE project = ?1 AND port = ?2 AND status = 'allocated'",
        )
        .bind(project)
        .bind(port)
        .bind(hostname)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn clear_allocation_hostname(&self, hostname: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE port_allocations SET cloudflare_hostname = NULL
             WHERE cloudflare_hostname = ?1",
        )
        .bind(hostname)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

async fn allocate_in_tx(
    conn: &mut SqliteConnection,
    project: &str,
    range: &PortRangeRow,
    service_name: &str,
    request: &AllocationRequest,
) -> Result<PortAllocation, StoreError> {
    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM port_allocations
         WHERE project = ?1 AND service_name = ?2 AND status = 'allocated'",
    )
    .bind(project)
    .bind(service_name)
    .fetch_optional(&mut *conn)
    .await?;
    if existing.is_some() {
        return Err(StoreError::DuplicateService {
            project: project.to_string(),
            service: service_name.to_string(),
        });
    }

    let port = lowest_free_port(conn, range, &request.host, &request.protocol)
        .await?
        .ok_or_else(|| StoreError::PortExhausted(range.name.clone()))?;

    let allocation = sqlx::query_as::<_, PortAllocation>(
        "INSERT INTO port_allocations
            (project, service_name, port, service_type, host, protocol, status, allocated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'allocated', ?7)
         RETURNING *",
    )
    .bind(project)
    .bind(service_name)
    .bind(port)
    .bind(&request.service_type)
    .bind(&request.host)
    .bind(&request.protocol)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;
    Ok(allocation)
}

async fn lowest_free_port(
    conn: &mut SqliteConnection,
    range: &PortRangeRow,
    host: &str,
    protocol: &str,
) -> Result<Option<u16>, StoreError> {
    let taken: Vec<(u16,)> = sqlx::query_as(
        "SELECT port FROM port_allocations
         WHERE status = 'allocated' AND host = ?1 AND protocol = ?2
           AND port BETWEEN ?3 AND ?4
         ORDER BY port",
    )
    .bind(host)
    .bind(protocol)
    .bind(range.start_port)
    .bind(range.end_port)
    .fetch_all(&mut *conn)
    .await?;

    let mut candidate = range.start_port;
    for (port,) in taken {
        if port > candidate {
            break;
        }
        if candidate == range.end_port {
            return Ok(None);
        }
        candidate = port + 1;
    }
    if candidate > range.end_port {
        return Ok(None);
    }
    Ok(Some(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::path::PathBuf;

    async fn store_with_range(start: u16, end: u16) -> (Store, PortRangeRow) {
        let store = Store::in_memory().await.unwrap();
        store
            .sync_port_ranges(&[PortRangeConfig {
                name: "consilio".to_string(),
                start,
                end,
            }])
            .await
            .unwrap();
        store
            .sync_projects(&[ProjectConfig {
                name: "consilio".to_string(),
                working_dir: PathBuf::from("/srv/consilio"),
                port_range: "consilio".to_string(),
                tools: vec![],
            }])
            .await
            .unwrap();
        let range = store.port_range_by_name("consilio").await.unwrap().unwrap();
        (store, range)
    }

    #[tokio::test]
    async fn allocates_lowest_free_port() {
        let (store, range) = store_with_range(3100, 3199).await;

        let web = store
            .allocate_port("consilio", &range, "web", &AllocationRequest::default())
            .await
            .unwrap();
        assert_eq!(web.port, 3100);

        let api = store
            .allocate_port("consilio", &range, "api", &AllocationRequest::default())
            .await
            .unwrap();
        assert_eq!(api.port, 3101);
    }

    #[tokio::test]
    async fn released_ports_are_reused() {
        let (store, range) = store_with_range(3100, 3199).await;

        store
            .allocate_port("consilio", &range, "web", &AllocationRequest::default())
            .await
            .unwrap();
        assert!(store.release_allocation("consilio", "web").await.unwrap());

        let again = store
            .allocate_port("consilio", &range, "web2", &AllocationRequest::default())
            .await
            .unwrap();
        assert_eq!(again.port, 3100);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (store, range) = store_with_range(3100, 3199).await;
        store
            .allocate_port("consilio", &range, "web", &AllocationRequest::default())
            .await
            .unwrap();

        assert!(store.release_allocation("consilio", "web").await.unwrap());
        assert!(!store.release_allocation("consilio", "web").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_service_is_rejected() {
        let (store, range) = store_with_range(3100, 3199).await;
        store
            .allocate_port("consilio", &range, "web", &AllocationRequest::default())
            .await
            .unwrap();

        assert_matches!(
            store
                .allocate_port("consilio", &range, "web", &AllocationRequest::default())
                .await,
            Err(StoreError::DuplicateService { .. })
        );
    }

    #[tokio::test]
    async fn exhausted_range_is_reported() {
        let (store, range) = store_with_range(3100, 3101).await;
        store
            .allocate_port("consilio", &range, "a", &AllocationRequest::default())
            .await
            .unwrap();
        store
            .allocate_port("consilio", &range, "b", &AllocationRequest::default())
            .await
            .unwrap();

        assert_matches!(
            store
                .allocate_port("consilio", &range, "c", &AllocationRequest::default())
                .await,
            Err(StoreError::PortExhausted(_))
        );
    }

    #[tokio::test]
    async fn different_host_does_not_conflict() {
        let (store, range) = store_with_range(3100, 3199).await;
        store
            .allocate_port("consilio", &range, "web", &AllocationRequest::default())
            .await
            .unwrap();

        let request = AllocationRequest {
            host: "0.0.0.0".to_string(),
            ..Default::default()
        };
        let other = store
            .allocate_port("consilio", &range, "webv6", &request)
            .await
            .unwrap();
        assert_eq!(other.port, 3100);
    }

    #[tokio::test]
    async fn find_available_skips_holes_deterministically() {
        let (store, range) = store_with_range(3100, 3199).await;
        for service in ["a", "b", "c"] {
            store
                .allocate_port("consilio", &range, service, &AllocationRequest::default())
                .await
                .unwrap();
        }
        store.release_allocation("consilio", "b").await.unwrap();

        let free = store
            .find_available_port(&range, "localhost", "tcp")
            .await
            .unwrap();
        assert_eq!(free, Some(3101));
    }
}
