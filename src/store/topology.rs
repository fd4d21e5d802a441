use super::{Store, StoreError};
use chrono::Utc;

/// One observed container with its network attachments and port map, as
/// reported by the topology prober.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerObservation {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub project: Option<String>,
    /// (network name, ip address) pairs.
    pub networks: Vec<(String, Option<String>)>,
    pub ports: Vec<PortObservation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortObservation {
    pub internal_port: u16,
    pub host_port: Option<u16>,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkObservation {
    pub network_id: String,
    pub name: String,
    pub driver: String,
}

impl Store {
    /// Persists one prober tick. Rows not seen for two consecutive ticks
    /// are pruned; edge rows follow their container via cascade.
    pub async fn persist_topology(
        &self,
        containers: &[ContainerObservation],
        networks: &[NetworkObservation],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        let (current,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(generation) FROM containers")
                .fetch_one(&mut *tx)
                .await?;
        let generation = current.unwrap_or(0) + 1;
        let now = Utc::now();

        for network in networks {
            sqlx::query(
                "INSERT INTO networks (network_id, name, driver, generation)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (network_id)
                 DO UPDATE SET name = ?2, driver = ?3, generation = ?4",
            )
            .bind(&network.network_id)
            .bind(&network.name)
            .bind(&network.driver)
            .bind(generation)
            .execute(&mut *tx)
            .await?;
        }

        for container in containers {
            let (row_id,): (i64,) = sqlx::query_as(
                "INSERT INTO containers
                    (container_id, name, image, status, project, generation, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (container_id)
                 DO UPDATE SET name = ?2, image = ?3, status = ?4, project = ?5,
                               generation = ?6, last_seen = ?7
                 RETURNING id",
            )
            .bind(&container.container_id)
            .bind(&container.name)
            .bind(&container.image)
            .bind(&container.status)
            .bind(&container.project)
            .bind(generation)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM container_networks WHERE container_id = ?1")
                .bind(row_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM container_ports WHERE container_id = ?1")
                .bind(row_id)
                .execute(&mut *tx)
                .await?;

            for (network_name, ip) in &container.networks {
                sqlx::query(
                    "INSERT INTO container_networks (container_id, network_id, ip_address)
                     SELECT ?1, id, ?3 FROM networks WHERE name = ?2",
                )
                .bind(row_id)
                .bind(network_name)
                .bind(ip)
                .execute(&mut *tx)
                .await?;
            }
            for port in &container.ports {
                sqlx::query(
                    "INSERT INTO container_ports (container_id, internal_port, host_port, protocol)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (container_id, internal_port, protocol) DO UPDATE SET host_port = ?3",
                )
                .bind(row_id)
                .bind(port.internal_port)
                .bind(port.host_port)
                .bind(&port.protocol)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("DELETE FROM containers WHERE generation <= ?1")
            .bind(generation - 2)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM networks WHERE generation <= ?1")
            .bind(generation - 2)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn container_count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM containers")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}
