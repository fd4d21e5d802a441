//! Docker-like topology: container/network inventory, cached snapshots
//! and the background prober that keeps them fresh.

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::network::ListNetworksOptions;
use bollard::Docker;
use std::collections::HashMap;
use thiserror::Error;

pub mod prober;
pub mod snapshot;

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("docker daemon unreachable: `{0}`")]
    Unreachable(String),

    #[error("docker api error: `{0}`")]
    Api(String),
}

/// Raw container inventory as reported by the daemon, before snapshot
/// normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInventory {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub labels: HashMap<String, String>,
    /// network name -> ip address
    pub networks: HashMap<String, Option<String>>,
    pub ports: Vec<PortBinding>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortBinding {
    pub internal: u16,
    pub host: Option<u16>,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInventory {
    pub id: String,
    pub name: String,
    pub driver: String,
}

/// Seam over the container daemon. The production implementation talks to
/// Docker through [`bollard`]; tests script inventories directly.
#[async_trait]
pub trait InventorySource {
    async fn containers(&self) -> Result<Vec<ContainerInventory>, DockerError>;
    async fn networks(&self) -> Result<Vec<NetworkInventory>, DockerError>;
}

pub struct DockerInventory {
    docker: Docker,
}

impl DockerInventory {
    pub fn connect() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| DockerError::Unreachable(err.to_string()))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl InventorySource for DockerInventory {
    async fn containers(&self) -> Result<Vec<ContainerInventory>, DockerError> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|err| DockerError::Api(err.to_string()))?;

        let containers = summaries
            .into_iter()
            .map(|summary| {
                let name = summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let networks = summary
                    .network_settings
                    .and_then(|settings| settings.networks)
                    .map(|networks| {
                        networks
                            .into_iter()
                            .map(|(network, endpoint)| {
                                (network, endpoint.ip_address.filter(|ip| !ip.is_empty()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let ports = summary
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|port| {
                        Some(PortBinding {
                            internal: u16::try_from(port.private_port).ok()?,
                            host: port.public_port.and_then(|p| u16::try_from(p).ok()),
                            protocol: port
                                .typ
                                .map(|t| t.to_string().to_lowercase())
                                .unwrap_or_else(|| "tcp".to_string()),
                        })
                    })
                    .collect();

                ContainerInventory {
                    id: summary.id.unwrap_or_default(),
                    name,
                    image: summary.image.unwrap_or_default(),
                    status: summary.state.map(|s| s.to_string()).unwrap_or_default(),
                    labels: summary.labels.unwrap_or_default(),
                    networks,
                    ports,
                }
            })
            .collect();
        Ok(containers)
    }

    async fn networks(&self) -> Result<Vec<NetworkInventory>, DockerError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await
            .map_err(|err| DockerError::Api(err.to_string()))?;

        Ok(networks
            .into_iter()
            .map(|network| NetworkInventory {
                id: network.id.unwrap_or_default(),
                name: network.name.unwrap_or_default(),
                driver: network.driver.unwrap_or_default(),
            })
            .collect())
    }
}
