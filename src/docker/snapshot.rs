use super::{ContainerInventory, NetworkInventory, PortBinding};
use chrono::{DateTime, Utc};

/// Label carrying an explicit project attribution on a container.
pub const PROJECT_LABEL: &str = "com.supervisor.project";

const CLOUDFLARED_NAME_HINT: &str = "cloudflared";

/// Where the tunnel binary runs, as far as the prober can tell. Routing
/// target selection depends on this.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CloudflaredLocation {
    Host,
    Container {
        name: String,
        networks: Vec<String>,
    },
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub project: Option<String>,
    pub networks: Vec<String>,
    pub ports: Vec<PortBinding>,
}

impl ContainerInfo {
    pub fn listens_on(&self, port: u16) -> bool {
        self.ports.iter().any(|p| p.internal == port)
    }

    pub fn host_port_for(&self, internal: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.internal == internal)
            .and_then(|p| p.host)
    }
}

/// Immutable picture of the container topology, published atomically at
/// tick boundaries. Consumers clone the `Arc` and never mutate.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySnapshot {
    pub available: bool,
    pub taken_at: DateTime<Utc>,
    pub containers: Vec<ContainerInfo>,
    pub networks: Vec<String>,
    pub cloudflared: CloudflaredLocation,
}

impl Default for TopologySnapshot {
    fn default() -> Self {
        Self::unavailable()
    }
}

impl TopologySnapshot {
    /// Snapshot standing in while the daemon cannot be reached. Consumers
    /// fall back to host-target assumptions.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            taken_at: Utc::now(),
            containers: Vec::new(),
            networks: Vec::new(),
            cloudflared: CloudflaredLocation::Unknown,
        }
    }

    /// Normalizes one inventory pull. `projects` are the configured
    /// project names used for name-prefix attribution; `host_tunnel`
    /// reports whether a tunnel process is running on the host.
    pub fn from_inventory(
        containers: Vec<ContainerInventory>,
        networks: Vec<NetworkInventory>,
        projects: &[String],
        host_tunnel: bool,
    ) -> Self {
        let containers: Vec<ContainerInfo> = containers
            .into_iter()
            .map(|c| {
                let project = attribute_project(&c, projects);
                ContainerInfo {
                    project,
                    networks: c.networks.keys().cloned().collect(),
                    id: c.id,
                    name: c.name,
                    image: c.image,
                    status: c.status,
                    ports: c.ports,
                }
            })
            .collect();

        // Name/image heuristics first, host process second; first positive wins.
        let cloudflared = containers
            .iter()
            .find(|c| {
                c.name.to_lowercase().contains(CLOUDFLARED_NAME_HINT)
                    || c.image.to_lowercase().contains(CLOUDFLARED_NAME_HINT)
            })
            .map(|c| CloudflaredLocation::Container {
                name: c.name.clone(),
                networks: c.networks.clone(),
            })
            .unwrap_or(if host_tunnel {
                CloudflaredLocation::Host
            } else {
                CloudflaredLocation::Unknown
            });

        Self {
            available: true,
            taken_at: Utc::now(),
            containers,
            networks: networks.into_iter().map(|n| n.name).collect(),
            cloudflared,
        }
    }

    /// The container listening on `port`, preferring one attributed to
    /// `project` when several match.
    pub fn find_container_by_listening_port(
        &self,
        port: u16,
        project: Option<&str>,
    ) -> Option<&ContainerInfo> {
        let mut matches = self.containers.iter().filter(|c| c.listens_on(port));
        match project {
            Some(project) => {
                let mut matches: Vec<&ContainerInfo> = matches.collect();
                matches.sort_by_key(|c| c.project.as_deref() != Some(project));
                matches.into_iter().next()
            }
            None => matches.next(),
        }
    }

    /// Networks shared between `container` and the containerized tunnel.
    /// Empty when the tunnel is on the host or unknown.
    pub fn shared_networks(&self, container: &ContainerInfo) -> Vec<String> {
        match &self.cloudflared {
            CloudflaredLocation::Container { networks, .. } => container
                .networks
                .iter()
                .filter(|n| networks.contains(n))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the tunnel has a path to `container:port`. A shared
    /// network means yes; otherwise only a host port binding that
    /// actually answers a TCP connect counts.
    pub async fn is_reachable(&self, container: &ContainerInfo, port: u16) -> bool {
        if !self.shared_networks(container).is_empty() {
            return true;
        }
        match container.host_port_for(port) {
            Some(host_port) => {
                crate::utils::net::tcp_port_open(
                    "localhost",
                    host_port,
                    std::time::Duration::from_secs(1),
                )
                .await
            }
            None => false,
        }
    }
}

pub(crate) fn attribute_project(
    container: &ContainerInventory,
    projects: &[String],
) -> Option<String> {
    if let Some(label) = container.labels.get(PROJECT_LABEL) {
        return Some(label.clone());
    }
    projects
        .iter()
        .find(|p| container.name.starts_with(&format!("{p}-")))
        .cloned()
}
