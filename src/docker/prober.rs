use super::snapshot::TopologySnapshot;
use super::{ContainerInventory, InventorySource, NetworkInventory};
use crate::store::topology::{ContainerObservation, NetworkObservation, PortObservation};
use crate::store::Store;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const PROBER_TASK_NAME: &str = "topology_prober";

/// Hard budget for one inventory pull. A slow daemon must not wedge the
/// loop past its tick.
const TICK_BUDGET: Duration = Duration::from_secs(5);

/// Read side of the prober: the latest published snapshot.
#[derive(Clone, Default)]
pub struct TopologyHandle {
    snapshot: Arc<RwLock<Arc<TopologySnapshot>>>,
}

impl TopologyHandle {
    pub fn current(&self) -> Arc<TopologySnapshot> {
        self.snapshot
            .read()
            .expect("failed to acquire the lock")
            .clone()
    }

    fn publish(&self, snapshot: TopologySnapshot) {
        *self.snapshot.write().expect("failed to acquire the lock") = Arc::new(snapshot);
    }
}

/// Reports whether a tunnel process is running on the host. Implemented
/// by the tunnel monitor handle; part of cloudflared location detection.
pub trait HostTunnelProbe: Send + Sync {
    fn tunnel_process_running(&self) -> bool;
}

/// Polls the container daemon, publishes immutable snapshots and persists
/// the inventory. Failures are logged and the previous snapshot stands in
/// marked unavailable.
pub struct TopologyProber<S> {
    source: S,
    store: Store,
    projects: Vec<String>,
    host_tunnel: Arc<dyn HostTunnelProbe>,
    handle: TopologyHandle,
    poll_interval: Duration,
}

impl<S> TopologyProber<S>
where
    S: InventorySource + Send + Sync + 'static,
{
    pub fn new(
        source: S,
        store: Store,
        projects: Vec<String>,
        host_tunnel: Arc<dyn HostTunnelProbe>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            store,
            projects,
            host_tunnel,
            handle: TopologyHandle::default(),
            poll_interval,
        }
    }

    pub fn handle(&self) -> TopologyHandle {
        self.handle.clone()
    }

    /// Runs the poll loop until `shutdown` flips. The in-flight tick
    /// finishes within its own budget.
    pub fn spawn(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    _ = shutdown.changed() => {
                        debug!(task = PROBER_TASK_NAME, "stopping");
                        break;
                    }
                }
            }
        })
    }

    pub async fn tick(&self) {
        let pulled = tokio::time::timeout(TICK_BUDGET, self.pull()).await;
        match pulled {
            Ok(Ok((containers, networks))) => {
                let snapshot = TopologySnapshot::from_inventory(
                    containers.clone(),
                    networks.clone(),
                    &self.projects,
                    self.host_tunnel.tunnel_process_running(),
                );
                debug!(
                    containers = snapshot.containers.len(),
                    networks = snapshot.networks.len(),
                    "topology refreshed"
                );
                self.handle.publish(snapshot);

                let observations = to_observations(&containers, &self.projects);
                let network_rows = to_network_observations(&networks);
                if let Err(err) = self.store.persist_topology(&observations, &network_rows).await {
                    warn!(error_msg = %err, "persisting topology inventory");
                }
            }
            Ok(Err(err)) => {
                warn!(error_msg = %err, "docker inventory unavailable");
                self.handle.publish(TopologySnapshot::unavailable());
            }
            Err(_) => {
                warn!(budget_s = TICK_BUDGET.as_secs(), "docker inventory pull timed out");
                self.handle.publish(TopologySnapshot::unavailable());
            }
        }
    }

    async fn pull(
        &self,
    ) -> Result<(Vec<ContainerInventory>, Vec<NetworkInventory>), super::DockerError> {
        let containers = self.source.containers().await?;
        let networks = self.source.networks().await?;
        Ok((containers, networks))
    }
}

fn to_observations(
    containers: &[ContainerInventory],
    projects: &[String],
) -> Vec<ContainerObservation> {
    containers
        .iter()
        .map(|c| ContainerObservation {
            container_id: c.id.clone(),
            name: c.name.clone(),
            image: c.image.clone(),
            status: c.status.clone(),
            project: super::snapshot::attribute_project(c, projects),
            networks: c
                .networks
                .iter()
                .map(|(name, ip)| (name.clone(), ip.clone()))
                .collect(),
            ports: c
                .ports
                .iter()
                .map(|p| PortObservation {
                    internal_port: p.internal,
                    host_port: p.host,
                    protocol: p.protocol.clone(),
                })
                .collect(),
        })
        .collect()
}

fn to_network_observations(networks: &[NetworkInventory]) -> Vec<NetworkObservation> {
    networks
        .iter()
        .map(|n| NetworkObservation {
            network_id: n.id.clone(),
            name: n.name.clone(),
            driver: n.driver.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::snapshot::tests::inventory;
    use crate::docker::tests::MockInventorySource;

    struct NoHostTunnel;
    impl HostTunnelProbe for NoHostTunnel {
        fn tunnel_process_running(&self) -> bool {
            false
        }
    }

    async fn prober_with(source: MockInventorySource) -> TopologyProber<MockInventorySource> {
        TopologyProber::new(
            source,
            Store::in_memory().await.unwrap(),
            vec!["consilio".to_string()],
            Arc::new(NoHostTunnel),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn tick_publishes_snapshot_and_persists() {
        let mut source = MockInventorySource::new();
        source.should_list(
            vec![inventory("consilio-web", "img", &["consilio-net"], &[(3105, None)])],
            vec![],
        );
        let prober = prober_with(source).await;
        let handle = prober.handle();

        prober.tick().await;

        let snapshot = handle.current();
        assert!(snapshot.available);
        assert_eq!(snapshot.containers.len(), 1);
        assert_eq!(snapshot.containers[0].project.as_deref(), Some("consilio"));
        assert_eq!(prober.store.container_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unreachable_daemon_publishes_unavailable_snapshot() {
        let mut source = MockInventorySource::new();
        source.should_be_unreachable();
        let prober = prober_with(source).await;
        let handle = prober.handle();

        prober.tick().await;

        let snapshot = handle.current();
        assert!(!snapshot.available);
        assert!(snapshot.containers.is_empty());
    }
}
