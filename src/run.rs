//! Process lifecycle: wiring every component together at startup and
//! tearing them down in order on a stop request.

use crate::cloudflare::{CloudflareClient, DnsApi};
use crate::cname::CnameLifecycle;
use crate::config::{ConfigError, ControlPlaneConfig};
use crate::docker::prober::{TopologyHandle, TopologyProber};
use crate::docker::DockerInventory;
use crate::ingress::IngressFileManager;
use crate::ports::PortAllocator;
use crate::rpc::registry::{RegistryError, ToolRegistry};
use crate::rpc::router::RpcRouter;
use crate::rpc::server::{run_server, RpcServerError, ServerState};
use crate::rpc::tools::{register_builtin_tools, ToolDeps};
use crate::secrets::crypto::{CryptoError, MasterKey};
use crate::secrets::detector::SecretDetector;
use crate::secrets::store::SecretsStore;
use crate::shutdown::{ShutdownWaiter, StopReason};
use crate::store::{Store, StoreError};
use crate::tunnel::monitor::{HttpPinger, TunnelMonitor};
use crate::tunnel::process::CloudflaredProcess;
use crate::tunnel::TunnelError;
use crate::utils::retry::retry_async;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Key path the Cloudflare API token is expected under.
const CLOUDFLARE_TOKEN_KEY_PATH: &str = "meta/cloudflare/api_token";
const ZONE_CACHE_MAX_AGE_HOURS: i64 = 24;
const ZONE_DISCOVERY_ATTEMPTS: usize = 3;
const ZONE_DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("configuration error: `{0}`")]
    Config(#[from] ConfigError),

    #[error("crypto initialization failed: `{0}`")]
    Crypto(#[from] CryptoError),

    #[error("store initialization failed: `{0}`")]
    Store(#[from] StoreError),

    #[error("tool registration failed: `{0}`")]
    Registry(#[from] RegistryError),

    #[error("tunnel error: `{0}`")]
    Tunnel(#[from] TunnelError),

    #[error("http server error: `{0}`")]
    Server(#[from] RpcServerError),

    #[error("runtime error: `{0}`")]
    Runtime(String),
}

pub struct ControlPlaneRunner {
    config: ControlPlaneConfig,
    config_path: PathBuf,
    shutdown: ShutdownWaiter,
}

impl ControlPlaneRunner {
    pub fn new(
        config: ControlPlaneConfig,
        config_path: PathBuf,
        shutdown: ShutdownWaiter,
    ) -> Self {
        Self {
            config,
            config_path,
            shutdown,
        }
    }

    /// Brings the whole control plane up, then parks the calling thread
    /// on the shutdown channel until a stop is requested.
    pub fn run(self) -> Result<(), ControlPlaneError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| ControlPlaneError::Runtime(err.to_string()))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let started = runtime.block_on(self.start_components(shutdown_rx))?;

        // The main thread owns the lifecycle; everything else runs on the
        // tokio workers.
        let server_handle = started.server.handle();
        let server_task = runtime.spawn(started.server);

        info!("control plane started");
        match self.shutdown.wait() {
            StopReason::Requested => info!("stop requested"),
            StopReason::Abandoned => warn!("shutdown channel abandoned, stopping"),
        }

        // Stop accepting new requests and drain in-flight ones, then stop
        // the background loops; the monitor stops the tunnel process on
        // its way out.
        runtime.block_on(async {
            server_handle.stop(true).await;
            let _ = server_task.await;
            let _ = shutdown_tx.send(true);
            for handle in started.background {
                let _ = handle.await;
            }
        });

        info!("control plane stopped");
        Ok(())
    }

    async fn start_components(
        &self,
        shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> Result<StartedComponents, ControlPlaneError> {
        let config = &self.config;

        // Crypto key before anything that needs decryption.
        let key_file = config
            .crypto
            .key_file
            .as_deref()
            .ok_or(CryptoError::MissingKey)?;
        let master_key = MasterKey::from_file(key_file)?;

        // Durable state and schema.
        let store = Store::connect(&config.database.url).await?;
        store.sync_port_ranges(&config.port_ranges).await?;
        store.sync_projects(&config.projects).await?;

        let secrets = Arc::new(SecretsStore::new(store.clone(), &master_key));
        let detector = Arc::new(SecretDetector::new());
        let allocator = Arc::new(PortAllocator::new(store.clone()));

        // DNS client; the token lives in the secrets store.
        let api_token = match secrets.get(CLOUDFLARE_TOKEN_KEY_PATH, None).await {
            Ok(token) => token,
            Err(err) => {
                warn!(
                    error_msg = %err,
                    "cloudflare token unavailable, dns operations will fail until one is stored"
                );
                String::new()
            }
        };
        let dns: Arc<dyn DnsApi> = Arc::new(
            CloudflareClient::new(config.cloudflare.api_base.clone(), api_token)
                .map_err(|err| ControlPlaneError::Runtime(err.to_string()))?,
        );
        refresh_zone_cache(&store, dns.as_ref()).await;

        // Tunnel process ownership and monitoring.
        let process = Arc::new(CloudflaredProcess::new(
            config.tunnel.binary.clone(),
            config.tunnel.config_file.clone(),
        ));
        let pinger = Arc::new(HttpPinger::new(config.tunnel.metrics_port)?);
        let monitor = Arc::new(TunnelMonitor::new(
            process,
            pinger,
            store.clone(),
            config.tunnel.check_interval,
        ));
        if let Err(err) = monitor.start() {
            // The monitor recovers with backoff; a failed first spawn is
            // logged, not fatal.
            warn!(error_msg = %err, "initial tunnel spawn failed");
        }

        // Topology prober, optional when the daemon is unreachable.
        let project_names: Vec<String> =
            config.projects.iter().map(|p| p.name.clone()).collect();
        let mut background = Vec::new();
        let topology = match DockerInventory::connect() {
            Ok(source) => {
                let prober = TopologyProber::new(
                    source,
                    store.clone(),
                    project_names,
                    monitor.clone(),
                    config.docker.poll_interval,
                );
                let handle = prober.handle();
                background.push(prober.spawn(shutdown_rx.clone()));
                handle
            }
            Err(err) => {
                warn!(error_msg = %err, "docker unavailable, topology stays unknown");
                TopologyHandle::default()
            }
        };
        background.push(monitor.clone().spawn_loop(shutdown_rx));

        // CNAME lifecycle over the shared pieces.
        let ingress = Arc::new(IngressFileManager::new(config.tunnel.config_file.clone()));
        let lifecycle = Arc::new(CnameLifecycle::new(
            store.clone(),
            dns,
            ingress,
            topology.clone(),
            monitor.clone(),
            config.tunnel.id.clone(),
            config.cloudflare.default_domain.clone(),
        ));

        // Tools, endpoints, router, transport.
        let registry = Arc::new(ToolRegistry::new());
        register_builtin_tools(
            &registry,
            &ToolDeps {
                allocator,
                secrets,
                detector: detector.clone(),
                lifecycle,
                monitor,
                topology,
                store,
            },
        )?;

        let router = Arc::new(RpcRouter::new(&config.projects, registry, detector));
        let server = run_server(
            &config.server,
            Arc::new(ServerState {
                router,
                config_path: self.config_path.clone(),
            }),
        )?;

        Ok(StartedComponents { server, background })
    }
}

struct StartedComponents {
    server: actix_web::dev::Server,
    background: Vec<tokio::task::JoinHandle<()>>,
}

/// Zone discovery on startup, refreshed when the cache is older than a
/// day. Failures leave the cached zones in place.
async fn refresh_zone_cache(store: &Store, dns: &dyn DnsApi) {
    match store.domains_need_refresh(ZONE_CACHE_MAX_AGE_HOURS).await {
        Ok(false) => return,
        Ok(true) => {}
        Err(err) => {
            warn!(error_msg = %err, "checking zone cache age");
            return;
        }
    }

    let discovered = retry_async(ZONE_DISCOVERY_ATTEMPTS, ZONE_DISCOVERY_RETRY_INTERVAL, || {
        dns.list_zones()
    })
    .await;
    match discovered {
        Ok(zones) => {
            let pairs: Vec<(String, String)> = zones
                .into_iter()
                .map(|zone| (zone.name, zone.id))
                .collect();
            if let Err(err) = store.upsert_domains(&pairs).await {
                warn!(error_msg = %err, "persisting zone cache");
            } else {
                info!(zones = pairs.len(), "zone cache refreshed");
            }
        }
        Err(err) => warn!(error_msg = %err, "zone discovery failed, keeping cached zones"),
    }
}
