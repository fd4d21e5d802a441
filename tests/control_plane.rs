//! End-to-end scenarios over the assembled control plane, with scripted
//! stand-ins for the external collaborators (DNS API, docker daemon,
//! tunnel binary).

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use supervisor_control::cloudflare::{CloudflareError, DnsApi, DnsRecord, Zone};
use supervisor_control::cname::{CnameError, CnameLifecycle, CnameRequest};
use supervisor_control::config::{PortRangeConfig, ProjectConfig};
use supervisor_control::docker::prober::{HostTunnelProbe, TopologyHandle, TopologyProber};
use supervisor_control::docker::{
    ContainerInventory, DockerError, InventorySource, NetworkInventory, PortBinding,
};
use supervisor_control::tunnel::TunnelStatus;
use supervisor_control::ingress::IngressFileManager;
use supervisor_control::ports::PortAllocator;
use supervisor_control::rpc::endpoint::ProjectEndpoint;
use supervisor_control::rpc::registry::{ProjectContext, ToolRegistry};
use supervisor_control::rpc::tools::{register_builtin_tools, ToolDeps};
use supervisor_control::secrets::crypto::MasterKey;
use supervisor_control::secrets::detector::{DetectionContext, SecretDetector};
use supervisor_control::secrets::store::SecretsStore;
use supervisor_control::store::ports::AllocationRequest;
use supervisor_control::store::Store;
use supervisor_control::tunnel::monitor::{TunnelMonitor, TunnelPinger};
use supervisor_control::tunnel::process::TunnelProcess;
use supervisor_control::tunnel::TunnelError;

const INGRESS_SEED: &str = r#"tunnel: 6ff42ae2-765d-4adf-8112-31c55c1551ef
credentials-file: /etc/cloudflared/creds.json
ingress:
  - service: http_status:404
"#;

/// DNS API double that records created and deleted records.
#[derive(Default)]
struct FakeDns {
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

#[async_trait]
impl DnsApi for FakeDns {
    async fn list_zones(&self) -> Result<Vec<Zone>, CloudflareError> {
        Ok(vec![Zone {
            id: "zone-1".to_string(),
            name: "153.se".to_string(),
        }])
    }

    async fn create_cname(
        &self,
        _zone_id: &str,
        name: &str,
        content: &str,
    ) -> Result<DnsRecord, CloudflareError> {
        self.created.lock().unwrap().push(name.to_string());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(DnsRecord {
            id: format!("rec-{id}"),
            name: name.to_string(),
            record_type: "CNAME".to_string(),
            content: content.to_string(),
            proxied: true,
        })
    }

    async fn create_a(
        &self,
        _zone_id: &str,
        name: &str,
        ip: &str,
        proxied: bool,
    ) -> Result<DnsRecord, CloudflareError> {
        Ok(DnsRecord {
            id: "rec-a".to_string(),
            name: name.to_string(),
            record_type: "A".to_string(),
            content: ip.to_string(),
            proxied,
        })
    }

    async fn delete_record(
        &self,
        _zone_id: &str,
        record_id: &str,
    ) -> Result<(), CloudflareError> {
        self.deleted.lock().unwrap().push(record_id.to_string());
        Ok(())
    }

    async fn list_records(&self, _zone_id: &str) -> Result<Vec<DnsRecord>, CloudflareError> {
        Ok(vec![])
    }
}

/// Static container inventory fed to the real prober.
#[derive(Default, Clone)]
struct StaticInventory {
    containers: Vec<ContainerInventory>,
    networks: Vec<NetworkInventory>,
}

#[async_trait]
impl InventorySource for StaticInventory {
    async fn containers(&self) -> Result<Vec<ContainerInventory>, DockerError> {
        Ok(self.containers.clone())
    }

    async fn networks(&self) -> Result<Vec<NetworkInventory>, DockerError> {
        Ok(self.networks.clone())
    }
}

struct ScriptedTunnel {
    running: AtomicBool,
    healthy: AtomicBool,
}

impl ScriptedTunnel {
    fn up() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
        })
    }

    fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.healthy.store(false, Ordering::SeqCst);
    }
}

impl TunnelProcess for ScriptedTunnel {
    fn spawn(&self) -> Result<(), TunnelError> {
        self.running.store(true, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> Result<(), TunnelError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&self) -> Result<(), TunnelError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn reload(&self) -> Result<bool, TunnelError> {
        Ok(true)
    }
}

#[async_trait]
impl TunnelPinger for ScriptedTunnel {
    async fn ping(&self) -> Result<(), String> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("connection refused".to_string())
        }
    }
}

struct NoHostTunnel;
impl HostTunnelProbe for NoHostTunnel {
    fn tunnel_process_running(&self) -> bool {
        false
    }
}
struct HostTunnel;
impl HostTunnelProbe for HostTunnel {
    fn tunnel_process_running(&self) -> bool {
        true
    }
}

async fn seeded_store() -> Store {
    let store = Store::in_memory().await.unwrap();
    store
        .sync_port_ranges(&[
            PortRangeConfig {
                name: "consilio".to_string(),
                start: 3100,
                end: 3199,
            },
            PortRangeConfig {
                name: "shared-services".to_string(),
                start: 8000,
                end: 8999,
            },
        ])
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
    store
        .upsert_domains(&[("153.se".to_string(), "zone-1".to_string())])
        .await
        .unwrap();
    store
}

fn container(name: &str, networks: &[&str], ports: &[(u16, Option<u16>)]) -> ContainerInventory {
    ContainerInventory {
        id: format!("id-{name}"),
        name: name.to_string(),
        image: format!("{name}:latest"),
        status: "running".to_string(),
        labels: Default::default(),
        networks: networks
            .iter()
            .map(|n| (n.to_string(), Some("172.18.0.5".to_string())))
            .collect(),
        ports: ports
            .iter()
            .map(|(internal, host)| PortBinding {
                internal: *internal,
                host: *host,
                protocol: "tcp".to_string(),
            })
            .collect(),
    }
}

async fn topology_with(
    store: &Store,
    inventory: StaticInventory,
    host_tunnel: bool,
) -> TopologyHandle {
    let probe: Arc<dyn HostTunnelProbe> = if host_tunnel {
        Arc::new(HostTunnel)
    } else {
        Arc::new(NoHostTunnel)
    };
    let prober = TopologyProber::new(
        inventory,
        store.clone(),
        vec!["consilio".to_string()],
        probe,
        Duration::from_secs(60),
    );
    let handle = prober.handle();
    prober.tick().await;
    handle
}

fn ingress_fixture() -> (tempfile::TempDir, Arc<IngressFileManager>, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    std::fs::write(&path, INGRESS_SEED).unwrap();
    let manager = Arc::new(IngressFileManager::new(path.clone()));
    (dir, manager, path)
}

fn monitor_for(store: &Store, tunnel: Arc<ScriptedTunnel>) -> Arc<TunnelMonitor> {
    Arc::new(
        TunnelMonitor::new(
            tunnel.clone(),
            tunnel,
            store.clone(),
            Duration::from_secs(30),
        )
        .with_backoff_schedule(vec![Duration::ZERO, Duration::ZERO]),
    )
}

#[tokio::test]
async fn port_allocation_scenario() {
    let store = seeded_store().await;
    let allocator = PortAllocator::new(store);

    let web = allocator
        .get_or_allocate(
            "consilio",
            "web",
            &AllocationRequest {
                service_type: "web".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(web.port, 3100);

    let again = allocator
        .get_or_allocate("consilio", "web", &AllocationRequest::default())
        .await
        .unwrap();
    assert_eq!(again.port, 3100);

    let api = allocator
        .allocate("consilio", "api", &AllocationRequest::default())
        .await
        .unwrap();
    assert_eq!(api.port, 3101);
}

#[tokio::test]
async fn secret_round_trip_scenario() {
    let store = seeded_store().await;
    let secrets = SecretsStore::new(store, &MasterKey::parse(&"ab".repeat(32)).unwrap());

    secrets
        .set(
            "project/consilio/database_url",
            "postgres://u:p@h/d",
            "Primary DB URL",
            None,
        )
        .await
        .unwrap();

    let value = secrets
        .get("project/consilio/database_url", Some("consilio"))
        .await
        .unwrap();
    assert_eq!(value, "postgres://u:p@h/d");

    let listed = secrets.list(&Default::default()).await.unwrap();
    let row = serde_json::to_value(&listed[0]).unwrap();
    assert!(row.get("value").is_none());
    assert!(!row.to_string().contains("postgres://u:p@h/d"));

    let invalid = secrets
        .set("project/Consilio/x", "v", "Ten chars!", None)
        .await;
    assert!(invalid.is_err());
}

#[tokio::test]
async fn auto_detect_scenario() {
    let store = seeded_store().await;
    let secrets = SecretsStore::new(store, &MasterKey::parse(&"ab".repeat(32)).unwrap());
    let detector = SecretDetector::new();
    let key = "sk-ant-REDACTED";
    let text = format!("here is my key {key} thanks");

    let detection = detector
        .detect_secret(&text, &DetectionContext::default())
        .unwrap();
    assert_eq!(detection.secret_type, "anthropic");
    assert_eq!(detection.key_path, "meta/anthropic/api_key");
    assert_eq!(detection.confidence, 1.0);

    let stored = detector
        .auto_store(&secrets, &text, &DetectionContext::default())
        .await
        .unwrap()
        .unwrap();
    assert!(!serde_json::to_string(&stored).unwrap().contains(key));

    let fetched = secrets.get("meta/anthropic/api_key", None).await.unwrap();
    assert_eq!(fetched, key);
}

#[tokio::test]
async fn cname_container_with_shared_network_scenario() {
    let store = seeded_store().await;
    let range = store.port_range_by_name("consilio").await.unwrap().unwrap();
    store
        .allocate_port(
            "consilio",
            &range,
            "web",
            &AllocationRequest {
                host: "localhost".to_string(),
                protocol: "tcp".to_string(),
                service_type: "web".to_string(),
            },
        )
        .await
        .unwrap();
    // The allocator hands out 3100 first; walk it up to 3105 for the
    // canonical scenario shape.
    for service in ["s1", "s2", "s3", "s4"] {
        store
            .allocate_port("consilio", &range, service, &AllocationRequest::default())
            .await
            .unwrap();
    }
    let web = store
        .allocate_port("consilio", &range, "web-main", &AllocationRequest::default())
        .await
        .unwrap();
    assert_eq!(web.port, 3105);

    let topology = topology_with(
        &store,
        StaticInventory {
            containers: vec![
                container("consilio-web", &["consilio-net"], &[(3105, None)]),
                container("cloudflared", &["consilio-net"], &[]),
            ],
            networks: vec![NetworkInventory {
                id: "net-1".to_string(),
                name: "consilio-net".to_string(),
                driver: "bridge".to_string(),
            }],
        },
        false,
    )
    .await;

    let (_dir, ingress, path) = ingress_fixture();
    let tunnel = ScriptedTunnel::up();
    let monitor = monitor_for(&store, tunnel);
    let dns = Arc::new(FakeDns::default());

    let lifecycle = CnameLifecycle::new(
        store.clone(),
        dns.clone(),
        ingress,
        topology,
        monitor,
        "6ff42ae2-765d-4adf-8112-31c55c1551ef".to_string(),
        Some("153.se".to_string()),
    );

    let outcome = lifecycle
        .request_cname(&CnameRequest {
            subdomain: "app".to_string(),
            domain: None,
            target_port: 3105,
            project: "consilio".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(outcome.url, "https://app.153.se");
    assert_eq!(outcome.ingress_target, "http://consilio-web:3105");
    assert_eq!(outcome.target_type, "container");

    // The rule sits immediately before the catch-all.
    let content = std::fs::read_to_string(&path).unwrap();
    let doc: Value = serde_yaml::from_str::<serde_yaml::Value>(&content)
        .map(|v| serde_json::to_value(v).unwrap())
        .unwrap();
    let rules = doc["ingress"].as_array().unwrap();
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0]["hostname"], json!("app.153.se"));
    assert_eq!(rules[0]["service"], json!("http://consilio-web:3105"));
    assert_eq!(rules[1]["service"], json!("http_status:404"));

    assert_eq!(dns.created.lock().unwrap().as_slice(), ["app.153.se"]);
}

#[tokio::test]
async fn cname_without_connectivity_scenario() {
    let store = seeded_store().await;
    let range = store.port_range_by_name("consilio").await.unwrap().unwrap();
    let allocation = store
        .allocate_port("consilio", &range, "web", &AllocationRequest::default())
        .await
        .unwrap();

    // Container listens on the port, cloudflared runs on the host, no
    // published port binding.
    let topology = topology_with(
        &store,
        StaticInventory {
            containers: vec![container(
                "consilio-web",
                &["consilio-net"],
                &[(allocation.port, None)],
            )],
            networks: vec![],
        },
        true,
    )
    .await;

    let (_dir, ingress, path) = ingress_fixture();
    let before = std::fs::read_to_string(&path).unwrap();
    let tunnel = ScriptedTunnel::up();
    let monitor = monitor_for(&store, tunnel);
    let dns = Arc::new(FakeDns::default());

    let lifecycle = CnameLifecycle::new(
        store.clone(),
        dns.clone(),
        ingress,
        topology,
        monitor,
        "6ff42ae2".to_string(),
        Some("153.se".to_string()),
    );

    let err = lifecycle
        .request_cname(&CnameRequest {
            subdomain: "app".to_string(),
            domain: None,
            target_port: allocation.port,
            project: "consilio".to_string(),
        })
        .await
        .unwrap_err();

    match err {
        CnameError::Connectivity { recommendation, .. } => {
            assert!(recommendation.contains("Add cloudflared to consilio-net"));
            assert!(recommendation.contains(&format!(
                "expose port with -p {}:{}",
                allocation.port, allocation.port
            )));
        }
        other => panic!("expected connectivity error, got {other:?}"),
    }

    // Nothing was created or mutated.
    assert!(dns.created.lock().unwrap().is_empty());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    assert!(store.cname_by_hostname("app.153.se").await.unwrap().is_none());
}

#[tokio::test]
async fn tunnel_recovery_scenario() {
    let store = seeded_store().await;
    let tunnel = ScriptedTunnel::up();
    let monitor = monitor_for(&store, tunnel.clone());
    let events = monitor.subscribe();

    monitor.tick().await;
    assert_eq!(monitor.status().status, TunnelStatus::Up);

    // Kill the tunnel process: three failed ticks declare it down.
    tunnel.kill();
    for _ in 0..3 {
        monitor.tick().await;
    }
    let down = events.try_recv().unwrap();
    assert_eq!(down.status, TunnelStatus::Down);

    // The zero-delay schedule makes the restart due immediately: one
    // more tick attempts it (the scripted process comes back), the next
    // confirms recovery.
    monitor.tick().await;
    assert_eq!(monitor.status().status, TunnelStatus::Restarting);

    monitor.tick().await;
    let report = monitor.status();
    assert_eq!(report.status, TunnelStatus::Up);
    assert_eq!(report.restart_count, 1);

    let statuses: Vec<TunnelStatus> =
        std::iter::from_fn(|| events.try_recv().ok().map(|e| e.status)).collect();
    assert_eq!(statuses, vec![TunnelStatus::Restarting, TunnelStatus::Up]);

    // Health history captured the whole cycle.
    let rows = store.recent_tunnel_health(10).await.unwrap();
    assert!(rows.iter().any(|r| r.status == "down"));
    assert_eq!(rows[0].status, "up");
    assert_eq!(rows[0].restart_count, 1);
}

#[tokio::test]
async fn json_rpc_endpoint_full_flow() {
    let store = seeded_store().await;
    let (_dir, ingress, _path) = ingress_fixture();
    let tunnel = ScriptedTunnel::up();
    let monitor = monitor_for(&store, tunnel);
    let topology = TopologyHandle::default();
    let detector = Arc::new(SecretDetector::new());

    let deps = ToolDeps {
        allocator: Arc::new(PortAllocator::new(store.clone())),
        secrets: Arc::new(SecretsStore::new(
            store.clone(),
            &MasterKey::parse(&"ab".repeat(32)).unwrap(),
        )),
        detector: detector.clone(),
        lifecycle: Arc::new(CnameLifecycle::new(
            store.clone(),
            Arc::new(FakeDns::default()),
            ingress,
            topology.clone(),
            monitor.clone(),
            "tunnel-id".to_string(),
            Some("153.se".to_string()),
        )),
        monitor,
        topology,
        store,
    };
    let registry = Arc::new(ToolRegistry::new());
    register_builtin_tools(&registry, &deps).unwrap();

    let endpoint = ProjectEndpoint::new(
        ProjectContext {
            project: "consilio".to_string(),
            working_dir: PathBuf::from("/srv/consilio"),
            allowed_tools: vec![],
        },
        registry,
        detector,
    );

    let call = |body: Value| {
        let endpoint = &endpoint;
        async move {
            endpoint
                .handle_body(body.to_string().as_bytes())
                .await
                .unwrap()
        }
    };

    let init = call(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"})).await;
    assert_eq!(init.result.unwrap()["project"]["name"], json!("consilio"));

    let listed = call(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"})).await;
    assert_eq!(
        listed.result.unwrap()["tools"].as_array().unwrap().len(),
        14
    );

    let allocated = call(json!({
        "jsonrpc": "2.0",
        "id": 3,
        "method": "tools/call",
        "params": {"name": "port_get_or_allocate", "arguments": {"service": "web"}},
    }))
    .await;
    assert_eq!(allocated.result.unwrap()["port"], json!(3100));

    let denied = call(json!({
        "jsonrpc": "2.0",
        "id": 4,
        "method": "tools/call",
        "params": {"name": "no_such_tool"},
    }))
    .await;
    assert_eq!(denied.error.unwrap().code, -32000);
}
