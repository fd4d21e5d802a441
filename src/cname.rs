//! CNAME lifecycle: the validation pipeline that turns "publish this
//! port as a hostname" into DNS, ingress, tunnel reload and persisted
//! state, with reverse-order compensation on partial failure.

use crate::cloudflare::{tunnel_dns_target, CloudflareError, DnsApi};
use crate::docker::prober::TopologyHandle;
use crate::docker::snapshot::{ContainerInfo, TopologySnapshot};
use crate::ingress::{IngressError, IngressFileManager};
use crate::store::cnames::NewCname;
use crate::store::models::CnameRecord;
use crate::store::{Store, StoreError};
use crate::tunnel::{TunnelControl, TunnelError};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Requesters with this name may operate on any project's CNAMEs.
pub const META_REQUESTER: &str = "meta";

#[derive(Error, Debug)]
pub enum CnameError {
    #[error("{0}")]
    Validation(String),

    #[error("cname `{0}` not found")]
    NotFound(String),

    #[error("project `{requester}` may not manage cname `{hostname}` owned by `{owner}`")]
    AccessDenied {
        requester: String,
        hostname: String,
        owner: String,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    Connectivity {
        message: String,
        recommendation: String,
    },

    #[error(transparent)]
    Cloudflare(#[from] CloudflareError),

    #[error(transparent)]
    Ingress(#[from] IngressError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CnameRequest {
    pub subdomain: String,
    pub domain: Option<String>,
    pub target_port: u16,
    pub project: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CnameOutcome {
    pub url: String,
    pub ingress_target: String,
    pub target_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Routing target chosen from live topology.
#[derive(Debug, Clone, PartialEq)]
struct TargetSelection {
    url: String,
    target_type: &'static str,
    container_name: Option<String>,
    docker_network: Option<String>,
    warning: Option<String>,
}

/// Undo actions accumulated while the pipeline advances, executed in
/// reverse on failure. Steps 1-4 are read-only and never enter the stack.
enum UndoAction {
    DeleteDnsRecord { zone_id: String, record_id: String },
    RemoveIngressRule { hostname: String },
}

pub struct CnameLifecycle {
    store: Store,
    dns: Arc<dyn DnsApi>,
    ingress: Arc<IngressFileManager>,
    topology: TopologyHandle,
    tunnel: Arc<dyn TunnelControl>,
    tunnel_id: String,
    default_domain: Option<String>,
}

impl CnameLifecycle {
    pub fn new(
        store: Store,
        dns: Arc<dyn DnsApi>,
        ingress: Arc<IngressFileManager>,
        topology: TopologyHandle,
        tunnel: Arc<dyn TunnelControl>,
        tunnel_id: String,
        default_domain: Option<String>,
    ) -> Self {
        Self {
            store,
            dns,
            ingress,
            topology,
            tunnel,
            tunnel_id,
            default_domain,
        }
    }

    pub async fn request_cname(&self, request: &CnameRequest) -> Result<CnameOutcome, CnameError> {
        // 1. Domain must be a known zone.
        let domain = request
            .domain
            .clone()
            .or_else(|| self.default_domain.clone())
            .ok_or_else(|| {
                CnameError::Validation(
                    "no domain given and no default domain configured".to_string(),
                )
            })?;
        let zone = self.store.domain(&domain).await?.ok_or_else(|| {
            CnameError::Validation(format!("domain `{domain}` is not a known zone"))
        })?;
        let full_hostname = format!("{}.{}", request.subdomain, domain);

        // 2. Hostname must be unused, both here and at the DNS provider.
        if self.store.cname_exists(&request.subdomain, &domain).await? {
            return Err(CnameError::Conflict(format!(
                "cname `{full_hostname}` already exists"
            )));
        }
        let records = self.dns.list_records(&zone.zone_id).await?;
        if records.iter().any(|r| r.name == full_hostname) {
            return Err(CnameError::Conflict(format!(
                "dns record `{full_hostname}` already exists at the provider"
            )));
        }

        // 3. The target port must be an active allocation of the project.
        let owned = self
            .store
            .active_allocations(Some(&request.project))
            .await?
            .into_iter()
            .any(|allocation| allocation.port == request.target_port);
        if !owned {
            return Err(CnameError::Validation(format!(
                "port {} is not an active allocation of project `{}`",
                request.target_port, request.project
            )));
        }

        // 4. Pick the routing target from the live topology.
        let snapshot = self.topology.current();
        let target = select_target(&snapshot, request.target_port, &request.project)?;
        if let Some(warning) = &target.warning {
            warn!(hostname = %full_hostname, warning, "cname target degraded");
        }
        if let Some(container) = snapshot
            .find_container_by_listening_port(request.target_port, Some(&request.project))
            .filter(|_| target.target_type == "localhost")
        {
            if !snapshot.is_reachable(container, request.target_port).await {
                warn!(
                    hostname = %full_hostname,
                    container = %container.name,
                    "host port fallback did not answer a probe, publishing anyway"
                );
            }
        }

        // 5-8. Mutations, compensated in reverse on failure.
        let mut undo: Vec<UndoAction> = Vec::new();
        let outcome = self
            .apply_mutations(request, &zone.zone_id, &full_hostname, &domain, &target, &mut undo)
            .await;

        match outcome {
            Ok(outcome) => {
                self.audit_create(request, &full_hostname, &target, true, None).await;
                Ok(outcome)
            }
            Err(err) => {
                self.rollback(undo).await;
                self.audit_create(request, &full_hostname, &target, false, Some(&err)).await;
                Err(err)
            }
        }
    }

    async fn apply_mutations(
        &self,
        request: &CnameRequest,
        zone_id: &str,
        full_hostname: &str,
        domain: &str,
        target: &TargetSelection,
        undo: &mut Vec<UndoAction>,
    ) -> Result<CnameOutcome, CnameError> {
        // 5. DNS record pointing at the tunnel's routing host.
        let record = self
            .dns
            .create_cname(zone_id, full_hostname, &tunnel_dns_target(&self.tunnel_id))
            .await?;
        undo.push(UndoAction::DeleteDnsRecord {
            zone_id: zone_id.to_string(),
            record_id: record.id.clone(),
        });

        // 6. Ingress rule immediately before the catch-all.
        self.ingress.add(full_hostname, &target.url, None).await?;
        undo.push(UndoAction::RemoveIngressRule {
            hostname: full_hostname.to_string(),
        });

        // 7. Tell the tunnel about its new route.
        self.tunnel.request_reload().await?;

        // 8. Persist the record and let the allocator know its hostname.
        self.store
            .insert_cname(&NewCname {
                subdomain: request.subdomain.clone(),
                domain: domain.to_string(),
                full_hostname: full_hostname.to_string(),
                target_service: target.url.clone(),
                target_type: target.target_type.to_string(),
                container_name: target.container_name.clone(),
                docker_network: target.docker_network.clone(),
                project: request.project.clone(),
                cloudflare_record_id: Some(record.id),
                created_by: request.project.clone(),
            })
            .await?;
        self.store
            .set_allocation_hostname(&request.project, request.target_port, Some(full_hostname))
            .await?;

        info!(
            hostname = full_hostname,
            target = %target.url,
            target_type = target.target_type,
            "cname published"
        );
        Ok(CnameOutcome {
            url: format!("https://{full_hostname}"),
            ingress_target: target.url.clone(),
            target_type: target.target_type.to_string(),
            warning: target.warning.clone(),
        })
    }

    /// Best-effort reverse-order compensation; each undo failure is
    /// logged and the rest still run.
    async fn rollback(&self, undo: Vec<UndoAction>) {
        for action in undo.into_iter().rev() {
            match action {
                UndoAction::DeleteDnsRecord { zone_id, record_id } => {
                    if let Err(err) = self.dns.delete_record(&zone_id, &record_id).await {
                        error!(error_msg = %err, record_id, "rolling back dns record");
                    }
                }
                UndoAction::RemoveIngressRule { hostname } => {
                    match self.ingress.remove(&hostname).await {
                        Ok(_) => {
                            if let Err(err) = self.tunnel.request_reload().await {
                                warn!(error_msg = %err, "reloading tunnel after rollback");
                            }
                        }
                        Err(err) => error!(error_msg = %err, hostname, "rolling back ingress rule"),
                    }
                }
            }
        }
    }

    pub async fn delete_cname(
        &self,
        full_hostname: &str,
        requester: &str,
    ) -> Result<(), CnameError> {
        let record = self
            .store
            .cname_by_hostname(full_hostname)
            .await?
            .ok_or_else(|| CnameError::NotFound(full_hostname.to_string()))?;

        if requester != META_REQUESTER && record.project != requester {
            return Err(CnameError::AccessDenied {
                requester: requester.to_string(),
                hostname: full_hostname.to_string(),
                owner: record.project.clone(),
            });
        }

        let outcome = self.apply_deletion(&record).await;
        let success = outcome.is_ok();
        let error_message = outcome.as_ref().err().map(|err| err.to_string());
        self.store
            .record_audit(
                "cname_delete",
                Some(&record.project),
                &json!({ "hostname": full_hostname, "requested_by": requester }),
                success,
                error_message.as_deref(),
            )
            .await
            .unwrap_or_else(|err| warn!(error_msg = %err, "recording audit entry"));
        outcome
    }

    async fn apply_deletion(&self, record: &CnameRecord) -> Result<(), CnameError> {
        if let Some(record_id) = &record.cloudflare_record_id {
            let zone = self.store.domain(&record.domain).await?;
            match zone {
                Some(zone) => self.dns.delete_record(&zone.zone_id, record_id).await?,
                None => warn!(
                    domain = %record.domain,
                    "zone unknown while deleting cname, skipping dns cleanup"
                ),
            }
        }

        self.ingress.remove(&record.full_hostname).await?;
        self.tunnel.request_reload().await?;

        self.store.delete_cname(&record.full_hostname).await?;
        self.store
            .clear_allocation_hostname(&record.full_hostname)
            .await?;

        info!(hostname = %record.full_hostname, "cname deleted");
        Ok(())
    }

    pub async fn list_cnames(
        &self,
        project: Option<&str>,
    ) -> Result<Vec<CnameRecord>, CnameError> {
        Ok(self.store.list_cnames(project).await?)
    }

    async fn audit_create(
        &self,
        request: &CnameRequest,
        full_hostname: &str,
        target: &TargetSelection,
        success: bool,
        err: Option<&CnameError>,
    ) {
        let result = self
            .store
            .record_audit(
                "cname_create",
                Some(&request.project),
                &json!({
                    "hostname": full_hostname,
                    "target": target.url,
                    "target_type": target.target_type,
                }),
                success,
                err.map(|e| e.to_string()).as_deref(),
            )
            .await;
        if let Err(err) = result {
            warn!(error_msg = %err, "recording audit entry");
        }
    }
}

/// Routing-target selection over the published topology snapshot.
///
/// Preference order: container-to-container over a shared network, then
/// host port binding, then plain localhost; a container with no path to
/// the tunnel is a connectivity error.
fn select_target(
    snapshot: &TopologySnapshot,
    port: u16,
    project: &str,
) -> Result<TargetSelection, CnameError> {
    let localhost = |port: u16, warning: Option<String>| TargetSelection {
        url: format!("http://localhost:{port}"),
        target_type: "localhost",
        container_name: None,
        docker_network: None,
        warning,
    };

    if !snapshot.available {
        return Ok(localhost(
            port,
            Some("container inventory unavailable, assuming host service".to_string()),
        ));
    }

    let Some(container) = snapshot.find_container_by_listening_port(port, Some(project)) else {
        return Ok(localhost(port, None));
    };

    let shared = snapshot.shared_networks(container);
    if let Some(network) = shared.first() {
        return Ok(TargetSelection {
            url: format!("http://{}:{port}", container.name),
            target_type: "container",
            container_name: Some(container.name.clone()),
            docker_network: Some(network.clone()),
            warning: None,
        });
    }

    if let Some(host_port) = container.host_port_for(port) {
        return Ok(localhost(
            host_port,
            Some(format!(
                "container `{}` shares no network with the tunnel, routing via host port {host_port}",
                container.name
            )),
        ));
    }

    Err(connectivity_error(container, port))
}

fn connectivity_error(container: &ContainerInfo, port: u16) -> CnameError {
    let network = container
        .networks
        .first()
        .cloned()
        .unwrap_or_else(|| "the container's network".to_string());
    CnameError::Connectivity {
        message: format!(
            "container `{}` listens on {port} but the tunnel cannot reach it",
            container.name
        ),
        recommendation: format!(
            "Add cloudflared to {network} OR expose port with -p {port}:{port}"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudflare::tests::MockDnsApi;
    use crate::config::{PortRangeConfig, ProjectConfig};
    use crate::docker::snapshot::tests::inventory;
    use crate::store::ports::AllocationRequest;
    use assert_matches::assert_matches;
    use mockall::mock;
    use std::path::PathBuf;

    mock! {
        pub TunnelControl {}

        #[async_trait::async_trait]
        impl TunnelControl for TunnelControl {
            async fn request_reload(&self) -> Result<(), TunnelError>;
        }
    }

    const INGRESS: &str = r#"tunnel: 6ff42ae2-765d-4adf-8112-31c55c1551ef
credentials-file: /etc/cloudflared/creds.json
ingress:
  - service: http_status:404
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Store,
        ingress: Arc<IngressFileManager>,
        lifecycle: CnameLifecycle,
    }

    async fn fixture(dns: MockDnsApi, reloads: usize) -> Fixture {
        let mut tunnel = MockTunnelControl::new();
        tunnel
            .expect_request_reload()
            .times(reloads)
            .returning(|| Ok(()));
        fixture_with_tunnel(dns, tunnel).await
    }

    async fn fixture_with_tunnel(dns: MockDnsApi, tunnel: MockTunnelControl) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, INGRESS).unwrap();
        let ingress = Arc::new(IngressFileManager::without_commits(path));

        let store = Store::in_memory().await.unwrap();
        store
            .sync_port_ranges(&[PortRangeConfig {
                name: "consilio".to_string(),
                start: 3100,
                end: 3199,
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
        store
            .upsert_domains(&[("153.se".to_string(), "zone-1".to_string())])
            .await
            .unwrap();

        let topology = TopologyHandle::default();
        let lifecycle = CnameLifecycle::new(
            store.clone(),
            Arc::new(dns),
            ingress.clone(),
            topology,
            Arc::new(tunnel),
            "6ff42ae2".to_string(),
            Some("153.se".to_string()),
        );
        Fixture {
            _dir: dir,
            store,
            ingress,
            lifecycle,
        }
    }

    async fn allocate_port(store: &Store, service: &str) -> u16 {
        let range = store.port_range_by_name("consilio").await.unwrap().unwrap();
        store
            .allocate_port("consilio", &range, service, &AllocationRequest::default())
            .await
            .unwrap()
            .port
    }

    #[tokio::test]
    async fn container_with_shared_network_is_preferred() {
        let snapshot = TopologySnapshot::from_inventory(
            vec![
                inventory("consilio-web", "img", &["consilio-net"], &[(3105, None)]),
                inventory("cloudflared", "cloudflare/cloudflared", &["consilio-net"], &[]),
            ],
            vec![],
            &["consilio".to_string()],
            false,
        );
        let selection = select_target(&snapshot, 3105, "consilio").unwrap();

        assert_eq!(selection.url, "http://consilio-web:3105");
        assert_eq!(selection.target_type, "container");
        assert_eq!(selection.docker_network.as_deref(), Some("consilio-net"));
        assert!(selection.warning.is_none());
    }

    #[tokio::test]
    async fn host_port_binding_is_the_degraded_fallback() {
        // Tunnel on the host, container reachable only through its
        // published port.
        let snapshot = TopologySnapshot::from_inventory(
            vec![inventory("consilio-web", "img", &["consilio-net"], &[(3105, Some(43105))])],
            vec![],
            &["consilio".to_string()],
            true,
        );
        let selection = select_target(&snapshot, 3105, "consilio").unwrap();

        assert_eq!(selection.url, "http://localhost:43105");
        assert_eq!(selection.target_type, "localhost");
        assert!(selection.warning.is_some());
    }

    #[tokio::test]
    async fn unreachable_container_is_a_connectivity_error() {
        let snapshot = TopologySnapshot::from_inventory(
            vec![inventory("consilio-web", "img", &["consilio-net"], &[(3105, None)])],
            vec![],
            &["consilio".to_string()],
            true,
        );
        let err = select_target(&snapshot, 3105, "consilio").unwrap_err();

        assert_matches!(err, CnameError::Connectivity { recommendation, .. } => {
            assert!(recommendation.contains("Add cloudflared to consilio-net"));
            assert!(recommendation.contains("expose port with -p 3105:3105"));
        });
    }

    #[tokio::test]
    async fn unavailable_inventory_falls_back_to_localhost() {
        let selection =
            select_target(&TopologySnapshot::unavailable(), 3105, "consilio").unwrap();
        assert_eq!(selection.url, "http://localhost:3105");
        assert!(selection.warning.is_some());
    }

    #[tokio::test]
    async fn host_service_routes_to_localhost() {
        let snapshot = TopologySnapshot::from_inventory(vec![], vec![], &[], true);
        let selection = select_target(&snapshot, 3100, "consilio").unwrap();
        assert_eq!(selection.url, "http://localhost:3100");
        assert_eq!(selection.target_type, "localhost");
        assert!(selection.warning.is_none());
    }

    #[tokio::test]
    async fn request_cname_happy_path_persists_everything() {
        let mut dns = MockDnsApi::new();
        dns.should_list_no_records();
        dns.should_create_cname("rec-1");
        let fixture = fixture(dns, 1).await;
        let port = allocate_port(&fixture.store, "web").await;

        let outcome = fixture
            .lifecycle
            .request_cname(&CnameRequest {
                subdomain: "app".to_string(),
                domain: None,
                target_port: port,
                project: "consilio".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.url, "https://app.153.se");
        assert_eq!(outcome.ingress_target, format!("http://localhost:{port}"));
        assert_eq!(outcome.target_type, "localhost");

        let record = fixture
            .store
            .cname_by_hostname("app.153.se")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.cloudflare_record_id.as_deref(), Some("rec-1"));

        let audits = fixture.store.recent_audit(5).await.unwrap();
        assert_eq!(audits[0].action, "cname_create");
        assert!(audits[0].success);
    }

    #[tokio::test]
    async fn duplicate_hostname_is_rejected_before_any_mutation() {
        let mut dns = MockDnsApi::new();
        dns.expect_list_records().returning(|_| {
            Ok(vec![crate::cloudflare::DnsRecord {
                id: "rec-0".to_string(),
                name: "app.153.se".to_string(),
                record_type: "CNAME".to_string(),
                content: "x.cfargotunnel.com".to_string(),
                proxied: true,
            }])
        });
        dns.expect_create_cname().never();
        let fixture = fixture(dns, 0).await;
        let port = allocate_port(&fixture.store, "web").await;

        let result = fixture
            .lifecycle
            .request_cname(&CnameRequest {
                subdomain: "app".to_string(),
                domain: None,
                target_port: port,
                project: "consilio".to_string(),
            })
            .await;
        assert_matches!(result, Err(CnameError::Conflict(_)));
    }

    #[tokio::test]
    async fn port_not_owned_by_project_is_rejected() {
        let mut dns = MockDnsApi::new();
        dns.should_list_no_records();
        let fixture = fixture(dns, 0).await;

        let result = fixture
            .lifecycle
            .request_cname(&CnameRequest {
                subdomain: "app".to_string(),
                domain: None,
                target_port: 3150,
                project: "consilio".to_string(),
            })
            .await;
        assert_matches!(result, Err(CnameError::Validation(_)));
    }

    #[tokio::test]
    async fn failed_reload_rolls_back_dns_and_ingress() {
        let mut dns = MockDnsApi::new();
        dns.should_list_no_records();
        dns.should_create_cname("rec-1");
        dns.should_delete_record("rec-1");

        // The forward reload fails; the rollback one succeeds.
        let mut tunnel = MockTunnelControl::new();
        let mut reloads = 0;
        tunnel.expect_request_reload().times(2).returning(move || {
            reloads += 1;
            if reloads == 1 {
                Err(TunnelError::NotRunning)
            } else {
                Ok(())
            }
        });
        let fixture = fixture_with_tunnel(dns, tunnel).await;
        let port = allocate_port(&fixture.store, "web").await;

        let result = fixture
            .lifecycle
            .request_cname(&CnameRequest {
                subdomain: "app".to_string(),
                domain: None,
                target_port: port,
                project: "consilio".to_string(),
            })
            .await;
        assert_matches!(result, Err(CnameError::Tunnel(_)));

        // Ingress back to just the catch-all, no persisted row, and the
        // failure is audited.
        let document = fixture.ingress.read().await.unwrap();
        assert_eq!(document.ingress.len(), 1);
        assert!(fixture
            .store
            .cname_by_hostname("app.153.se")
            .await
            .unwrap()
            .is_none());
        let audits = fixture.store.recent_audit(5).await.unwrap();
        assert_eq!(audits[0].action, "cname_create");
        assert!(!audits[0].success);
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let mut dns = MockDnsApi::new();
        dns.should_list_no_records();
        dns.should_create_cname("rec-1");
        let fixture = fixture(dns, 1).await;
        let port = allocate_port(&fixture.store, "web").await;

        fixture
            .lifecycle
            .request_cname(&CnameRequest {
                subdomain: "app".to_string(),
                domain: None,
                target_port: port,
                project: "consilio".to_string(),
            })
            .await
            .unwrap();

        let denied = fixture.lifecycle.delete_cname("app.153.se", "other").await;
        assert_matches!(denied, Err(CnameError::AccessDenied { .. }));
        assert!(fixture
            .store
            .cname_by_hostname("app.153.se")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn create_then_delete_restores_prior_state() {
        let mut dns = MockDnsApi::new();
        dns.should_list_no_records();
        dns.should_create_cname("rec-1");
        dns.should_delete_record("rec-1");
        let fixture = fixture(dns, 2).await;
        let port = allocate_port(&fixture.store, "web").await;

        fixture
            .lifecycle
            .request_cname(&CnameRequest {
                subdomain: "app".to_string(),
                domain: None,
                target_port: port,
                project: "consilio".to_string(),
            })
            .await
            .unwrap();
        fixture
            .lifecycle
            .delete_cname("app.153.se", "consilio")
            .await
            .unwrap();

        assert!(fixture
            .store
            .cname_by_hostname("app.153.se")
            .await
            .unwrap()
            .is_none());
        let audits = fixture.store.recent_audit(5).await.unwrap();
        assert_eq!(audits[0].action, "cname_delete");
        assert!(audits[0].success);
    }

    #[tokio::test]
    async fn meta_requester_may_delete_any_cname() {
        let mut dns = MockDnsApi::new();
        dns.should_list_no_records();
        dns.should_create_cname("rec-1");
        dns.should_delete_record("rec-1");
        let fixture = fixture(dns, 2).await;
        let port = allocate_port(&fixture.store, "web").await;

        fixture
            .lifecycle
            .request_cname(&CnameRequest {
                subdomain: "app".to_string(),
                domain: None,
                target_port: port,
                project: "consilio".to_string(),
            })
            .await
            .unwrap();

        fixture
            .lifecycle
            .delete_cname("app.153.se", META_REQUESTER)
            .await
            .unwrap();
    }
}
