//! Built-in tools: the operations the control plane offers to project
//! supervisors, registered at startup against the shared registry.

use super::registry::{ProjectContext, RegistryError, Tool, ToolError, ToolExecutor, ToolRegistry, ToolScope};
use crate::cname::{CnameError, CnameLifecycle, CnameRequest, META_REQUESTER};
use crate::docker::prober::TopologyHandle;
use crate::ports::{PortAllocator, PortError};
use crate::secrets::detector::{DetectionContext, SecretDetector};
use crate::secrets::store::{SecretFilter, SecretsError, SecretsStore};
use crate::store::ports::AllocationRequest;
use crate::store::Store;
use crate::tunnel::monitor::TunnelMonitor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Everything the built-in tools reach into. Constructed once at startup
/// and shared by reference.
#[derive(Clone)]
pub struct ToolDeps {
    pub allocator: Arc<PortAllocator>,
    pub secrets: Arc<SecretsStore>,
    pub detector: Arc<SecretDetector>,
    pub lifecycle: Arc<CnameLifecycle>,
    pub monitor: Arc<TunnelMonitor>,
    pub topology: TopologyHandle,
    pub store: Store,
}

pub fn register_builtin_tools(
    registry: &ToolRegistry,
    deps: &ToolDeps,
) -> Result<(), RegistryError> {
    let object_schema = |properties: Value, required: &[&str]| {
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    };

    let tools = vec![
        Tool {
            name: "port_get_or_allocate".to_string(),
            description: "Return the service's existing port or allocate the lowest free one"
                .to_string(),
            input_schema: object_schema(
                json!({
                    "service": {"type": "string"},
                    "service_type": {"type": "string"},
                    "host": {"type": "string"},
                    "protocol": {"type": "string"},
                }),
                &["service"],
            ),
            scope: ToolScope::Global,
            executor: Arc::new(PortGetOrAllocate { deps: deps.clone() }),
        },
        Tool {
            name: "port_allocate".to_string(),
            description: "Allocate a new port for a service".to_string(),
            input_schema: object_schema(
                json!({
                    "service": {"type": "string"},
                    "service_type": {"type": "string"},
                    "host": {"type": "string"},
                    "protocol": {"type": "string"},
                }),
                &["service"],
            ),
            scope: ToolScope::Global,
            executor: Arc::new(PortAllocate { deps: deps.clone() }),
        },
        Tool {
            name: "port_release".to_string(),
            description: "Release a service's port back to the project range".to_string(),
            input_schema: object_schema(json!({"service": {"type": "string"}}), &["service"]),
            scope: ToolScope::Global,
            executor: Arc::new(PortRelease { deps: deps.clone() }),
        },
        Tool {
            name: "port_audit".to_string(),
            description: "Probe the project's allocations and report liveness mismatches"
                .to_string(),
            input_schema: object_schema(json!({}), &[]),
            scope: ToolScope::Global,
            executor: Arc::new(PortAuditTool { deps: deps.clone() }),
        },
        Tool {
            name: "port_summary".to_string(),
            description: "Summarize the project's port range utilization".to_string(),
            input_schema: object_schema(json!({}), &[]),
            scope: ToolScope::Global,
            executor: Arc::new(PortSummary { deps: deps.clone() }),
        },
        Tool {
            name: "secret_set".to_string(),
            description: "Store an encrypted secret under a hierarchical key path".to_string(),
            input_schema: object_schema(
                json!({
                    "key_path": {"type": "string"},
                    "value": {"type": "string"},
                    "description": {"type": "string"},
                    "expires_at": {"type": "string", "format": "date-time"},
                }),
                &["key_path", "value", "description"],
            ),
            scope: ToolScope::Global,
            executor: Arc::new(SecretSet { deps: deps.clone() }),
        },
        Tool {
            name: "secret_get".to_string(),
            description: "Decrypt and return a secret value; the access is logged".to_string(),
            input_schema: object_schema(json!({"key_path": {"type": "string"}}), &["key_path"]),
            scope: ToolScope::Global,
            executor: Arc::new(SecretGet { deps: deps.clone() }),
        },
        Tool {
            name: "secret_list".to_string(),
            description: "List secret metadata; values are never included".to_string(),
            input_schema: object_schema(
                json!({
                    "scope": {"type": "string"},
                    "project": {"type": "string"},
                    "service": {"type": "string"},
                }),
                &[],
            ),
            scope: ToolScope::Global,
            executor: Arc::new(SecretList { deps: deps.clone() }),
        },
        Tool {
            name: "secret_delete".to_string(),
            description: "Delete a secret".to_string(),
            input_schema: object_schema(json!({"key_path": {"type": "string"}}), &["key_path"]),
            scope: ToolScope::Global,
            executor: Arc::new(SecretDelete { deps: deps.clone() }),
        },
        Tool {
            name: "secret_detect".to_string(),
            description: "Detect provider credentials in text, optionally storing or redacting"
                .to_string(),
            input_schema: object_schema(
                json!({
                    "text": {"type": "string"},
                    "question": {"type": "string"},
                    "auto_store": {"type": "boolean"},
                    "redact": {"type": "boolean"},
                    "extract_all": {"type": "boolean"},
                }),
                &["text"],
            ),
            scope: ToolScope::Global,
            executor: Arc::new(SecretDetect { deps: deps.clone() }),
        },
        Tool {
            name: "tunnel_request_cname".to_string(),
            description: "Publish an allocated port as an HTTPS hostname through the tunnel"
                .to_string(),
            input_schema: object_schema(
                json!({
                    "subdomain": {"type": "string"},
                    "domain": {"type": "string"},
                    "target_port": {"type": "integer"},
                }),
                &["subdomain", "target_port"],
            ),
            scope: ToolScope::Global,
            executor: Arc::new(TunnelRequestCname { deps: deps.clone() }),
        },
        Tool {
            name: "tunnel_delete_cname".to_string(),
            description: "Remove a published hostname owned by this project".to_string(),
            input_schema: object_schema(json!({"hostname": {"type": "string"}}), &["hostname"]),
            scope: ToolScope::Global,
            executor: Arc::new(TunnelDeleteCname { deps: deps.clone() }),
        },
        Tool {
            name: "tunnel_list_cnames".to_string(),
            description: "List published hostnames for this project".to_string(),
            input_schema: object_schema(json!({"all": {"type": "boolean"}}), &[]),
            scope: ToolScope::Global,
            executor: Arc::new(TunnelListCnames { deps: deps.clone() }),
        },
        Tool {
            name: "tunnel_status".to_string(),
            description: "Current tunnel health, restart count and recent events".to_string(),
            input_schema: object_schema(json!({"history": {"type": "integer"}}), &[]),
            scope: ToolScope::Global,
            executor: Arc::new(TunnelStatusTool { deps: deps.clone() }),
        },
    ];

    for tool in tools {
        registry.register(tool)?;
    }
    Ok(())
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params)
        .map_err(|err| ToolError::validation(format!("invalid arguments: {err}")))
}

fn parse_expiry(value: Option<String>) -> Result<Option<DateTime<Utc>>, ToolError> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|err| {
                    ToolError::validation(format!("expires_at must be RFC 3339: {err}"))
                })
        })
        .transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|err| ToolError::execution(err.to_string()))
}

impl From<PortError> for ToolError {
    fn from(err: PortError) -> Self {
        match &err {
            PortError::NoRangeAssigned(_) | PortError::NotFound { .. } => {
                ToolError::validation(err.to_string())
            }
            PortError::PortExhausted(_) => ToolError::Validation {
                message: err.to_string(),
                recommendation: Some(
                    "release unused services or ask the meta supervisor for a larger range"
                        .to_string(),
                ),
            },
            PortError::DuplicateService { .. } => ToolError::Validation {
                message: err.to_string(),
                recommendation: Some(
                    "use port_get_or_allocate to reuse the existing allocation".to_string(),
                ),
            },
            PortError::Store(_) => ToolError::execution(err.to_string()),
        }
    }
}

impl From<SecretsError> for ToolError {
    fn from(err: SecretsError) -> Self {
        match &err {
            SecretsError::Validation(_) => ToolError::validation(err.to_string()),
            SecretsError::NotFound(_) => ToolError::Validation {
                message: err.to_string(),
                recommendation: Some("use secret_list to see stored key paths".to_string()),
            },
            SecretsError::Crypto(_) | SecretsError::Store(_) => {
                ToolError::execution(err.to_string())
            }
        }
    }
}

impl From<CnameError> for ToolError {
    fn from(err: CnameError) -> Self {
        match err {
            CnameError::Connectivity {
                message,
                recommendation,
            } => ToolError::Execution {
                message,
                recommendation: Some(recommendation),
            },
            CnameError::Validation(message) => ToolError::validation(message),
            CnameError::Conflict(message) => ToolError::Validation {
                message,
                recommendation: Some("pick another subdomain".to_string()),
            },
            CnameError::NotFound(hostname) => ToolError::Validation {
                message: format!("cname `{hostname}` not found"),
                recommendation: Some("use tunnel_list_cnames to see your hostnames".to_string()),
            },
            CnameError::AccessDenied { .. } => ToolError::Execution {
                message: err.to_string(),
                recommendation: Some(
                    "only the owning project or the meta supervisor may do this".to_string(),
                ),
            },
            other => ToolError::execution(other.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct PortRequestParams {
    service: String,
    #[serde(default)]
    service_type: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
}

impl PortRequestParams {
    fn allocation_request(&self) -> AllocationRequest {
        let defaults = AllocationRequest::default();
        AllocationRequest {
            service_type: self.service_type.clone().unwrap_or(defaults.service_type),
            host: self.host.clone().unwrap_or(defaults.host),
            protocol: self.protocol.clone().unwrap_or(defaults.protocol),
        }
    }
}

struct PortGetOrAllocate {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for PortGetOrAllocate {
    async fn execute(&self, params: Value, ctx: &ProjectContext) -> Result<Value, ToolError> {
        let params: PortRequestParams = parse_params(params)?;
        let allocation = self
            .deps
            .allocator
            .get_or_allocate(&ctx.project, &params.service, &params.allocation_request())
            .await?;
        to_json(&allocation)
    }
}

struct PortAllocate {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for PortAllocate {
    async fn execute(&self, params: Value, ctx: &ProjectContext) -> Result<Value, ToolError> {
        let params: PortRequestParams = parse_params(params)?;
        let allocation = self
            .deps
            .allocator
            .allocate(&ctx.project, &params.service, &params.allocation_request())
            .await?;
        to_json(&allocation)
    }
}

#[derive(Deserialize)]
struct PortReleaseParams {
    service: String,
}

struct PortRelease {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for PortRelease {
    async fn execute(&self, params: Value, ctx: &ProjectContext) -> Result<Value, ToolError> {
        let params: PortReleaseParams = parse_params(params)?;
        let released = self
            .deps
            .allocator
            .release(&ctx.project, &params.service)
            .await?;
        Ok(json!({ "released": released }))
    }
}

struct PortAuditTool {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for PortAuditTool {
    async fn execute(&self, _params: Value, ctx: &ProjectContext) -> Result<Value, ToolError> {
        let snapshot = self.deps.topology.current();
        let audit = self
            .deps
            .allocator
            .audit(Some(&ctx.project), Some(&snapshot))
            .await?;
        to_json(&audit)
    }
}

struct PortSummary {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for PortSummary {
    async fn execute(&self, _params: Value, ctx: &ProjectContext) -> Result<Value, ToolError> {
        let summary = self.deps.allocator.summary(&ctx.project).await?;
        to_json(&summary)
    }
}

#[derive(Deserialize)]
struct SecretSetParams {
    key_path: String,
    value: String,
    description: String,
    #[serde(default)]
    expires_at: Option<String>,
}

struct SecretSet {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for SecretSet {
    async fn execute(&self, params: Value, _ctx: &ProjectContext) -> Result<Value, ToolError> {
        let params: SecretSetParams = parse_params(params)?;
        let expires_at = parse_expiry(params.expires_at)?;
        let metadata = self
            .deps
            .secrets
            .set(&params.key_path, &params.value, &params.description, expires_at)
            .await?;
        to_json(&metadata)
    }
}

#[derive(Deserialize)]
struct KeyPathParams {
    key_path: String,
}

struct SecretGet {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for SecretGet {
    async fn execute(&self, params: Value, ctx: &ProjectContext) -> Result<Value, ToolError> {
        let params: KeyPathParams = parse_params(params)?;
        let value = self
            .deps
            .secrets
            .get(&params.key_path, Some(&ctx.project))
            .await?;
        Ok(json!({ "key_path": params.key_path, "value": value }))
    }
}

#[derive(Deserialize, Default)]
struct SecretListParams {
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    service: Option<String>,
}

struct SecretList {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for SecretList {
    async fn execute(&self, params: Value, _ctx: &ProjectContext) -> Result<Value, ToolError> {
        let params: SecretListParams = parse_params(params)?;
        let listed = self
            .deps
            .secrets
            .list(&SecretFilter {
                scope: params.scope,
                project: params.project,
                service: params.service,
            })
            .await?;
        Ok(json!({ "secrets": listed }))
    }
}

struct SecretDelete {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for SecretDelete {
    async fn execute(&self, params: Value, _ctx: &ProjectContext) -> Result<Value, ToolError> {
        let params: KeyPathParams = parse_params(params)?;
        self.deps.secrets.delete(&params.key_path).await?;
        Ok(json!({ "deleted": params.key_path }))
    }
}

#[derive(Deserialize)]
struct SecretDetectParams {
    text: String,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    auto_store: bool,
    #[serde(default)]
    redact: bool,
    #[serde(default)]
    extract_all: bool,
}

struct SecretDetect {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for SecretDetect {
    async fn execute(&self, params: Value, ctx: &ProjectContext) -> Result<Value, ToolError> {
        let params: SecretDetectParams = parse_params(params)?;
        let detection_ctx = DetectionContext {
            question: params.question,
            project_name: Some(ctx.project.clone()),
            service_name: None,
        };

        let detections = if params.auto_store {
            self.deps
                .detector
                .auto_store(&self.deps.secrets, &params.text, &detection_ctx)
                .await?
                .into_iter()
                .collect()
        } else if params.extract_all {
            self.deps
                .detector
                .extract_all_secrets(&params.text, &detection_ctx)
        } else {
            self.deps
                .detector
                .detect_secret(&params.text, &detection_ctx)
                .into_iter()
                .collect()
        };

        let mut result = json!({
            "contains_secrets": self.deps.detector.contains_secrets(&params.text),
            "detections": detections,
        });
        if params.redact {
            result["redacted"] = json!(self.deps.detector.redact_secrets(&params.text));
        }
        Ok(result)
    }
}

#[derive(Deserialize)]
struct CnameParams {
    subdomain: String,
    #[serde(default)]
    domain: Option<String>,
    target_port: u16,
}

struct TunnelRequestCname {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for TunnelRequestCname {
    async fn execute(&self, params: Value, ctx: &ProjectContext) -> Result<Value, ToolError> {
        let params: CnameParams = parse_params(params)?;
        let outcome = self
            .deps
            .lifecycle
            .request_cname(&CnameRequest {
                subdomain: params.subdomain,
                domain: params.domain,
                target_port: params.target_port,
                project: ctx.project.clone(),
            })
            .await?;
        to_json(&outcome)
    }
}

#[derive(Deserialize)]
struct HostnameParams {
    hostname: String,
}

struct TunnelDeleteCname {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for TunnelDeleteCname {
    async fn execute(&self, params: Value, ctx: &ProjectContext) -> Result<Value, ToolError> {
        let params: HostnameParams = parse_params(params)?;
        self.deps
            .lifecycle
            .delete_cname(&params.hostname, &ctx.project)
            .await?;
        Ok(json!({ "deleted": params.hostname }))
    }
}

#[derive(Deserialize, Default)]
struct ListCnamesParams {
    #[serde(default)]
    all: bool,
}

struct TunnelListCnames {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for TunnelListCnames {
    async fn execute(&self, params: Value, ctx: &ProjectContext) -> Result<Value, ToolError> {
        let params: ListCnamesParams = parse_params(params)?;
        let project_filter = if params.all {
            if ctx.project != META_REQUESTER {
                return Err(ToolError::Execution {
                    message: "listing all projects' cnames requires the meta scope".to_string(),
                    recommendation: Some("omit `all` to list your own hostnames".to_string()),
                });
            }
            None
        } else {
            Some(ctx.project.as_str())
        };

        let cnames = self.deps.lifecycle.list_cnames(project_filter).await?;
        Ok(json!({ "cnames": cnames }))
    }
}

#[derive(Deserialize, Default)]
struct TunnelStatusParams {
    #[serde(default)]
    history: Option<i64>,
}

struct TunnelStatusTool {
    deps: ToolDeps,
}

#[async_trait]
impl ToolExecutor for TunnelStatusTool {
    async fn execute(&self, params: Value, _ctx: &ProjectContext) -> Result<Value, ToolError> {
        let params: TunnelStatusParams = parse_params(params)?;
        let report = self.deps.monitor.status();
        let events = self
            .deps
            .store
            .recent_tunnel_health(params.history.unwrap_or(10).clamp(1, 100))
            .await
            .map_err(|err| ToolError::execution(err.to_string()))?;

        Ok(json!({
            "status": report,
            "recent_events": events,
        }))
    }
}
