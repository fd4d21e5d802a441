//! Multi-project router: builds one endpoint per configured project and
//! dispatches by path segment. Reload swaps the endpoint set without
//! touching in-flight requests on existing endpoints.

use super::endpoint::ProjectEndpoint;
use super::registry::{ProjectContext, ToolRegistry};
use crate::config::ProjectConfig;
use crate::secrets::detector::SecretDetector;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_ms: u64,
    pub version: &'static str,
    pub request_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EndpointStats {
    pub project: String,
    pub request_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RouterStats {
    pub uptime_ms: u64,
    pub endpoints: Vec<EndpointStats>,
    pub tool_executions: HashMap<String, u64>,
    pub project_executions: HashMap<String, u64>,
}

pub struct RpcRouter {
    endpoints: RwLock<HashMap<String, Arc<ProjectEndpoint>>>,
    registry: Arc<ToolRegistry>,
    detector: Arc<SecretDetector>,
    started_at: Instant,
}

impl RpcRouter {
    pub fn new(
        projects: &[ProjectConfig],
        registry: Arc<ToolRegistry>,
        detector: Arc<SecretDetector>,
    ) -> Self {
        let router = Self {
            endpoints: RwLock::new(HashMap::new()),
            registry,
            detector,
            started_at: Instant::now(),
        };
        router.reload(projects);
        router
    }

    /// The endpoint serving `/mcp/{project}`, if the project exists.
    pub fn endpoint(&self, project: &str) -> Option<Arc<ProjectEndpoint>> {
        self.endpoints
            .read()
            .expect("failed to acquire the lock")
            .get(project)
            .cloned()
    }

    /// Rebuilds the endpoint set from a fresh project list. Endpoints
    /// are swapped wholesale; callers holding an `Arc` to an old one
    /// finish their in-flight requests undisturbed.
    pub fn reload(&self, projects: &[ProjectConfig]) {
        let endpoints: HashMap<String, Arc<ProjectEndpoint>> = projects
            .iter()
            .map(|project| {
                let ctx = ProjectContext {
                    project: project.name.clone(),
                    working_dir: project.working_dir.clone(),
                    allowed_tools: project.tools.clone(),
                };
                (
                    project.name.clone(),
                    Arc::new(ProjectEndpoint::new(
                        ctx,
                        self.registry.clone(),
                        self.detector.clone(),
                    )),
                )
            })
            .collect();

        info!(endpoints = endpoints.len(), "endpoint set rebuilt");
        *self.endpoints.write().expect("failed to acquire the lock") = endpoints;
    }

    pub fn project_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .endpoints
            .read()
            .expect("failed to acquire the lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn health(&self) -> HealthReport {
        let (requests, errors) = self.totals();
        HealthReport {
            status: "ok",
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            version: env!("CARGO_PKG_VERSION"),
            request_count: requests,
            error_count: errors,
        }
    }

    pub fn stats(&self) -> RouterStats {
        let endpoints = self.endpoints.read().expect("failed to acquire the lock");
        let mut per_endpoint: Vec<EndpointStats> = endpoints
            .values()
            .map(|endpoint| EndpointStats {
                project: endpoint.project().to_string(),
                request_count: endpoint.request_count(),
                error_count: endpoint.error_count(),
            })
            .collect();
        per_endpoint.sort_by(|a, b| a.project.cmp(&b.project));

        RouterStats {
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            endpoints: per_endpoint,
            tool_executions: self.registry.tool_counters(),
            project_executions: self.registry.project_counters(),
        }
    }

    fn totals(&self) -> (u64, u64) {
        let endpoints = self.endpoints.read().expect("failed to acquire the lock");
        endpoints.values().fold((0, 0), |(requests, errors), e| {
            (requests + e.request_count(), errors + e.error_count())
        })
    }
}
