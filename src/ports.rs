//! Range-based port allocation with liveness auditing. The store owns
//! the durable rows; this layer owns policy: range lookup, lowest-free
//! tie-break, audit probes.

use crate::docker::snapshot::TopologySnapshot;
use crate::store::models::PortAllocation;
use crate::store::ports::AllocationRequest;
use crate::store::{Store, StoreError};
use crate::utils::net::tcp_port_open;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Probe deadline for audit liveness checks.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum PortError {
    #[error("project `{0}` has no active port range assigned")]
    NoRangeAssigned(String),

    #[error("port range `{0}` is exhausted")]
    PortExhausted(String),

    #[error("service `{service}` of project `{project}` already has an active allocation")]
    DuplicateService { project: String, service: String },

    #[error("no active allocation for service `{service}` of project `{project}`")]
    NotFound { project: String, service: String },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for PortError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PortExhausted(range) => PortError::PortExhausted(range),
            StoreError::DuplicateService { project, service } => {
                PortError::DuplicateService { project, service }
            }
            other => PortError::Store(other),
        }
    }
}

/// TCP liveness seam, mockable in tests.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_open(&self, host: &str, port: u16) -> bool;
}

pub struct TcpProbe;

#[async_trait]
impl PortProbe for TcpProbe {
    async fn is_open(&self, host: &str, port: u16) -> bool {
        tcp_port_open(host, port, PROBE_TIMEOUT).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeSummary {
    pub range_start: u16,
    pub range_end: u16,
    pub total: u16,
    pub allocated: usize,
    pub available: usize,
    pub utilization_percent: u8,
}

/// One allocation as seen by the audit, with its probe outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditedAllocation {
    pub project: String,
    pub service_name: String,
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct PortAudit {
    pub allocated: usize,
    pub in_use: Vec<AuditedAllocation>,
    pub not_running: Vec<AuditedAllocation>,
    /// Allocations whose port is served by a container attributed to a
    /// different project.
    pub conflicts: Vec<AuditedAllocation>,
}

pub struct PortAllocator {
    store: Store,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            probe: Arc::new(TcpProbe),
        }
    }

    pub fn with_probe(store: Store, probe: Arc<dyn PortProbe>) -> Self {
        Self { store, probe }
    }

    /// Returns the existing active allocation when present, otherwise
    /// assigns the lowest free port in the project's range. Concurrent
    /// callers converge on one allocation: the losers of the insert race
    /// observe the winner's port.
    pub async fn get_or_allocate(
        &self,
        project: &str,
        service: &str,
        request: &AllocationRequest,
    ) -> Result<PortAllocation, PortError> {
        if let Some(existing) = self.store.active_allocation(project, service).await? {
            return Ok(existing);
        }
        match self.allocate(project, service, request).await {
            Err(PortError::DuplicateService { .. }) => self
                .store
                .active_allocation(project, service)
                .await?
                .ok_or_else(|| PortError::NotFound {
                    project: project.to_string(),
                    service: service.to_string(),
                }),
            other => other,
        }
    }

    /// Always assigns a new port; fails when the service already has one.
    pub async fn allocate(
        &self,
        project: &str,
        service: &str,
        request: &AllocationRequest,
    ) -> Result<PortAllocation, PortError> {
        let range = self
            .store
            .project_range(project)
            .await?
            .ok_or_else(|| PortError::NoRangeAssigned(project.to_string()))?;

        let allocation = self
            .store
            .allocate_port(project, &range, service, request)
            .await?;
        debug!(
            project,
            service,
            port = allocation.port,
            "port allocated"
        );
        Ok(allocation)
    }

    /// Soft delete; the port becomes reusable. Idempotent.
    pub async fn release(&self, project: &str, service: &str) -> Result<bool, PortError> {
        let released = self.store.release_allocation(project, service).await?;
        if released {
            debug!(project, service, "port released");
        }
        Ok(released)
    }

    /// Probes every active allocation and reports mismatches. Read-only:
    /// the audit never mutates allocation state.
    pub async fn audit(
        &self,
        project: Option<&str>,
        topology: Option<&TopologySnapshot>,
    ) -> Result<PortAudit, PortError> {
        let allocations = self.store.active_allocations(project).await?;
        let mut audit = PortAudit {
            allocated: allocations.len(),
            ..Default::default()
        };

        for allocation in &allocations {
            let entry = AuditedAllocation {
                project: allocation.project.clone(),
                service_name: allocation.service_name.clone(),
                port: allocation.port,
                host: allocation.host.clone(),
            };

            let conflicting = topology
                .and_then(|snapshot| {
                    snapshot.find_container_by_listening_port(allocation.port, None)
                })
                .is_some_and(|container| {
                    container
                        .project
                        .as_deref()
                        .is_some_and(|owner| owner != allocation.project)
                });
            if conflicting {
                audit.conflicts.push(entry);
                continue;
            }

            if self.probe.is_open(&allocation.host, allocation.port).await {
                audit.in_use.push(entry);
            } else {
                audit.not_running.push(entry);
            }
        }
        Ok(audit)
    }

    pub async fn summary(&self, project: &str) -> Result<RangeSummary, PortError> {
        let range = self
            .store
            .project_range(project)
            .await?
            .ok_or_else(|| PortError::NoRangeAssigned(project.to_string()))?;
        let allocated = self.store.active_allocations(Some(project)).await?.len();

        let total = range.capacity();
        let available = usize::from(total).saturating_sub(allocated);
        let utilization_percent = ((allocated * 100) / usize::from(total).max(1)) as u8;

        Ok(RangeSummary {
            range_start: range.start_port,
            range_end: range.end_port,
            total,
            allocated,
            available,
            utilization_percent,
        })
    }
}
