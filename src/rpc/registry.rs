//! Tool registry: the closed set of named operations endpoints can
//! dispatch to, with scope-based access control and execution counters.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("tool `{0}` is not registered")]
    NotFound(String),

    #[error("tool `{tool}` is not permitted for project `{project}`")]
    AccessDenied { tool: String, project: String },

    #[error("{message}")]
    Validation {
        message: String,
        recommendation: Option<String>,
    },

    #[error("{message}")]
    Execution {
        message: String,
        recommendation: Option<String>,
    },
}

impl ToolError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            recommendation: None,
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            recommendation: None,
        }
    }
}

/// Fixed per-endpoint execution context. Endpoints carry this plus a
/// registry handle and nothing else that is shared across projects.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectContext {
    pub project: String,
    pub working_dir: PathBuf,
    /// Allowlist from configuration. Empty means every global tool;
    /// project-scoped tools for this project are always permitted.
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolScope {
    Global,
    Projects(Vec<String>),
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, params: Value, ctx: &ProjectContext) -> Result<Value, ToolError>;
}

pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub scope: ToolScope,
    pub executor: Arc<dyn ToolExecutor>,
}

/// What `tools/list` advertises; never includes the executor.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("tool `{0}` is already registered")]
    Duplicate(String),
}

#[derive(Default)]
struct ExecutionCounters {
    per_tool: HashMap<String, u64>,
    per_project: HashMap<String, u64>,
}

/// Global and per-project tools, resolved by string key. Holds no back
/// pointer to the router; endpoints carry a handle to the registry only.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<Tool>>>,
    counters: Mutex<ExecutionCounters>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Tool) -> Result<(), RegistryError> {
        let mut tools = self.tools.write().expect("failed to acquire the lock");
        if tools.contains_key(&tool.name) {
            return Err(RegistryError::Duplicate(tool.name));
        }
        info!(tool = %tool.name, "tool registered");
        tools.insert(tool.name.clone(), Arc::new(tool));
        Ok(())
    }

    /// Tools this project may call, in stable name order.
    pub fn visible_for(&self, ctx: &ProjectContext) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().expect("failed to acquire the lock");
        let mut visible: Vec<ToolDescriptor> = tools
            .values()
            .filter(|tool| self.permitted(tool, ctx))
            .map(|tool| ToolDescriptor {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            })
            .collect();
        visible.sort_by(|a, b| a.name.cmp(&b.name));
        visible
    }

    pub async fn execute(
        &self,
        tool_name: &str,
        params: Value,
        ctx: &ProjectContext,
    ) -> Result<Value, ToolError> {
        let tool = {
            let tools = self.tools.read().expect("failed to acquire the lock");
            tools
                .get(tool_name)
                .cloned()
                .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?
        };
        if !self.permitted(&tool, ctx) {
            return Err(ToolError::AccessDenied {
                tool: tool_name.to_string(),
                project: ctx.project.clone(),
            });
        }

        let started = Instant::now();
        let result = tool.executor.execute(params, ctx).await;

        {
            let mut counters = self.counters.lock().expect("failed to acquire the lock");
            *counters.per_tool.entry(tool.name.clone()).or_default() += 1;
            *counters
                .per_project
                .entry(ctx.project.clone())
                .or_default() += 1;
        }
        debug!(
            tool = tool_name,
            project = %ctx.project,
            duration_ms = started.elapsed().as_millis() as u64,
            success = result.is_ok(),
            "tool executed"
        );
        result
    }

    pub fn tool_counters(&self) -> HashMap<String, u64> {
        self.counters
            .lock()
            .expect("failed to acquire the lock")
            .per_tool
            .clone()
    }

    pub fn project_counters(&self) -> HashMap<String, u64> {
        self.counters
            .lock()
            .expect("failed to acquire the lock")
            .per_project
            .clone()
    }

    fn permitted(&self, tool: &Tool, ctx: &ProjectContext) -> bool {
        match &tool.scope {
            ToolScope::Projects(projects) => projects.contains(&ctx.project),
            ToolScope::Global => {
                ctx.allowed_tools.is_empty() || ctx.allowed_tools.contains(&tool.name)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, params: Value, ctx: &ProjectContext) -> Result<Value, ToolError> {
            Ok(json!({"params": params, "project": ctx.project}))
        }
    }

    pub(crate) fn tool(name: &str, scope: ToolScope) -> Tool {
        Tool {
            name: name.to_string(),
            description: format!("{name} test tool"),
            input_schema: json!({"type": "object"}),
            scope,
            executor: Arc::new(EchoExecutor),
        }
    }

    pub(crate) fn ctx(project: &str) -> ProjectContext {
        ProjectContext {
            project: project.to_string(),
            working_dir: PathBuf::from("/srv/test"),
            allowed_tools: vec![],
        }
    }

    #[tokio::test]
    async fn global_tool_executes_for_any_project() {
        let registry = ToolRegistry::new();
        registry.register(tool("echo", ToolScope::Global)).unwrap();

        let result = registry
            .execute("echo", json!({"n": 1}), &ctx("consilio"))
            .await
            .unwrap();
        assert_eq!(result["project"], json!("consilio"));
        assert_eq!(registry.tool_counters().get("echo"), Some(&1));
    }

    #[tokio::test]
    async fn project_scoped_tool_rejects_other_projects() {
        let registry = ToolRegistry::new();
        registry
            .register(tool(
                "special",
                ToolScope::Projects(vec!["consilio".to_string()]),
            ))
            .unwrap();

        assert!(registry
            .execute("special", json!({}), &ctx("consilio"))
            .await
            .is_ok());
        assert_matches!(
            registry.execute("special", json!({}), &ctx("other")).await,
            Err(ToolError::AccessDenied { .. })
        );
    }

    #[tokio::test]
    async fn allowlist_restricts_global_tools() {
        let registry = ToolRegistry::new();
        registry.register(tool("echo", ToolScope::Global)).unwrap();
        registry.register(tool("other", ToolScope::Global)).unwrap();

        let mut restricted = ctx("consilio");
        restricted.allowed_tools = vec!["echo".to_string()];

        assert!(registry
            .execute("echo", json!({}), &restricted)
            .await
            .is_ok());
        assert_matches!(
            registry.execute("other", json!({}), &restricted).await,
            Err(ToolError::AccessDenied { .. })
        );

        let visible: Vec<String> = registry
            .visible_for(&restricted)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(visible, vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        assert_matches!(
            registry.execute("ghost", json!({}), &ctx("consilio")).await,
            Err(ToolError::NotFound(_))
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ToolRegistry::new();
        registry.register(tool("echo", ToolScope::Global)).unwrap();
        assert_matches!(
            registry.register(tool("echo", ToolScope::Global)),
            Err(RegistryError::Duplicate(_))
        );
    }

    #[test]
    fn listing_is_sorted_and_schema_bearing() {
        let registry = ToolRegistry::new();
        registry.register(tool("zeta", ToolScope::Global)).unwrap();
        registry.register(tool("alpha", ToolScope::Global)).unwrap();

        let listed = registry.visible_for(&ctx("consilio"));
        assert_eq!(listed[0].name, "alpha");
        assert_eq!(listed[1].name, "zeta");
        assert_eq!(listed[0].input_schema, json!({"type": "object"}));
    }
}
