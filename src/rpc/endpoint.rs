//! Per-project JSON-RPC 2.0 endpoint. Holds the fixed project context,
//! a bounded request log and local counters; all shared behavior lives
//! behind the registry handle.

use super::protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR, TOOL_ACCESS_DENIED, TOOL_EXECUTION_ERROR, TOOL_NOT_FOUND,
    VALIDATION_ERROR,
};
use super::registry::{ProjectContext, ToolError, ToolRegistry};
use crate::secrets::detector::SecretDetector;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const PROTOCOL_VERSION: &str = "2.0";
const REQUEST_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct RequestLogEntry {
    pub at: DateTime<Utc>,
    pub method: String,
    pub success: bool,
}

pub struct ProjectEndpoint {
    ctx: ProjectContext,
    registry: Arc<ToolRegistry>,
    detector: Arc<SecretDetector>,
    request_log: Mutex<VecDeque<RequestLogEntry>>,
    request_count: AtomicU64,
    error_count: AtomicU64,
}

#[derive(Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl ProjectEndpoint {
    pub fn new(
        ctx: ProjectContext,
        registry: Arc<ToolRegistry>,
        detector: Arc<SecretDetector>,
    ) -> Self {
        Self {
            ctx,
            registry,
            detector,
            request_log: Mutex::new(VecDeque::with_capacity(REQUEST_LOG_CAPACITY)),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn project(&self) -> &str {
        &self.ctx.project
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn recent_requests(&self) -> Vec<RequestLogEntry> {
        self.request_log
            .lock()
            .expect("failed to acquire the lock")
            .iter()
            .cloned()
            .collect()
    }

    /// Handles one HTTP body. `None` means a notification: no response
    /// goes on the wire.
    pub async fn handle_body(&self, body: &[u8]) -> Option<JsonRpcResponse> {
        let parsed: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(err) => {
                self.track("<parse>", false);
                return Some(JsonRpcResponse::failure(
                    Value::Null,
                    JsonRpcError::new(PARSE_ERROR, format!("invalid JSON: {err}")),
                ));
            }
        };

        // One logical endpoint per call: batches are not accepted.
        if parsed.is_array() {
            self.track("<batch>", false);
            return Some(JsonRpcResponse::failure(
                Value::Null,
                JsonRpcError::new(INVALID_REQUEST, "batch requests are not supported")
                    .with_recommendation("send one request object per HTTP call"),
            ));
        }

        let request: JsonRpcRequest = match serde_json::from_value(parsed) {
            Ok(request) => request,
            Err(err) => {
                self.track("<invalid>", false);
                return Some(JsonRpcResponse::failure(
                    Value::Null,
                    JsonRpcError::new(INVALID_REQUEST, format!("malformed request: {err}")),
                ));
            }
        };
        self.handle_request(request).await
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if !request.is_well_formed() {
            self.track(&request.method, false);
            return Some(JsonRpcResponse::failure(
                request.id.unwrap_or(Value::Null),
                JsonRpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
            ));
        }

        let outcome = self.dispatch(&request).await;
        self.track(&request.method, outcome.is_ok());

        if request.is_notification() {
            debug!(method = %request.method, "notification handled, no response");
            return None;
        }
        let id = request.id.unwrap_or(Value::Null);
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::failure(id, error),
        })
    }

    async fn dispatch(&self, request: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        match request.method.as_str() {
            "initialize" => Ok(self.initialize_result()),
            "ping" => Ok(json!({ "project": self.ctx.project, "pong": true })),
            "tools/list" => Ok(json!({ "tools": self.registry.visible_for(&self.ctx) })),
            "tools/call" => self.call_tool(request.params.clone()).await,
            other => Err(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("method `{other}` is not supported"),
            )
            .with_recommendation(
                "use initialize, tools/list, tools/call or ping",
            )),
        }
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocol_version": PROTOCOL_VERSION,
            "server_info": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "project": {
                "name": self.ctx.project,
                "working_dir": self.ctx.working_dir,
            },
            "capabilities": { "tools": {} },
        })
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: ToolCallParams = params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| JsonRpcError::new(INVALID_PARAMS, format!("invalid params: {err}")))?
            .ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "params object is required"))?;

        self.registry
            .execute(&params.name, params.arguments, &self.ctx)
            .await
            .map_err(|err| self.tool_error_to_rpc(err))
    }

    /// Maps tool errors into the custom code space. Messages cross the
    /// boundary redacted so no secret material ever reaches a client in
    /// an error.
    fn tool_error_to_rpc(&self, err: ToolError) -> JsonRpcError {
        let redact = |s: String| self.detector.redact_secrets(&s);
        match err {
            ToolError::NotFound(tool) => {
                JsonRpcError::new(TOOL_NOT_FOUND, format!("tool `{tool}` not found"))
                    .with_recommendation("call tools/list to see the tools available to you")
            }
            ToolError::AccessDenied { tool, project } => JsonRpcError::new(
                TOOL_ACCESS_DENIED,
                format!("tool `{tool}` is not permitted for project `{project}`"),
            )
            .with_recommendation("ask the meta supervisor to add the tool to your allowlist"),
            ToolError::Validation {
                message,
                recommendation,
            } => {
                let error = JsonRpcError::new(VALIDATION_ERROR, redact(message));
                match recommendation {
                    Some(rec) => error.with_recommendation(redact(rec)),
                    None => error.with_recommendation("check the tool input schema"),
                }
            }
            ToolError::Execution {
                message,
                recommendation,
            } => {
                let error = JsonRpcError::new(TOOL_EXECUTION_ERROR, redact(message));
                match recommendation {
                    Some(rec) => error.with_recommendation(redact(rec)),
                    None => error,
                }
            }
        }
    }

    fn track(&self, method: &str, success: bool) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }

        let mut log = self.request_log.lock().expect("failed to acquire the lock");
        if log.len() == REQUEST_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(RequestLogEntry {
            at: Utc::now(),
            method: method.to_string(),
            success,
        });
    }
}
