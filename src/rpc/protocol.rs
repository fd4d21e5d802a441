//! JSON-RPC 2.0 request/response shapes and the error code space.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

// Reserved JSON-RPC 2.0 codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Custom space.
pub const TOOL_NOT_FOUND: i64 = -32000;
pub const TOOL_ACCESS_DENIED: i64 = -32001;
pub const VALIDATION_ERROR: i64 = -32002;
pub const TOOL_EXECUTION_ERROR: i64 = -32003;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    /// Absent for notifications, which get no response.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_well_formed(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Every rejection tells the caller how to fix it.
    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        let mut data = match self.data.take() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        data.insert(
            "recommendation".to_string(),
            Value::String(recommendation.into()),
        );
        self.data = Some(Value::Object(data));
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_parses_with_and_without_id() {
        let call: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).unwrap();
        assert!(!call.is_notification());
        assert!(call.is_well_formed());

        let notification: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "method": "ping"})).unwrap();
        assert!(notification.is_notification());
    }

    #[test]
    fn wrong_version_is_malformed() {
        let request: JsonRpcRequest =
            serde_json::from_value(json!({"jsonrpc": "1.0", "id": 1, "method": "ping"})).unwrap();
        assert!(!request.is_well_formed());
    }

    #[test]
    fn error_serializes_recommendation_into_data() {
        let error = JsonRpcError::new(TOOL_ACCESS_DENIED, "tool not permitted")
            .with_recommendation("ask for access");
        let response = JsonRpcResponse::failure(json!(7), error);

        let serialized = serde_json::to_value(&response).unwrap();
        assert_eq!(serialized["error"]["code"], json!(TOOL_ACCESS_DENIED));
        assert_eq!(
            serialized["error"]["data"]["recommendation"],
            json!("ask for access")
        );
        assert!(serialized.get("result").is_none());
    }
}
