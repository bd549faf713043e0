//! JSON-RPC 2.0 envelope shared by the gateway's `/rpc` endpoint, the
//! worker's reverse `/rpc` endpoint, and [`crate::Error::to_rpc_error`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, ErrorKind};

pub const JSONRPC_VERSION: &str = "2.0";

/// Methods that may be called without a signed request body: bootstrapping
/// calls and reverse-direction calls the gateway itself makes.
pub const UNSIGNED_METHOD_ALLOWLIST: &[&str] = &["Worker.register", "Task.get", "Work.start", "Work.cancel", "PublicKey.upload"];

pub fn method_requires_signature(method: &str) -> bool {
    !UNSIGNED_METHOD_ALLOWLIST.contains(&method)
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&CoreError> for RpcError {
    fn from(err: &CoreError) -> Self {
        let data = err.field.as_ref().map(|field| serde_json::json!({ "field": field }));
        Self {
            code: err.kind().code(),
            message: err.to_string(),
            data,
        }
    }
}

impl RpcError {
    pub fn invalid_params(field: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: format!("invalid params: {}", field.into()),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("method not found: {method}"),
            data: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            code: ErrorKind::Unauthorized.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorKind::Internal.code(),
            message: message.into(),
            data: None,
        }
    }
}
