//! JSON-RPC 2.0 request and response envelopes.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Reserved error codes.
pub mod codes {
    pub const INTERNAL_ERROR: i32 = 10001;
    pub const DISABLED_METHOD: i32 = 10002;
    pub const RATE_LIMITED: i32 = 10003;
    pub const UPSTREAM_CONNECTION_CLOSED: i32 = 50001;
    pub const UPSTREAM_TIMEOUT: i32 = 50002;
    pub const RESPONSE_TIMEOUT: i32 = 50003;
    /// No upstream link could be leased in time.
    pub const UPSTREAM_BUSY: i32 = 50004;
}

pub const JSONRPC_VERSION: &str = "2.0";

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// Keeps an explicit `null` as `Some(Value::Null)` instead of `None`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// An inbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: u64,
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            jsonrpc: default_version(),
            method: method.into(),
            params,
        }
    }

    /// Positional params, if the call uses them.
    pub fn params_array(&self) -> Option<&[Value]> {
        self.params.as_array().map(Vec::as_slice)
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A reply, either produced upstream or synthesized by the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: u64,
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            jsonrpc: default_version(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: RpcError) -> Self {
        Self {
            id,
            jsonrpc: default_version(),
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Copy of this response answering a different request id.
    pub fn with_id(&self, id: u64) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }
}

pub fn decode_request(bytes: &[u8]) -> serde_json::Result<RpcRequest> {
    serde_json::from_slice(bytes)
}

pub fn decode_response(bytes: &[u8]) -> serde_json::Result<RpcResponse> {
    serde_json::from_slice(bytes)
}

pub fn encode_response(response: &RpcResponse) -> serde_json::Result<String> {
    serde_json::to_string(response)
}
