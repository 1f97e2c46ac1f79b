//! JSON-RPC message envelopes.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ProofwireError;

/// Protocol version stamped on every outbound message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Reserved params member carrying the session state token.
pub const STATE_KEY: &str = "state";

/// Outbound message: a call (with id) or a notification (without).
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: &'a str,
    pub params: Map<String, Value>,
}

impl<'a> Request<'a> {
    /// A call expecting a correlated reply.
    pub fn call(id: u64, method: &'a str, params: Map<String, Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method,
            params,
        }
    }

    /// A notification; the server will not reply.
    pub fn notification(method: &'a str, params: Map<String, Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method,
            params,
        }
    }
}

/// The `error` member of a reply.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    /// Read an error object out of a reply, tolerating missing members.
    pub(crate) fn from_value(value: &Value) -> Self {
        Self {
            code: value.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            data: value.get("data").cloned(),
        }
    }
}

impl From<RpcError> for ProofwireError {
    fn from(error: RpcError) -> Self {
        ProofwireError::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}
