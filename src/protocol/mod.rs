//! JSON-RPC 2.0 framing and the MCP session handshake.
pub mod client;

pub use client::{ProtocolClient, RequestOptions, RequestOutcome};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "2025-06-18";
pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_NOT_FOUND: i64 = -32601;

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PROGRESS: &str = "notifications/progress";
    pub const CANCELLED: &str = "notifications/cancelled";
}

/// Progress reported by the peer for a long-running request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// What the peer reported during `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: ServerInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl InitializeResult {
    /// Whether the peer advertised a capability such as `"tools"`.
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities
            .get(capability)
            .map(|v| !v.is_null())
            .unwrap_or(false)
    }
}

/// Classification of one inbound JSON-RPC message.
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming<'a> {
    Response { id: u64 },
    Request { id: &'a Value, method: &'a str },
    Notification { method: &'a str },
    Unknown,
}

pub(crate) fn classify(message: &Value) -> Incoming<'_> {
    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").filter(|id| !id.is_null());
    match (method, id) {
        (Some(method), Some(id)) => Incoming::Request { id, method },
        (Some(method), None) => Incoming::Notification { method },
        (None, Some(id)) if message.get("result").is_some() || message.get("error").is_some() => {
            match request_id(id) {
                Some(id) => Incoming::Response { id },
                None => Incoming::Unknown,
            }
        }
        _ => Incoming::Unknown,
    }
}

/// Our ids are integers, but some peers echo them back as strings.
fn request_id(id: &Value) -> Option<u64> {
    id.as_u64()
        .or_else(|| id.as_str().and_then(|s| s.parse().ok()))
}

/// Progress tokens may be strings or numbers on the wire.
pub(crate) fn token_key(token: &Value) -> String {
    match token {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn request(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "method": method, "params": params })
}

pub(crate) fn notification(method: &str, params: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "method": method, "params": params })
}

pub(crate) fn result_response(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

pub(crate) fn error_response(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": { "code": code, "message": message } })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_inbound_messages() {
        assert_eq!(
            classify(&json!({ "jsonrpc": "2.0", "id": 4, "result": {} })),
            Incoming::Response { id: 4 }
        );
        assert_eq!(
            classify(&json!({ "jsonrpc": "2.0", "id": "9", "error": { "code": 1, "message": "x" } })),
            Incoming::Response { id: 9 }
        );
        assert!(matches!(
            classify(&json!({ "jsonrpc": "2.0", "id": "srv-1", "method": "ping" })),
            Incoming::Request { method: "ping", .. }
        ));
        assert_eq!(
            classify(&json!({ "jsonrpc": "2.0", "method": "notifications/progress", "params": {} })),
            Incoming::Notification {
                method: "notifications/progress"
            }
        );
        assert_eq!(classify(&json!({ "jsonrpc": "2.0", "id": 1 })), Incoming::Unknown);
    }

    #[test]
    fn initialize_result_reads_capabilities() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {}, "prompts": null },
            "serverInfo": { "name": "calc-server", "version": "0.2.0" },
            "instructions": "Use add for sums."
        }))
        .unwrap();
        assert!(result.supports("tools"));
        assert!(!result.supports("prompts"));
        assert!(!result.supports("resources"));
        assert_eq!(result.server_info.name, "calc-server");
    }

    #[test]
    fn token_keys_normalize_numbers_and_strings() {
        assert_eq!(token_key(&json!(7)), "7");
        assert_eq!(token_key(&json!("abc")), "abc");
    }
}
