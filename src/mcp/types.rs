use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// JSON-RPC protocol version accepted and emitted by the proxy.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 error codes used by the proxy.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const INTERNAL_ERROR: i64 = -32603;

/// A single JSON-RPC 2.0 request as accepted by the proxy endpoint.
///
/// `id` of `None` (absent) or `Value::Null` marks a notification: the
/// proxy forwards the frame but emits no response for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    /// The correlation id, with absent and null collapsed to `Null`.
    pub fn request_id(&self) -> Value {
        self.id.clone().unwrap_or(Value::Null)
    }

    /// Whether this request is a notification (no response expected).
    pub fn is_notification(&self) -> bool {
        self.request_id().is_null()
    }

    fn validate(&self) -> Result<(), String> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(format!("jsonrpc must be \"2.0\", got {:?}", self.jsonrpc));
        }
        if self.method.is_empty() {
            return Err("method must not be empty".to_string());
        }
        match &self.id {
            None | Some(Value::Null) | Some(Value::String(_)) | Some(Value::Number(_)) => Ok(()),
            Some(other) => Err(format!("id must be a string, number or null, got {other}")),
        }
    }
}

/// A validated proxy request body: one request or a homogeneous batch.
#[derive(Debug, Clone)]
pub enum RpcPayload {
    Single(JsonRpcRequest),
    Batch(Vec<JsonRpcRequest>),
}

impl RpcPayload {
    pub fn is_batch(&self) -> bool {
        matches!(self, RpcPayload::Batch(_))
    }

    pub fn requests(&self) -> Vec<&JsonRpcRequest> {
        match self {
            RpcPayload::Single(request) => vec![request],
            RpcPayload::Batch(requests) => requests.iter().collect(),
        }
    }
}

/// Validate a parsed request body against the JSON-RPC 2.0 envelope rules.
///
/// On failure returns the ready-to-send `-32600` error frame. An invalid
/// element inside a batch yields one envelope with a null id rather than
/// per-element failures.
pub fn validate_payload(payload: &Value) -> Result<RpcPayload, Value> {
    match payload {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(invalid_request_frame("batch must not be empty", Value::Null));
            }
            let mut requests = Vec::with_capacity(items.len());
            for item in items {
                let request = parse_single(item)
                    .map_err(|reason| invalid_request_frame(&reason, Value::Null))?;
                requests.push(request);
            }
            Ok(RpcPayload::Batch(requests))
        }
        Value::Object(_) => {
            let id = payload.get("id").cloned().unwrap_or(Value::Null);
            let request =
                parse_single(payload).map_err(|reason| invalid_request_frame(&reason, id))?;
            Ok(RpcPayload::Single(request))
        }
        other => Err(invalid_request_frame(
            &format!("request must be an object or array, got {other}"),
            Value::Null,
        )),
    }
}

fn parse_single(value: &Value) -> Result<JsonRpcRequest, String> {
    let request: JsonRpcRequest =
        serde_json::from_value(value.clone()).map_err(|err| err.to_string())?;
    request.validate()?;
    Ok(request)
}

/// Build a JSON-RPC error frame with the given code, message and id.
pub fn error_frame(code: i64, message: &str, id: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "error": {
            "code": code,
            "message": message,
        },
        "id": id,
    })
}

/// The `-32700` envelope for unparsable request bodies.
pub fn parse_error_frame() -> Value {
    error_frame(PARSE_ERROR, "Parse error: Invalid JSON", Value::Null)
}

/// The `-32600` envelope for structurally invalid requests.
pub fn invalid_request_frame(reason: &str, id: Value) -> Value {
    error_frame(INVALID_REQUEST, &format!("Invalid Request: {reason}"), id)
}

/// The `-32603` envelope emitted when the MCP server does not answer in time.
pub fn timeout_frame(id: Value) -> Value {
    error_frame(
        INTERNAL_ERROR,
        "Timeout waiting for response from MCP server",
        id,
    )
}

/// The `-32603` envelope for correlator-internal failures.
pub fn internal_error_frame(detail: &str, id: Value) -> Value {
    error_frame(INTERNAL_ERROR, &format!("Internal error: {detail}"), id)
}

/// Schema of a single tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProperty {
    #[serde(rename = "type")]
    pub property_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Input schema advertised by a tool: a property map plus required names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolInputSchema {
    #[serde(default)]
    pub properties: BTreeMap<String, ToolProperty>,
    #[serde(default)]
    pub required: Vec<String>,
}

/// Descriptor of one tool exported by a registered MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: ToolInputSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}
