//! Request and response schemas for the HTTP surface
//!
//! Kept in one module so the wire contract is visible in one place;
//! container and execution snapshots live with the manager.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mcp::types::ToolDescriptor;

/// Name of the header carrying the id of a streaming execution.
pub const EXECUTION_ID_HEADER: &str = "X-Execution-ID";

/// Default execution timeout, seconds.
pub const DEFAULT_EXECUTE_TIMEOUT_SECS: f64 = 120.0;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Body of `POST /containers`.
#[derive(Debug, Deserialize)]
pub struct CreateContainerRequest {
    /// Image tag; the server default is used when omitted.
    pub tag: Option<String>,
    #[serde(default)]
    pub binds: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub executor_port: Option<u16>,
    pub resource_port: Option<u16>,
    #[serde(default)]
    pub show_pull_progress: bool,
}

/// Body of `POST /containers/{id}/firewall`.
#[derive(Debug, Deserialize)]
pub struct FirewallRequest {
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

/// Body of the execute and execute-stream endpoints.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub timeout: Option<f64>,
}

impl ExecuteRequest {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.timeout.unwrap_or(DEFAULT_EXECUTE_TIMEOUT_SECS))
    }
}

/// Body of `POST /containers/{id}/execute`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub has_images: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_trace: Option<String>,
    pub completed: bool,
}

/// `relpath` query of the MCP convenience endpoints.
#[derive(Debug, Deserialize)]
pub struct RelpathQuery {
    #[serde(default = "default_relpath")]
    pub relpath: String,
}

fn default_relpath() -> String {
    "mcpgen".to_string()
}

/// Body of `PUT /containers/{id}/mcp/{server_name}`.
#[derive(Debug, Deserialize)]
pub struct RegisterMcpRequest {
    pub server_params: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterMcpResponse {
    pub server_name: String,
    pub tool_names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct McpToolsResponse {
    pub server_name: String,
    pub tools: Vec<ToolDescriptor>,
}

/// Body of `POST /containers/{id}/mcp/{server_name}/{tool_name}`.
#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    #[serde(default)]
    pub params: Value,
    pub timeout: Option<f64>,
}

impl ToolCallRequest {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.timeout.unwrap_or(DEFAULT_EXECUTE_TIMEOUT_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_defaults() {
        let request: CreateContainerRequest = serde_json::from_str("{}").expect("parses");
        assert!(request.tag.is_none());
        assert!(request.binds.is_empty());
        assert!(!request.show_pull_progress);
    }

    #[test]
    fn test_execute_request_default_timeout() {
        let request: ExecuteRequest =
            serde_json::from_str(r#"{"code": "print(1)"}"#).expect("parses");
        assert_eq!(request.timeout(), std::time::Duration::from_secs(120));
    }

    #[test]
    fn test_relpath_query_default() {
        let query: RelpathQuery = serde_json::from_str("{}").expect("parses");
        assert_eq!(query.relpath, "mcpgen");
    }

    #[test]
    fn test_execute_response_omits_empty_fields() {
        let response = ExecuteResponse {
            execution_id: "e-1".to_string(),
            text: Some("hi\n".to_string()),
            has_images: false,
            error: None,
            error_trace: None,
            completed: true,
        };
        let encoded = serde_json::to_string(&response).expect("serializes");
        assert!(!encoded.contains("error"));
        assert!(encoded.contains("\"completed\":true"));
    }
}
