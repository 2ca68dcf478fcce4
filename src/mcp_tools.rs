//! Convenience MCP call surface
//!
//! Layered on the resource and executor contracts rather than the stdio
//! proxy: tool sources are generated inside the container, and a call
//! runs a small Python snippet against the generated module through the
//! container's executor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::ServerError;
use crate::executor::ExecError;
use crate::manager::ContainerHandle;
use crate::mcp::types::ToolDescriptor;

/// Outcome of one tool invocation, mirrored directly into the HTTP body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResponse {
    fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Run the generator for `server_name` and return the produced tool names.
pub async fn register_server(
    handle: &ContainerHandle,
    relpath: &str,
    server_name: &str,
    server_params: &Value,
) -> Result<Vec<String>, ServerError> {
    let tool_names = handle
        .resources
        .generate_mcp_sources(relpath, server_name, server_params)
        .await?;
    debug!(
        "registered MCP server {} with tools: {:?}",
        server_name, tool_names
    );
    Ok(tool_names)
}

/// Fetch the descriptors of all tools generated for `server_name`.
pub async fn list_tools(
    handle: &ContainerHandle,
    relpath: &str,
    server_name: &str,
) -> Result<Vec<ToolDescriptor>, ServerError> {
    let sources = handle.resources.get_mcp_sources(relpath, server_name).await?;
    Ok(sources.into_values().collect())
}

/// Invoke one generated tool inside the container's executor.
pub async fn call_tool(
    handle: &ContainerHandle,
    relpath: &str,
    server_name: &str,
    tool_name: &str,
    params: &Value,
    timeout: Duration,
) -> Result<ToolCallResponse, ServerError> {
    let sources = handle.resources.get_mcp_sources(relpath, server_name).await?;
    if !sources.contains_key(tool_name) {
        return Err(ServerError::NotFound(format!(
            "Tool {tool_name} not found for server {server_name}"
        )));
    }

    let code = render_call_snippet(relpath, server_name, tool_name, params);
    match handle.executor.execute(&code, timeout).await {
        Ok(output) => {
            let stdout = output.text.unwrap_or_default();
            match serde_json::from_str::<Value>(stdout.trim()) {
                Ok(parsed) => match parsed.get("result") {
                    Some(result) => Ok(ToolCallResponse::ok(result.clone())),
                    None => Ok(ToolCallResponse::failed(
                        "Tool produced no result".to_string(),
                    )),
                },
                Err(_) => Ok(ToolCallResponse::failed(format!(
                    "Failed to parse tool output: {}",
                    stdout.trim()
                ))),
            }
        }
        Err(ExecError::Execution { message, trace }) => {
            Ok(ToolCallResponse::failed(format!("{message}: {trace}")))
        }
        Err(ExecError::Timeout) => Ok(ToolCallResponse::failed("Execution timed out")),
        Err(err @ ExecError::Transport(_)) => Err(err.into()),
    }
}

/// Render the Python snippet that imports the generated tool module,
/// builds its `Params`, calls it, and prints the JSON-wrapped result.
fn render_call_snippet(relpath: &str, server_name: &str, tool_name: &str, params: &Value) -> String {
    let module = format!(
        "{}.{}.{}",
        relpath.trim_matches('/').replace('/', "."),
        server_name,
        tool_name
    );
    let params_json = params.to_string().replace('\\', "\\\\").replace('\'', "\\'");
    format!(
        "import json\n\
         from {module} import Params, {tool_name}\n\
         params = json.loads('''{params_json}''')\n\
         result = {tool_name}(Params(**params))\n\
         print(json.dumps({{\"result\": result}}))\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_call_snippet_builds_module_path() {
        let code = render_call_snippet("mcpgen", "fetchurl", "fetch", &json!({"url": "https://example.com"}));
        assert!(code.contains("from mcpgen.fetchurl.fetch import Params, fetch"));
        assert!(code.contains("result = fetch(Params(**params))"));
        assert!(code.contains(r#"{"url":"https://example.com"}"#));
    }

    #[test]
    fn test_render_call_snippet_handles_nested_relpath() {
        let code = render_call_snippet("generated/mcp", "echo", "say", &json!({}));
        assert!(code.contains("from generated.mcp.echo.say import Params, say"));
    }

    #[test]
    fn test_tool_call_response_shapes() {
        let ok = ToolCallResponse::ok(json!("ping"));
        assert_eq!(ok.result, Some(json!("ping")));
        assert!(ok.error.is_none());

        let failed = ToolCallResponse::failed("Execution timed out");
        assert!(failed.result.is_none());
        assert_eq!(failed.error.as_deref(), Some("Execution timed out"));
    }
}
