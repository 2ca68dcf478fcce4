//! Shared test doubles for the container runtime and the per-container
//! RPC clients. Behavior is keyed off the submitted code so tests can
//! drive success, failure and streaming paths without Docker.

// Not every test crate uses every helper.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};

use ipybox_server::executor::{CodeExecutor, ExecError, ExecutionOutput, OutputStream};
use ipybox_server::mcp::types::{ToolDescriptor, ToolInputSchema, ToolProperty};
use ipybox_server::resources::{ContainerResources, ResourceError};
use ipybox_server::runtime::{ContainerRuntime, ContainerSpec, LaunchedContainer, RuntimeError};

/// Executor double: interprets a handful of code shapes used by tests.
#[derive(Default)]
pub struct FakeExecutor;

fn interpret(code: &str) -> Result<ExecutionOutput, ExecError> {
    if code.contains("undefined_variable") {
        return Err(ExecError::Execution {
            message: "NameError: name 'undefined_variable' is not defined".to_string(),
            trace: "Traceback (most recent call last):\n  File \"<stdin>\", line 1".to_string(),
        });
    }
    if code.contains("time.sleep(9999)") {
        return Err(ExecError::Timeout);
    }
    if code.contains("json.dumps") {
        // Tool-call snippet rendered by the MCP convenience surface.
        return Ok(ExecutionOutput {
            text: Some("{\"result\": \"ok\"}\n".to_string()),
            images: Vec::new(),
        });
    }
    if let Some(inner) = code
        .trim()
        .strip_prefix("print('")
        .and_then(|rest| rest.strip_suffix("')"))
    {
        return Ok(ExecutionOutput {
            text: Some(format!("{inner}\n")),
            images: Vec::new(),
        });
    }
    Ok(ExecutionOutput {
        text: None,
        images: Vec::new(),
    })
}

#[async_trait]
impl CodeExecutor for FakeExecutor {
    async fn execute(&self, code: &str, _timeout: Duration) -> Result<ExecutionOutput, ExecError> {
        interpret(code)
    }

    async fn execute_stream(
        &self,
        code: &str,
        _timeout: Duration,
    ) -> Result<OutputStream, ExecError> {
        let items: Vec<Result<String, ExecError>> = if code.contains("range(3)") {
            (0..3).map(|i| Ok(i.to_string())).collect()
        } else {
            match interpret(code) {
                Ok(output) => output
                    .text
                    .map(|text| Ok(text.trim_end().to_string()))
                    .into_iter()
                    .collect(),
                Err(err) => vec![Err(err)],
            }
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

/// Resource double backed by in-memory maps.
#[derive(Default)]
pub struct FakeResources {
    files: Mutex<HashMap<String, Bytes>>,
    directories: Mutex<HashMap<String, Bytes>>,
    servers: Mutex<HashMap<String, Vec<String>>>,
    pub firewall_domains: Mutex<Vec<String>>,
}

#[async_trait]
impl ContainerResources for FakeResources {
    async fn upload_file(&self, relpath: &str, data: Bytes) -> Result<(), ResourceError> {
        self.files.lock().unwrap().insert(relpath.to_string(), data);
        Ok(())
    }

    async fn download_file(&self, relpath: &str) -> Result<Bytes, ResourceError> {
        self.files
            .lock()
            .unwrap()
            .get(relpath)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(format!("file {relpath} not found")))
    }

    async fn delete_file(&self, relpath: &str) -> Result<(), ResourceError> {
        self.files
            .lock()
            .unwrap()
            .remove(relpath)
            .map(|_| ())
            .ok_or_else(|| ResourceError::NotFound(format!("file {relpath} not found")))
    }

    async fn upload_directory(&self, relpath: &str, archive: Bytes) -> Result<(), ResourceError> {
        self.directories
            .lock()
            .unwrap()
            .insert(relpath.to_string(), archive);
        Ok(())
    }

    async fn download_directory(&self, relpath: &str) -> Result<Bytes, ResourceError> {
        self.directories
            .lock()
            .unwrap()
            .get(relpath)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(format!("directory {relpath} not found")))
    }

    async fn init_firewall(&self, allowed_domains: &[String]) -> Result<(), ResourceError> {
        *self.firewall_domains.lock().unwrap() = allowed_domains.to_vec();
        Ok(())
    }

    async fn generate_mcp_sources(
        &self,
        _relpath: &str,
        server_name: &str,
        server_params: &Value,
    ) -> Result<Vec<String>, ResourceError> {
        let tool_names: Vec<String> = server_params
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| vec!["echo".to_string()]);
        self.servers
            .lock()
            .unwrap()
            .insert(server_name.to_string(), tool_names.clone());
        Ok(tool_names)
    }

    async fn get_mcp_sources(
        &self,
        _relpath: &str,
        server_name: &str,
    ) -> Result<BTreeMap<String, ToolDescriptor>, ResourceError> {
        let servers = self.servers.lock().unwrap();
        let tool_names = servers
            .get(server_name)
            .ok_or_else(|| ResourceError::NotFound(format!("MCP server {server_name} not found")))?;
        Ok(tool_names
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    ToolDescriptor {
                        name: name.clone(),
                        description: format!("{name} tool"),
                        input_schema: ToolInputSchema {
                            properties: BTreeMap::from([(
                                "message".to_string(),
                                ToolProperty {
                                    property_type: "string".to_string(),
                                    description: Some("message to process".to_string()),
                                },
                            )]),
                            required: vec!["message".to_string()],
                        },
                        output_schema: None,
                    },
                )
            })
            .collect())
    }
}

/// Runtime double: hands out fake clients and records terminations.
#[derive(Default)]
pub struct FakeRuntime {
    launches: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub terminated: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn launch(&self, _spec: &ContainerSpec) -> Result<LaunchedContainer, RuntimeError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Start("image pull failed".to_string()));
        }
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(LaunchedContainer {
            runtime_id: format!("fake-runtime-{n}"),
            executor_port: 42000 + n as u16,
            resource_port: 43000 + n as u16,
            executor: Arc::new(FakeExecutor),
            resources: Arc::new(FakeResources::default()),
        })
    }

    async fn terminate(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.terminated.lock().unwrap().push(runtime_id.to_string());
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(RuntimeError::Stop("no such container".to_string()));
        }
        Ok(())
    }
}

/// Shell one-liner echoing every stdin line back to stdout, the minimal
/// well-behaved stdio MCP server.
pub fn echo_command() -> (String, Vec<String>) {
    (
        "sh".to_string(),
        vec![
            "-c".to_string(),
            r#"while IFS= read -r line; do printf '%s\n' "$line"; done"#.to_string(),
        ],
    )
}

/// JSON helper for assertions on response bodies.
pub fn as_json(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|err| panic!("invalid JSON body {body:?}: {err}"))
}

#[allow(dead_code)]
pub fn sample_params() -> Value {
    json!({"command": "uvx", "args": ["mcp-server-fetch"]})
}
