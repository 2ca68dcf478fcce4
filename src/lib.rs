// ipybox-server - HTTP control plane for sandboxed code-execution containers
// Root library module

pub mod auth_middleware;
pub mod config;
pub mod errors;
pub mod executor;
pub mod http_server;
pub mod http_types;
pub mod manager;
pub mod mcp;
pub mod mcp_tools;
pub mod observability;
pub mod resources;
pub mod runtime;

// Re-export key types
pub use config::ServerConfig;
pub use errors::{ErrorBody, ServerError};
pub use executor::{CodeExecutor, ExecError, ExecutionOutput, HttpExecutor, OutputStream};
pub use http_server::{build_state, create_router, serve, AppState};
pub use manager::{
    ContainerHandle, ContainerInfo, ContainerManager, ContainerStatus, ExecutionState,
    ExecutionStatus,
};
pub use mcp::proxy::{McpProxy, MCP_SESSION_ID_HEADER};
pub use mcp::session::{McpSession, SessionError, SessionState};
pub use mcp::types::ToolDescriptor;
pub use observability::init_logging;
pub use resources::{ContainerResources, HttpResources, ResourceError};
pub use runtime::{
    docker_available, ContainerRuntime, ContainerSpec, DockerRuntime, LaunchedContainer,
    RuntimeError,
};
