//! HTTP surface and application lifecycle
//!
//! Routes, handlers, and the `serve` entry point that wires the
//! container manager and the MCP proxy together, starts their reapers,
//! and tears everything down in order on shutdown.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::middleware;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Json, Response, Sse};
use axum::routing::{get, post, put};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth_middleware::auth_middleware;
use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::executor::ExecError;
use crate::http_types::{
    CreateContainerRequest, ExecuteRequest, ExecuteResponse, FirewallRequest, HealthResponse,
    McpToolsResponse, MessageResponse, RegisterMcpRequest, RegisterMcpResponse, RelpathQuery,
    ToolCallRequest, EXECUTION_ID_HEADER,
};
use crate::manager::{ContainerInfo, ContainerManager, ExecutionStatus};
use crate::mcp::proxy::{create_proxy_router, McpProxy};
use crate::mcp_tools;
use crate::runtime::{ContainerRuntime, ContainerSpec};

/// Terminal SSE event of a successful streaming execution.
const STREAM_DONE: &str = "[DONE]";
/// Prefix of the SSE event carrying a streaming execution failure.
const STREAM_ERROR_PREFIX: &str = "[ERROR]";

/// Maximum accepted upload size: 100MB.
const MAX_UPLOAD_SIZE: usize = 100 * 1024 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub manager: Arc<ContainerManager>,
    pub proxy: Arc<McpProxy>,
}

/// Construct the shared state from a configuration and a runtime adapter.
pub fn build_state(config: ServerConfig, runtime: Arc<dyn ContainerRuntime>) -> AppState {
    let config = Arc::new(config);
    let manager = Arc::new(ContainerManager::new(
        runtime,
        config.cleanup_interval,
        config.max_idle_time,
    ));
    let proxy = Arc::new(McpProxy::new(
        config.session_timeout,
        config.cleanup_interval,
    ));
    AppState {
        config,
        manager,
        proxy,
    }
}

/// Assemble the full router: API routes, the MCP proxy endpoint, the
/// authentication gate, CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = if state.config.cors_allow_any() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let proxy_router = create_proxy_router(Arc::clone(&state.manager), Arc::clone(&state.proxy));

    Router::new()
        .route("/health", get(health))
        .route("/containers", post(create_container).get(list_containers))
        .route(
            "/containers/:id",
            get(container_info).delete(delete_container),
        )
        .route("/containers/:id/firewall", post(init_firewall))
        .route("/containers/:id/execute", post(execute_code))
        .route("/containers/:id/execute/stream", post(execute_code_stream))
        .route("/executions/:id", get(execution_status))
        .route(
            "/containers/:id/mcp/:server_name",
            put(register_mcp_server).get(get_mcp_tools),
        )
        .route(
            "/containers/:id/mcp/:server_name/:tool_name",
            post(call_mcp_tool),
        )
        .route(
            "/containers/:id/files/*relpath",
            post(upload_file).get(download_file).delete(delete_file),
        )
        .route(
            "/containers/:id/directories/*relpath",
            post(upload_directory).get(download_directory),
        )
        .with_state(state.clone())
        .merge(proxy_router)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE))
}

/// Run the server until shutdown, then tear down the proxy, the
/// manager's reaper, and every remaining container, in that order.
pub async fn serve(config: ServerConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<()> {
    let state = build_state(config, runtime);
    state.manager.start_reaper().await;
    state.proxy.start().await;

    let app = create_router(state.clone());
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("ipybox-server listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    state.proxy.stop().await;
    state.manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to install ctrl-c handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {}", err),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn create_container(
    State(state): State<AppState>,
    Json(request): Json<CreateContainerRequest>,
) -> Result<Json<ContainerInfo>, ServerError> {
    let spec = ContainerSpec {
        tag: request
            .tag
            .unwrap_or_else(|| state.config.default_tag.clone()),
        binds: request.binds,
        env: request.env,
        executor_port: request.executor_port,
        resource_port: request.resource_port,
        show_pull_progress: request.show_pull_progress,
    };
    let info = state.manager.create(spec).await?;
    Ok(Json(info))
}

async fn list_containers(State(state): State<AppState>) -> Json<Vec<ContainerInfo>> {
    Json(state.manager.list().await)
}

async fn container_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContainerInfo>, ServerError> {
    Ok(Json(state.manager.info(&id).await?))
}

async fn delete_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ServerError> {
    state.manager.destroy(&id).await?;
    Ok(Json(MessageResponse::new(format!(
        "Container {id} destroyed"
    ))))
}

async fn init_firewall(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<FirewallRequest>,
) -> Result<Json<MessageResponse>, ServerError> {
    let handle = state.manager.get(&id).await?;
    handle
        .resources
        .init_firewall(&request.allowed_domains)
        .await?;
    Ok(Json(MessageResponse::new(format!(
        "Firewall initialized for container {id}"
    ))))
}

async fn execute_code(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, ServerError> {
    let handle = state.manager.get(&id).await?;
    let execution_id = Uuid::new_v4().to_string();
    state.manager.register_execution(&id, &execution_id).await?;

    match handle.executor.execute(&request.code, request.timeout()).await {
        Ok(output) => {
            state.manager.complete_execution(&execution_id, None).await;
            Ok(Json(ExecuteResponse {
                execution_id,
                has_images: !output.images.is_empty(),
                text: output.text,
                error: None,
                error_trace: None,
                completed: true,
            }))
        }
        Err(ExecError::Execution { message, trace }) => {
            state
                .manager
                .complete_execution(&execution_id, Some(message.clone()))
                .await;
            Ok(Json(ExecuteResponse {
                execution_id,
                text: None,
                has_images: false,
                error: Some(message),
                error_trace: Some(trace),
                completed: false,
            }))
        }
        Err(ExecError::Timeout) => {
            let message = "Execution timed out".to_string();
            state
                .manager
                .complete_execution(&execution_id, Some(message.clone()))
                .await;
            Ok(Json(ExecuteResponse {
                execution_id,
                text: None,
                has_images: false,
                error: Some(message),
                error_trace: None,
                completed: false,
            }))
        }
        Err(err @ ExecError::Transport(_)) => {
            state
                .manager
                .complete_execution(&execution_id, Some(err.to_string()))
                .await;
            Err(err.into())
        }
    }
}

async fn execute_code_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Response, ServerError> {
    let handle = state.manager.get(&id).await?;
    let execution_id = Uuid::new_v4().to_string();
    state.manager.register_execution(&id, &execution_id).await?;

    let chunks = match handle
        .executor
        .execute_stream(&request.code, request.timeout())
        .await
    {
        Ok(chunks) => chunks,
        Err(err) => {
            state
                .manager
                .complete_execution(&execution_id, Some(err.to_string()))
                .await;
            return Err(err.into());
        }
    };

    // Drive the executor stream on a task so execution bookkeeping runs
    // even if the client disconnects mid-stream.
    let (tx, rx) = mpsc::channel::<Event>(64);
    let manager = Arc::clone(&state.manager);
    let stream_execution_id = execution_id.clone();
    tokio::spawn(async move {
        let mut chunks = chunks;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    if tx.send(Event::default().data(chunk)).await.is_err() {
                        warn!("client disconnected from execution {}", stream_execution_id);
                    }
                }
                Err(err) => {
                    let detail = match &err {
                        ExecError::Execution { message, trace } if !trace.is_empty() => {
                            format!("{message}: {trace}")
                        }
                        other => other.to_string(),
                    };
                    manager
                        .complete_execution(&stream_execution_id, Some(detail.clone()))
                        .await;
                    let _ = tx
                        .send(Event::default().data(format!("{STREAM_ERROR_PREFIX} {detail}")))
                        .await;
                    return;
                }
            }
        }
        manager.complete_execution(&stream_execution_id, None).await;
        let _ = tx.send(Event::default().data(STREAM_DONE)).await;
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Sse::new(stream).into_response();
    if let Ok(value) = execution_id.parse() {
        response.headers_mut().insert(EXECUTION_ID_HEADER, value);
    }
    Ok(response)
}

async fn execution_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionStatus>, ServerError> {
    Ok(Json(state.manager.execution_status(&id).await?))
}

async fn register_mcp_server(
    State(state): State<AppState>,
    Path((id, server_name)): Path<(String, String)>,
    Query(query): Query<RelpathQuery>,
    Json(request): Json<RegisterMcpRequest>,
) -> Result<Json<RegisterMcpResponse>, ServerError> {
    let handle = state.manager.get(&id).await?;
    let tool_names =
        mcp_tools::register_server(&handle, &query.relpath, &server_name, &request.server_params)
            .await?;
    Ok(Json(RegisterMcpResponse {
        server_name,
        tool_names,
    }))
}

async fn get_mcp_tools(
    State(state): State<AppState>,
    Path((id, server_name)): Path<(String, String)>,
    Query(query): Query<RelpathQuery>,
) -> Result<Json<McpToolsResponse>, ServerError> {
    let handle = state.manager.get(&id).await?;
    let tools = mcp_tools::list_tools(&handle, &query.relpath, &server_name).await?;
    Ok(Json(McpToolsResponse { server_name, tools }))
}

async fn call_mcp_tool(
    State(state): State<AppState>,
    Path((id, server_name, tool_name)): Path<(String, String, String)>,
    Query(query): Query<RelpathQuery>,
    Json(request): Json<ToolCallRequest>,
) -> Result<Response, ServerError> {
    let handle = state.manager.get(&id).await?;
    let response = mcp_tools::call_tool(
        &handle,
        &query.relpath,
        &server_name,
        &tool_name,
        &request.params,
        request.timeout(),
    )
    .await?;
    Ok(Json(response).into_response())
}

/// Pull the first file field out of a multipart body.
async fn read_upload(multipart: &mut Multipart) -> Result<(String, Bytes), ServerError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ServerError::InvalidRequest(format!("invalid multipart body: {err}")))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|err| ServerError::InvalidRequest(format!("invalid multipart body: {err}")))?;
        return Ok((filename, data));
    }
    Err(ServerError::InvalidRequest(
        "multipart body must contain a file field".to_string(),
    ))
}

async fn upload_file(
    State(state): State<AppState>,
    Path((id, relpath)): Path<(String, String)>,
    mut multipart: Multipart,
) -> Result<Json<MessageResponse>, ServerError> {
    let handle = state.manager.get(&id).await?;
    let (filename, data) = read_upload(&mut multipart).await?;
    let target = format!("{relpath}/{filename}");
    handle.resources.upload_file(&target, data).await?;
    Ok(Json(MessageResponse::new(format!(
        "File uploaded to {target}"
    ))))
}

async fn download_file(
    State(state): State<AppState>,
    Path((id, relpath)): Path<(String, String)>,
) -> Result<Response, ServerError> {
    let handle = state.manager.get(&id).await?;
    let data = handle.resources.download_file(&relpath).await?;
    let basename = relpath.rsplit('/').next().unwrap_or(relpath.as_str());
    let mut response = data.into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = format!("attachment; filename={basename}").parse() {
        response.headers_mut().insert(CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn delete_file(
    State(state): State<AppState>,
    Path((id, relpath)): Path<(String, String)>,
) -> Result<Json<MessageResponse>, ServerError> {
    let handle = state.manager.get(&id).await?;
    handle.resources.delete_file(&relpath).await?;
    Ok(Json(MessageResponse::new(format!("File {relpath} deleted"))))
}

fn is_tar_archive(filename: &str) -> bool {
    filename.ends_with(".tar") || filename.ends_with(".tar.gz") || filename.ends_with(".tgz")
}

async fn upload_directory(
    State(state): State<AppState>,
    Path((id, relpath)): Path<(String, String)>,
    mut multipart: Multipart,
) -> Result<Json<MessageResponse>, ServerError> {
    let handle = state.manager.get(&id).await?;
    let (filename, data) = read_upload(&mut multipart).await?;
    if !is_tar_archive(&filename) {
        return Err(ServerError::InvalidRequest(format!(
            "Directory upload must be a .tar, .tar.gz or .tgz archive, got {filename}"
        )));
    }
    handle.resources.upload_directory(&relpath, data).await?;
    Ok(Json(MessageResponse::new(format!(
        "Directory uploaded to {relpath}"
    ))))
}

async fn download_directory(
    State(state): State<AppState>,
    Path((id, relpath)): Path<(String, String)>,
) -> Result<Response, ServerError> {
    let handle = state.manager.get(&id).await?;
    let data = handle.resources.download_directory(&relpath).await?;
    let basename = relpath.rsplit('/').next().unwrap_or(relpath.as_str());
    let mut response = data.into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/x-gzip"));
    if let Ok(value) = format!("attachment; filename={basename}.tar.gz").parse() {
        response.headers_mut().insert(CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_tar_archive() {
        assert!(is_tar_archive("data.tar"));
        assert!(is_tar_archive("data.tar.gz"));
        assert!(is_tar_archive("data.tgz"));
        assert!(!is_tar_archive("data.zip"));
        assert!(!is_tar_archive("data.gz"));
    }
}
