//! MCP proxy
//!
//! Bridges HTTP clients to stdio MCP servers: keeps the session
//! registry, correlates JSON-RPC requests with responses by id, reaps
//! idle sessions, and materialises both the JSON and the SSE response
//! shapes of the streamable HTTP transport.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::ACCEPT;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Json, Response, Sse};
use axum::routing::post;
use axum::Router;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::ServerError;
use crate::manager::ContainerManager;
use crate::mcp::session::{McpSession, SessionError};
use crate::mcp::types::{
    self, internal_error_frame, parse_error_frame, timeout_frame, JsonRpcRequest, RpcPayload,
};

/// Session id header of the MCP streamable HTTP transport.
pub const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Per-frame timeout of the response correlator.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the channel backing a correlator frame stream.
const FRAME_CHANNEL_CAPACITY: usize = 64;

pub struct McpProxy {
    sessions: RwLock<HashMap<String, Arc<McpSession>>>,
    session_timeout: Duration,
    cleanup_interval: Duration,
    receive_timeout: Duration,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl McpProxy {
    pub fn new(session_timeout: Duration, cleanup_interval: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            session_timeout,
            cleanup_interval,
            receive_timeout: RECEIVE_TIMEOUT,
            reaper: Mutex::new(None),
        }
    }

    /// Override the correlator's per-frame timeout. Test hook; the
    /// production value is 30 s.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Start the idle-session reaper.
    pub async fn start(self: &Arc<Self>) {
        let proxy = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(proxy.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                proxy.reap_idle().await;
            }
        });
        *self.reaper.lock().await = Some(handle);
        info!("MCP proxy started");
    }

    /// Stop the reaper, then every live session.
    pub async fn stop(&self) {
        if let Some(handle) = self.reaper.lock().await.take() {
            handle.abort();
        }
        let sessions: Vec<Arc<McpSession>> = {
            let mut registry = self.sessions.write().await;
            registry.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.stop().await;
        }
        info!("MCP proxy stopped");
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn reap_idle(&self) {
        let idle: Vec<String> = {
            let registry = self.sessions.read().await;
            registry
                .iter()
                .filter(|(_, session)| session.is_idle(self.session_timeout))
                .map(|(id, _)| id.clone())
                .collect()
        };

        for session_id in idle {
            let session = self.sessions.write().await.remove(&session_id);
            if let Some(session) = session {
                info!("reaping idle MCP session {}", session_id);
                session.stop().await;
            }
        }
    }

    /// Return the session a client asked for, or mint and start a fresh
    /// one. A provided id is only honoured when the stored session
    /// belongs to the same `(container, server)` pair.
    pub async fn get_or_create_session(
        &self,
        container_id: &str,
        server_name: &str,
        session_id: Option<&str>,
        command: Option<String>,
        args: Option<Vec<String>>,
    ) -> Result<(String, Arc<McpSession>), ServerError> {
        if let Some(session_id) = session_id {
            let registry = self.sessions.read().await;
            if let Some(session) = registry.get(session_id) {
                if session.container_id() == container_id && session.server_name() == server_name {
                    session.touch();
                    return Ok((session_id.to_string(), Arc::clone(session)));
                }
            }
        }

        let new_session_id = format!("mcp-{}", Uuid::new_v4());
        let command = command.unwrap_or_else(|| "uvx".to_string());
        let args = args.unwrap_or_else(|| {
            vec![
                "supergateway".to_string(),
                "--stdio".to_string(),
                format!("mcp-server-{server_name}"),
            ]
        });

        let session = Arc::new(McpSession::new(
            new_session_id.clone(),
            container_id.to_string(),
            server_name.to_string(),
            command,
            args,
            None,
            HashMap::new(),
        ));

        session.start().await.map_err(|err| {
            ServerError::SessionStart(format!(
                "Failed to start MCP session for server {server_name}: {err}"
            ))
        })?;

        self.sessions
            .write()
            .await
            .insert(new_session_id.clone(), Arc::clone(&session));
        Ok((new_session_id, session))
    }

    /// Correlate one JSON-RPC request over a session and return the lazy
    /// frame sequence. Notifications produce an empty sequence.
    ///
    /// The correlator assumes one in-flight request per session;
    /// concurrent calls with the same session id are the caller's
    /// responsibility to avoid.
    pub fn handle(
        &self,
        session: Arc<McpSession>,
        request: JsonRpcRequest,
    ) -> ReceiverStream<Value> {
        self.handle_payload(session, RpcPayload::Single(request))
    }

    /// Like [`handle`](Self::handle), but drives a whole payload. Batch
    /// requests run strictly in order on the shared session.
    pub fn handle_payload(
        &self,
        session: Arc<McpSession>,
        payload: RpcPayload,
    ) -> ReceiverStream<Value> {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let receive_timeout = self.receive_timeout;
        tokio::spawn(async move {
            let requests = match payload {
                RpcPayload::Single(request) => vec![request],
                RpcPayload::Batch(requests) => requests,
            };
            for request in requests {
                if !correlate(&session, &request, receive_timeout, &tx).await {
                    break;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}

/// Send one request and forward frames until the response with the
/// matching id. Returns `false` when the frame consumer went away.
async fn correlate(
    session: &McpSession,
    request: &JsonRpcRequest,
    receive_timeout: Duration,
    tx: &mpsc::Sender<Value>,
) -> bool {
    let request_id = request.request_id();
    let frame = match serde_json::to_value(request) {
        Ok(frame) => frame,
        Err(err) => {
            return tx
                .send(internal_error_frame(&err.to_string(), request_id))
                .await
                .is_ok();
        }
    };

    if let Err(err) = session.send(&frame).await {
        warn!("failed to forward frame to MCP server: {}", err);
        return tx
            .send(internal_error_frame(&err.to_string(), request_id))
            .await
            .is_ok();
    }

    if request.method == "initialize" {
        session.mark_initialized();
    }

    // Notifications get no response; stop here.
    if request.is_notification() {
        return true;
    }

    loop {
        match session.recv(Some(receive_timeout)).await {
            Ok(frame) => {
                // Intermediate frames (server-originated notifications)
                // are surfaced too; the matching id ends the exchange.
                let done = frame
                    .get("id")
                    .map(|id| *id == request_id)
                    .unwrap_or(false);
                if tx.send(frame).await.is_err() {
                    debug!("frame consumer dropped, abandoning correlation");
                    return false;
                }
                if done {
                    return true;
                }
            }
            Err(SessionError::Timeout) => {
                warn!(
                    "timeout waiting for MCP response on session {}",
                    session.session_id()
                );
                let _ = tx.send(timeout_frame(request_id)).await;
                return false;
            }
            Err(err) => {
                let _ = tx
                    .send(internal_error_frame(&err.to_string(), request_id))
                    .await;
                return false;
            }
        }
    }
}

#[derive(Clone)]
struct ProxyState {
    manager: Arc<ContainerManager>,
    proxy: Arc<McpProxy>,
}

/// Router for the streamable HTTP proxy endpoint.
pub fn create_proxy_router(manager: Arc<ContainerManager>, proxy: Arc<McpProxy>) -> Router {
    // The parameter is named `:id` to line up with the container routes
    // this router is merged into.
    Router::new()
        .route(
            "/containers/:id/mcp-proxy/:server_name",
            post(mcp_proxy_endpoint),
        )
        .with_state(ProxyState { manager, proxy })
}

async fn mcp_proxy_endpoint(
    State(state): State<ProxyState>,
    Path((container_id, server_name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // The container must exist; the lookup also renews its idle timer.
    if let Err(err) = state.manager.get(&container_id).await {
        return err.into_response();
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, Json(parse_error_frame())).into_response();
        }
    };

    let payload = match types::validate_payload(&payload) {
        Ok(payload) => payload,
        Err(frame) => {
            return (StatusCode::BAD_REQUEST, Json(frame)).into_response();
        }
    };

    let requested_session = headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok());

    let (session_id, session) = match state
        .proxy
        .get_or_create_session(&container_id, &server_name, requested_session, None, None)
        .await
    {
        Ok(resolved) => resolved,
        Err(err) => return err.into_response(),
    };

    let is_batch = payload.is_batch();
    let use_sse = headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false);

    let frames = state.proxy.handle_payload(session, payload);

    if use_sse {
        let stream = frames.map(|frame| {
            Ok::<_, Infallible>(Event::default().data(frame.to_string()))
        });
        let mut response = Sse::new(stream).into_response();
        if let Ok(value) = session_id.parse() {
            response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
        }
        return response;
    }

    let collected: Vec<Value> = frames.collect().await;
    let body = if is_batch {
        Value::Array(collected)
    } else {
        collected.into_iter().next().unwrap_or(Value::Null)
    };
    let mut response = Json(body).into_response();
    if let Ok(value) = session_id.parse() {
        response.headers_mut().insert(MCP_SESSION_ID_HEADER, value);
    }
    response
}
