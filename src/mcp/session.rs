//! One MCP session: one stdio subprocess plus the plumbing to exchange
//! newline-delimited JSON-RPC frames with it.
//!
//! Three background tasks service the child: a writer draining the
//! outbound queue into stdin, a reader framing stdout lines into the
//! inbound queue, and a stderr drain that only logs. The child's stdin
//! and stdout are each touched by exactly one task; everything else goes
//! through the queues.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the inbound and outbound frame queues.
const QUEUE_CAPACITY: usize = 128;

/// Grace period between requesting termination and force-killing.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Active,
    Closing,
    Closed,
    Error,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("timed out waiting for a frame from the MCP server")]
    Timeout,

    #[error("invalid frame from MCP server: {0}")]
    Decode(String),

    #[error("session is in state {0:?}")]
    InvalidState(SessionState),

    #[error("failed to start MCP server: {0}")]
    Spawn(String),
}

#[derive(Debug)]
pub struct McpSession {
    session_id: String,
    container_id: String,
    server_name: String,
    command: String,
    args: Vec<String>,
    working_dir: Option<String>,
    env: HashMap<String, String>,

    state: RwLock<SessionState>,
    last_activity: RwLock<Instant>,
    initialized: AtomicBool,

    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    outbound_tx: mpsc::Sender<String>,
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    /// Populated by `start`; the reader task holds the only sender, so
    /// the queue closes exactly when the reader ends.
    inbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl McpSession {
    pub fn new(
        session_id: String,
        container_id: String,
        server_name: String,
        command: String,
        args: Vec<String>,
        working_dir: Option<String>,
        env: HashMap<String, String>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            session_id,
            container_id,
            server_name,
            command,
            args,
            working_dir,
            env,
            state: RwLock::new(SessionState::Initializing),
            last_activity: RwLock::new(Instant::now()),
            initialized: AtomicBool::new(false),
            child: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            inbound_rx: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Record that the MCP `initialize` handshake has passed through.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Relaxed);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: SessionState) {
        *self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }

    /// Flag an unrecoverable condition. Terminal states are never
    /// overwritten; after this only `stop` is legal.
    fn mark_error(&self) {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !matches!(*state, SessionState::Closing | SessionState::Closed) {
            *state = SessionState::Error;
        }
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    /// Whether the session has been inactive for longer than `max`.
    pub fn is_idle(&self, max: Duration) -> bool {
        self.last_activity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
            > max
    }

    /// Spawn the subprocess and install the three I/O tasks. On success
    /// the session becomes `active`; on failure it becomes `error` and
    /// no tasks are left running.
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.state() != SessionState::Initializing {
            return Err(SessionError::InvalidState(self.state()));
        }

        info!(
            "starting MCP server for session {} (container {}): {} {}",
            self.session_id,
            self.container_id,
            self.command,
            self.args.join(" ")
        );

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            // Parent environment stays visible; the per-session map overlays it.
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.mark_error();
                return Err(SessionError::Spawn(err.to_string()));
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(mut stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            self.mark_error();
            let _ = child.kill().await;
            return Err(SessionError::Spawn("failed to capture child stdio".to_string()));
        };

        let mut outbound_rx = match self.outbound_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                self.mark_error();
                let _ = child.kill().await;
                return Err(SessionError::InvalidState(SessionState::Error));
            }
        };

        let mut tasks = Vec::with_capacity(3);

        // Writer: outbound queue -> child stdin, newline-terminated.
        let writer_session = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(err) = stdin.write_all(frame.as_bytes()).await {
                    warn!(
                        "session {}: stdin write failed: {}",
                        writer_session.session_id, err
                    );
                    writer_session.mark_error();
                    break;
                }
                if let Err(err) = stdin.write_all(b"\n").await {
                    warn!(
                        "session {}: stdin write failed: {}",
                        writer_session.session_id, err
                    );
                    writer_session.mark_error();
                    break;
                }
                if let Err(err) = stdin.flush().await {
                    warn!(
                        "session {}: stdin flush failed: {}",
                        writer_session.session_id, err
                    );
                    writer_session.mark_error();
                    break;
                }
            }
            debug!("session stdin writer finished");
        }));

        // Reader: child stdout -> inbound queue, one frame per line.
        // Blank lines are skipped, surrounding whitespace trimmed.
        let reader_session = Arc::clone(self);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        if inbound_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(
                            "session {}: MCP server closed stdout",
                            reader_session.session_id
                        );
                        if reader_session.state() == SessionState::Active {
                            reader_session.mark_error();
                        }
                        break;
                    }
                    Err(err) => {
                        warn!(
                            "session {}: stdout read failed: {}",
                            reader_session.session_id, err
                        );
                        reader_session.mark_error();
                        break;
                    }
                }
            }
        }));

        // Stderr drain, log-only.
        let stderr_session_id = self.session_id.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("session {} stderr: {}", stderr_session_id, line);
            }
        }));

        *self.child.lock().await = Some(child);
        *self.tasks.lock().await = tasks;
        *self.inbound_rx.lock().await = Some(inbound_rx);
        self.set_state(SessionState::Active);
        self.touch();
        Ok(())
    }

    /// Enqueue a frame for the child. Does not wait for the write; the
    /// outbound queue provides the back-pressure.
    pub async fn send(&self, frame: &Value) -> Result<(), SessionError> {
        if self.state() != SessionState::Active {
            return Err(SessionError::InvalidState(self.state()));
        }
        self.touch();
        let serialized =
            serde_json::to_string(frame).map_err(|err| SessionError::Decode(err.to_string()))?;
        debug!("session {} -> {}", self.session_id, serialized);
        self.outbound_tx
            .send(serialized)
            .await
            .map_err(|_| SessionError::InvalidState(self.state()))
    }

    /// Pop the next frame from the child, parsed as JSON.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Value, SessionError> {
        if self.state() != SessionState::Active {
            return Err(SessionError::InvalidState(self.state()));
        }

        let mut guard = self.inbound_rx.lock().await;
        let Some(inbound) = guard.as_mut() else {
            return Err(SessionError::InvalidState(self.state()));
        };
        let line = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, inbound.recv())
                .await
                .map_err(|_| SessionError::Timeout)?,
            None => inbound.recv().await,
        };
        drop(guard);

        let line = line.ok_or_else(|| {
            // Inbound queue closed: the reader is gone and so is the child.
            self.mark_error();
            SessionError::InvalidState(self.state())
        })?;

        self.touch();
        debug!("session {} <- {}", self.session_id, line);
        serde_json::from_str(&line).map_err(|err| SessionError::Decode(err.to_string()))
    }

    /// Stop the session: cancel the I/O tasks, ask the child to exit by
    /// closing its stdin, force-kill after the grace period, and reap it.
    /// Idempotent.
    pub async fn stop(&self) {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.set_state(SessionState::Closing);
        info!("stopping MCP session {}", self.session_id);

        // Aborting the writer drops the child's stdin, which is the
        // graceful shutdown signal for a stdio MCP server.
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("session {} child exited with {}", self.session_id, status);
                }
                Ok(Err(err)) => {
                    warn!("session {}: wait failed: {}", self.session_id, err);
                }
                Err(_) => {
                    warn!(
                        "session {}: MCP server did not exit within {:?}, killing it",
                        self.session_id, STOP_GRACE
                    );
                    if let Err(err) = child.kill().await {
                        warn!("session {}: kill failed: {}", self.session_id, err);
                    }
                    let _ = child.wait().await;
                }
            }
        }

        // Drain whatever the reader had queued before it was cancelled.
        let mut guard = self.inbound_rx.lock().await;
        if let Some(inbound) = guard.as_mut() {
            while inbound.try_recv().is_ok() {}
        }
        drop(guard);

        self.set_state(SessionState::Closed);
        info!("MCP session {} stopped", self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unstarted_session() -> Arc<McpSession> {
        Arc::new(McpSession::new(
            "mcp-test".to_string(),
            "container-1".to_string(),
            "echo".to_string(),
            "true".to_string(),
            Vec::new(),
            None,
            HashMap::new(),
        ))
    }

    #[tokio::test]
    async fn test_send_requires_active_state() {
        let session = unstarted_session();
        let err = session.send(&json!({"jsonrpc": "2.0"})).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState(SessionState::Initializing)
        ));
    }

    #[tokio::test]
    async fn test_recv_requires_active_state() {
        let session = unstarted_session();
        let err = session.recv(None).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_spawn_failure_sets_error_state() {
        let session = Arc::new(McpSession::new(
            "mcp-test".to_string(),
            "container-1".to_string(),
            "missing".to_string(),
            "/nonexistent/mcp-server-binary".to_string(),
            Vec::new(),
            None,
            HashMap::new(),
        ));
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_terminal() {
        let session = unstarted_session();
        session.stop().await;
        assert_eq!(session.state(), SessionState::Closed);
        session.stop().await;
        assert_eq!(session.state(), SessionState::Closed);
        // A closed session cannot be driven back to active.
        assert!(session.start().await.is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_is_idle_threshold() {
        let session = unstarted_session();
        session.touch();
        assert!(!session.is_idle(Duration::from_secs(60)));
        assert!(session.is_idle(Duration::from_nanos(1)));
    }
}
